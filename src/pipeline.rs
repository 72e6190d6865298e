//! The batch geocoding pipeline.

use std::{
    collections::HashSet,
    future::Future,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{format_err, Context};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use metrics::{counter, describe_counter};
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::GeocodeCache,
    files::{read_json, write_json_atomically},
    geocoders::Geocoder,
    progress::{digest_queries, BatchProgress},
    report::{partition_results, summarize, write_result_maps, RunStats, RunSummary},
    Result,
};

/// Where a job keeps its state and writes its results.
#[derive(Clone, Debug)]
pub struct OutputPaths {
    pub cache: PathBuf,
    pub success: PathBuf,
    pub failures: PathBuf,
    pub progress: PathBuf,
    pub summary: PathBuf,
}

impl OutputPaths {
    /// Use the standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> OutputPaths {
        OutputPaths {
            cache: dir.join("geocode_cache.json"),
            success: dir.join("geocode_success.json"),
            failures: dir.join("geocode_failures.json"),
            progress: dir.join("geocode_progress.json"),
            summary: dir.join("geocode_summary.json"),
        }
    }
}

/// Tuning knobs for `PipelineRunner`.
#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    /// How many queries we log and checkpoint progress for at a time.
    pub batch_size: usize,
    /// Save our cache and progress after this many results.
    pub checkpoint_interval: usize,
    /// How many queries we hand to our geocoder at once. The geocoder does
    /// its own rate limiting, so this only needs to be large enough to keep
    /// it busy.
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            batch_size: 25,
            checkpoint_interval: 100,
            concurrency: 1,
        }
    }
}

/// Read a JSON array of queries, dropping duplicates but keeping the first
/// occurrence of each in order.
pub fn load_queries(path: &Path) -> Result<Vec<String>> {
    let raw: Vec<String> = read_json(path)?
        .ok_or_else(|| format_err!("query list {} does not exist", path.display()))?;
    let queries = dedup_queries(raw);
    info!("loaded {} unique queries from {}", queries.len(), path.display());
    Ok(queries)
}

/// Remove duplicate queries, keeping first-seen order.
pub fn dedup_queries(raw: Vec<String>) -> Vec<String> {
    let count = raw.len();
    let mut seen = HashSet::with_capacity(count);
    let queries = raw
        .into_iter()
        .filter(|q| seen.insert(q.clone()))
        .collect::<Vec<_>>();
    if queries.len() < count {
        debug!("dropped {} duplicate queries", count - queries.len());
    }
    queries
}

/// Drives a geocoding job: decides what needs geocoding, sends it to our
/// geocoder, and records everything that comes back.
pub struct PipelineRunner {
    geocoder: Box<dyn Geocoder>,
    cache: GeocodeCache,
    paths: OutputPaths,
    config: PipelineConfig,
}

impl PipelineRunner {
    pub fn new(
        geocoder: Box<dyn Geocoder>,
        cache: GeocodeCache,
        paths: OutputPaths,
        config: PipelineConfig,
    ) -> PipelineRunner {
        describe_counter!(
            "ticketgeocode.checkpoints.total",
            "Times we saved our cache and progress"
        );
        describe_counter!(
            "ticketgeocode.batches.total",
            "Batches of queries completed"
        );
        PipelineRunner {
            geocoder,
            cache,
            paths,
            config: PipelineConfig {
                batch_size: config.batch_size.max(1),
                checkpoint_interval: config.checkpoint_interval.max(1),
                concurrency: config.concurrency.max(1),
            },
        }
    }

    /// Geocode every query in `queries` which we don't already have a usable
    /// result for.
    ///
    /// If `shutdown` completes first, we stop sending requests, save
    /// everything we've got, and return a summary with `completed: false`.
    /// Requests which are still in flight are dropped, and will be sent
    /// again by the next run.
    #[instrument(level = "debug", skip_all, fields(queries = queries.len()))]
    pub async fn run<S>(&mut self, queries: &[String], shutdown: S) -> Result<RunSummary>
    where
        S: Future<Output = ()>,
    {
        let run_started_at = Utc::now();
        let PipelineRunner {
            geocoder,
            cache,
            paths,
            config,
        } = self;

        let digest = digest_queries(queries);
        let resumed = BatchProgress::resume(&paths.progress, &digest)?;
        let pending = pending_queries(
            cache,
            queries,
            resumed.as_ref().map(|progress| progress.started_at),
        );
        let mut progress =
            resumed.unwrap_or_else(|| BatchProgress::new(digest, pending.len()));
        info!(
            "{} of {} queries need geocoding with {} ({} results cached)",
            pending.len(),
            queries.len(),
            geocoder.tag(),
            cache.len(),
        );

        let started = Instant::now();
        let batch_count = (pending.len() + config.batch_size - 1) / config.batch_size;
        let mut processed_this_run = 0;
        let mut since_checkpoint = 0;
        let mut interrupted = false;
        tokio::pin!(shutdown);

        for (batch_idx, batch) in pending.chunks(config.batch_size).enumerate() {
            let geocoder = &*geocoder;
            let mut results = stream::iter(batch.iter())
                .map(|&query| async move { (query, geocoder.geocode(query).await) })
                .buffer_unordered(config.concurrency);
            loop {
                tokio::select! {
                    next = results.next() => match next {
                        Some((query, result)) => {
                            debug!("{:?}: {}", query, result);
                            progress.record(&result);
                            cache.set(query.to_owned(), result);
                            processed_this_run += 1;
                            since_checkpoint += 1;
                            if since_checkpoint >= config.checkpoint_interval {
                                checkpoint(cache, &mut progress, &paths.progress)?;
                                since_checkpoint = 0;
                            }
                        }
                        None => break,
                    },
                    _ = &mut shutdown => {
                        interrupted = true;
                        break;
                    }
                }
            }
            if interrupted {
                warn!("interrupted, saving progress");
                break;
            }

            progress.last_index += batch.len();
            counter!("ticketgeocode.batches.total", 1);
            log_batch(&progress, batch_idx + 1, batch_count, processed_this_run, started.elapsed());
        }

        cache.save()?;
        if interrupted {
            progress.save(&paths.progress)?;
        } else {
            BatchProgress::clear(&paths.progress)?;
        }

        let (successes, failures) = partition_results(queries, cache);
        write_result_maps(&paths.success, &paths.failures, &successes, &failures)?;
        let summary = summarize(
            queries,
            cache,
            &successes,
            &failures,
            RunStats {
                completed: !interrupted,
                pending: pending.len(),
                geocoded_this_run: processed_this_run,
                started_at: run_started_at,
            },
        );
        write_json_atomically(&paths.summary, &summary, true)
            .with_context(|| format_err!("could not write summary"))?;
        Ok(summary)
    }
}

/// Which of `queries` should we send to our geocoder?
///
/// We skip anything we have a terminal result for. Retryable failures are
/// retried, unless they were recorded by the job we're resuming (which
/// started at `resumed_job_started_at`). Those wait for the next job, so an
/// interrupted job never repeats its own work.
fn pending_queries<'a>(
    cache: &mut GeocodeCache,
    queries: &'a [String],
    resumed_job_started_at: Option<DateTime<Utc>>,
) -> Vec<&'a str> {
    queries
        .iter()
        .filter(|query| match cache.get(query) {
            None => true,
            Some(result) if result.is_retryable() => match resumed_job_started_at {
                Some(started_at) => result.timestamp < started_at,
                None => true,
            },
            Some(_) => false,
        })
        .map(|query| query.as_str())
        .collect()
}

/// Save our cache, then our progress. In that order, so our progress never
/// claims results we don't have.
fn checkpoint(cache: &mut GeocodeCache, progress: &mut BatchProgress, path: &Path) -> Result<()> {
    cache.save()?;
    progress.save(path)?;
    counter!("ticketgeocode.checkpoints.total", 1);
    debug!("checkpointed at {}/{}", progress.processed, progress.total);
    Ok(())
}

fn log_batch(
    progress: &BatchProgress,
    batch: usize,
    batch_count: usize,
    processed_this_run: usize,
    elapsed: Duration,
) {
    let rate = if elapsed.is_zero() {
        0.0
    } else {
        processed_this_run as f64 / elapsed.as_secs_f64()
    };
    let eta = progress
        .eta(processed_this_run, elapsed)
        .map(format_duration)
        .unwrap_or_else(|| "unknown".to_owned());
    info!(
        "batch {}/{}: {}/{} processed ({} succeeded, {} failed), {:.2} queries/sec, ETA {}",
        batch,
        batch_count,
        progress.processed,
        progress.total,
        progress.succeeded,
        progress.failed,
        rate,
        eta,
    );
}

/// Format a duration as `1h02m03s`.
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);
    if hours > 0 {
        format!("{}h{:02}m{:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
