//! Output files describing what we geocoded, and what we couldn't.

use std::{collections::BTreeMap, path::Path};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::info;

use crate::{
    cache::GeocodeCache,
    files::write_json_atomically,
    geocoders::{FailureCategory, GeocodeResult, Status},
    Result,
};

/// Our successes, keyed by query. This is what gets bulk-loaded downstream.
pub type SuccessMap<'a> = BTreeMap<&'a str, &'a GeocodeResult>;

/// Our failures, partitioned by whether they're worth retrying.
#[derive(Debug, Default, Serialize)]
pub struct FailureMap<'a> {
    pub retryable: BTreeMap<&'a str, &'a GeocodeResult>,
    pub no_results: BTreeMap<&'a str, &'a GeocodeResult>,
    pub forbidden: BTreeMap<&'a str, &'a GeocodeResult>,
    pub other: BTreeMap<&'a str, &'a GeocodeResult>,
}

impl<'a> FailureMap<'a> {
    fn bucket_mut(
        &mut self,
        category: FailureCategory,
    ) -> &mut BTreeMap<&'a str, &'a GeocodeResult> {
        match category {
            FailureCategory::Retryable => &mut self.retryable,
            FailureCategory::NoResults => &mut self.no_results,
            FailureCategory::Forbidden => &mut self.forbidden,
            FailureCategory::Other => &mut self.other,
        }
    }

    pub fn bucket(&self, category: FailureCategory) -> &BTreeMap<&'a str, &'a GeocodeResult> {
        match category {
            FailureCategory::Retryable => &self.retryable,
            FailureCategory::NoResults => &self.no_results,
            FailureCategory::Forbidden => &self.forbidden,
            FailureCategory::Other => &self.other,
        }
    }

    pub fn len(&self) -> usize {
        FailureCategory::iter()
            .map(|category| self.bucket(category).len())
            .sum()
    }
}

/// Split the cached results for `queries` into successes and failures.
/// Queries we have never attempted appear in neither.
pub fn partition_results<'a>(
    queries: &'a [String],
    cache: &'a GeocodeCache,
) -> (SuccessMap<'a>, FailureMap<'a>) {
    let mut successes = SuccessMap::new();
    let mut failures = FailureMap::default();
    for query in queries {
        let Some(result) = cache.peek(query) else {
            continue;
        };
        match result.outcome.failure_category() {
            None => {
                successes.insert(query, result);
            }
            Some(category) => {
                failures.bucket_mut(category).insert(query, result);
            }
        }
    }
    (successes, failures)
}

/// The final summary of a run.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    /// Did we finish every pending query, or were we interrupted?
    pub completed: bool,
    /// Unique queries in our input.
    pub queries: usize,
    /// Queries that needed geocoding at the start of this run.
    pub pending: usize,
    /// Queries we sent to the geocoder during this run.
    pub geocoded_this_run: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Queries we have never attempted.
    pub not_attempted: usize,
    /// Every attempted query, by status.
    pub by_status: BTreeMap<Status, usize>,
    /// Failed queries, by report bucket.
    pub failures_by_category: BTreeMap<String, usize>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    /// Log a human-readable version of this summary.
    pub fn log(&self) {
        info!(
            "{}: {} queries, {} succeeded, {} failed, {} not attempted ({} geocoded this run in {:.1}s)",
            if self.completed { "completed" } else { "interrupted" },
            self.queries,
            self.succeeded,
            self.failed,
            self.not_attempted,
            self.geocoded_this_run,
            self.elapsed_secs,
        );
        for (category, count) in &self.failures_by_category {
            if *count > 0 {
                info!("  {}: {}", category, count);
            }
        }
        if self.failures_by_category.get("retryable").copied().unwrap_or(0) > 0 {
            info!("  (run again to retry the retryable failures)");
        }
    }
}

/// Statistics about this run which can't be derived from the cache.
pub struct RunStats {
    pub completed: bool,
    pub pending: usize,
    pub geocoded_this_run: usize,
    pub started_at: DateTime<Utc>,
}

/// Build a summary of `queries`, based on what's in `cache`.
pub fn summarize(
    queries: &[String],
    cache: &GeocodeCache,
    successes: &SuccessMap<'_>,
    failures: &FailureMap<'_>,
    stats: RunStats,
) -> RunSummary {
    let mut by_status = BTreeMap::new();
    for result in successes
        .values()
        .chain(FailureCategory::iter().flat_map(|c| failures.bucket(c).values()))
    {
        *by_status.entry(result.status()).or_insert(0) += 1;
    }
    let failures_by_category = FailureCategory::iter()
        .map(|category| (category.to_string(), failures.bucket(category).len()))
        .collect();
    let cache_stats = cache.stats();
    let finished_at = Utc::now();
    RunSummary {
        completed: stats.completed,
        queries: queries.len(),
        pending: stats.pending,
        geocoded_this_run: stats.geocoded_this_run,
        succeeded: successes.len(),
        failed: failures.len(),
        not_attempted: queries.len() - successes.len() - failures.len(),
        by_status,
        failures_by_category,
        cache_hits: cache_stats.hits,
        cache_misses: cache_stats.misses,
        started_at: stats.started_at,
        finished_at,
        elapsed_secs: (finished_at - stats.started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64(),
    }
}

/// Write our success and failure maps.
pub fn write_result_maps(
    success_path: &Path,
    failure_path: &Path,
    successes: &SuccessMap<'_>,
    failures: &FailureMap<'_>,
) -> Result<()> {
    write_json_atomically(success_path, successes, true)?;
    write_json_atomically(failure_path, failures, true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocoders::Outcome;

    #[test]
    fn partitions_and_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = GeocodeCache::load(&dir.path().join("cache.json"));
        let queries = ["A", "B", "C", "D", "E", "F"]
            .iter()
            .map(|q| q.to_string())
            .collect::<Vec<_>>();
        cache.set(
            "A".to_owned(),
            GeocodeResult::new(
                Outcome::Success {
                    lat: 1.0,
                    lon: 2.0,
                    display_name: None,
                },
                "t",
            ),
        );
        cache.set("B".to_owned(), GeocodeResult::new(Outcome::RateLimited, "t"));
        cache.set("C".to_owned(), GeocodeResult::new(Outcome::NoResults, "t"));
        cache.set("D".to_owned(), GeocodeResult::new(Outcome::Forbidden, "t"));
        cache.set(
            "E".to_owned(),
            GeocodeResult::new(Outcome::HttpError { http_status: 404 }, "t"),
        );
        // Not in our query list, so it must not show up.
        cache.set("Z".to_owned(), GeocodeResult::new(Outcome::NoResults, "t"));

        let (successes, failures) = partition_results(&queries, &cache);
        assert_eq!(successes.keys().copied().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(failures.retryable.keys().copied().collect::<Vec<_>>(), vec!["B"]);
        assert_eq!(failures.no_results.keys().copied().collect::<Vec<_>>(), vec!["C"]);
        assert_eq!(failures.forbidden.keys().copied().collect::<Vec<_>>(), vec!["D"]);
        assert_eq!(failures.other.keys().copied().collect::<Vec<_>>(), vec!["E"]);

        let summary = summarize(
            &queries,
            &cache,
            &successes,
            &failures,
            RunStats {
                completed: true,
                pending: 5,
                geocoded_this_run: 5,
                started_at: Utc::now(),
            },
        );
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 4);
        assert_eq!(summary.not_attempted, 1);
        assert_eq!(summary.by_status[&Status::RateLimited], 1);
        assert_eq!(summary.failures_by_category["other"], 1);

        let json = serde_json::to_value(&failures).unwrap();
        assert_eq!(json["no_results"]["C"]["status"], "no_results");
    }
}
