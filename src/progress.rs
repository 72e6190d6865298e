//! Checkpointed progress for a long-running geocoding job.

use std::{path::Path, time::Duration};

use anyhow::{format_err, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{
    files::{read_json, remove_if_exists, write_json_atomically},
    geocoders::GeocodeResult,
    Result,
};

/// Progress through a geocoding job, saved so that an interrupted job can
/// pick up where it left off.
///
/// A job may span several runs of the program. `total` is fixed when the job
/// starts, and the counters accumulate across runs.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BatchProgress {
    /// Identifies the query list this job is working on. See
    /// [`digest_queries`].
    pub input_digest: String,
    /// Number of queries that needed geocoding when the job started.
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Offset into the job's pending queries up to which every batch has
    /// completed.
    pub last_index: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_saved_at: Option<DateTime<Utc>>,
}

impl BatchProgress {
    /// Start a new job.
    pub fn new(input_digest: String, total: usize) -> BatchProgress {
        BatchProgress {
            input_digest,
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            last_index: 0,
            started_at: Utc::now(),
            last_saved_at: None,
        }
    }

    /// Load a saved checkpoint, if there is one.
    ///
    /// Unlike our cache, a checkpoint we can't read is a fatal error: if we
    /// guessed, we might skip or repeat work without noticing.
    pub fn load(path: &Path) -> Result<Option<BatchProgress>> {
        read_json(path)
            .with_context(|| format_err!("could not read checkpoint {}", path.display()))
    }

    /// Resume the job saved at `path`, if there is one and it is working on
    /// the query list identified by `input_digest`.
    pub fn resume(path: &Path, input_digest: &str) -> Result<Option<BatchProgress>> {
        match BatchProgress::load(path)? {
            Some(progress) if progress.input_digest == input_digest => {
                info!(
                    "resuming job started at {}: {}/{} processed ({} succeeded, {} failed)",
                    progress.started_at,
                    progress.processed,
                    progress.total,
                    progress.succeeded,
                    progress.failed,
                );
                Ok(Some(progress))
            }
            Some(_) => {
                warn!(
                    "checkpoint {} belongs to a different query list, starting a new job",
                    path.display()
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Count a new result.
    pub fn record(&mut self, result: &GeocodeResult) {
        self.processed += 1;
        if result.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Queries we expect still need processing.
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }

    /// Estimate how long the rest of the job will take, given that we
    /// processed `processed_this_run` queries in `elapsed`.
    pub fn eta(&self, processed_this_run: usize, elapsed: Duration) -> Option<Duration> {
        if processed_this_run == 0 {
            return None;
        }
        let per_query = elapsed.as_secs_f64() / processed_this_run as f64;
        Some(Duration::from_secs_f64(per_query * self.remaining() as f64))
    }

    /// Save a checkpoint.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.last_saved_at = Some(Utc::now());
        write_json_atomically(path, self, true)
            .with_context(|| format_err!("could not save checkpoint {}", path.display()))
    }

    /// Remove a saved checkpoint once a job is done.
    pub fn clear(path: &Path) -> Result<()> {
        remove_if_exists(path)
            .with_context(|| format_err!("could not clear checkpoint {}", path.display()))
    }
}

/// Compute a digest identifying a list of queries.
pub fn digest_queries<S: AsRef<str>>(queries: &[S]) -> String {
    let mut hasher = Sha256::new();
    for query in queries {
        hasher.update(query.as_ref().as_bytes());
        hasher.update([0]);
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocoders::Outcome;

    #[test]
    fn digest_depends_on_order_and_boundaries() {
        let a = digest_queries(&["A", "B"]);
        assert_eq!(a.len(), 64);
        assert_eq!(a, digest_queries(&["A".to_owned(), "B".to_owned()]));
        assert_ne!(a, digest_queries(&["B", "A"]));
        assert_ne!(a, digest_queries(&["AB"]));
    }

    #[test]
    fn records_results() {
        let mut progress = BatchProgress::new("x".to_owned(), 3);
        progress.record(&GeocodeResult::new(
            Outcome::Success {
                lat: 1.0,
                lon: 2.0,
                display_name: None,
            },
            "t",
        ));
        progress.record(&GeocodeResult::new(Outcome::Timeout, "t"));
        assert_eq!(progress.processed, 2);
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.remaining(), 1);
        assert_eq!(
            progress.eta(2, Duration::from_secs(4)),
            Some(Duration::from_secs(2))
        );
        assert_eq!(progress.eta(0, Duration::from_secs(4)), None);
    }

    #[test]
    fn resumes_only_matching_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        assert!(BatchProgress::resume(&path, "abc").unwrap().is_none());

        let mut progress = BatchProgress::new("abc".to_owned(), 10);
        progress.processed = 4;
        progress.save(&path).unwrap();
        assert!(progress.last_saved_at.is_some());

        let resumed = BatchProgress::resume(&path, "abc").unwrap().unwrap();
        assert_eq!(resumed, progress);
        assert_eq!(resumed.remaining(), 6);

        assert!(BatchProgress::resume(&path, "def").unwrap().is_none());

        BatchProgress::clear(&path).unwrap();
        assert!(BatchProgress::load(&path).unwrap().is_none());
    }

    #[test]
    fn corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(BatchProgress::resume(&path, "abc").is_err());
    }
}
