//! A persistent cache of geocoding results, stored as a single JSON file.
//!
//! The cache is our only record of which queries have been attempted. Losing
//! it costs us time and API quota, but never correctness, because geocoding
//! the same query twice gives the same answer.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{format_err, Context};
use metrics::{counter, describe_counter};
use tracing::{debug, info, instrument, warn};

use crate::{
    files::{read_json, write_json_atomically},
    geocoders::GeocodeResult,
    Result,
};

/// Cache hit and miss counts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Map from normalized query to our most recent result for that query.
pub struct GeocodeCache {
    /// Where we store our entries.
    path: PathBuf,

    /// Our entries. A `BTreeMap` keeps our file output stable.
    entries: BTreeMap<String, GeocodeResult>,

    /// Have we changed since the last `save`?
    dirty: bool,

    hits: u64,
    misses: u64,
}

impl GeocodeCache {
    /// Load the cache stored at `path`.
    ///
    /// A missing, unreadable or corrupt file gives us an empty cache. We log
    /// a warning for the latter two, because it means redoing work.
    #[instrument(level = "debug")]
    pub fn load(path: &Path) -> GeocodeCache {
        describe_counter!("ticketgeocode.cache_hits.total", "Queries found in cache");
        describe_counter!(
            "ticketgeocode.cache_misses.total",
            "Queries not found in cache"
        );

        let entries = match read_json::<BTreeMap<String, GeocodeResult>>(path) {
            Ok(Some(entries)) => {
                info!("loaded {} cached results from {}", entries.len(), path.display());
                entries
            }
            Ok(None) => {
                debug!("no cache at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(err) => {
                warn!("ignoring unusable cache (starting empty): {:#}", err);
                BTreeMap::new()
            }
        };
        GeocodeCache {
            path: path.to_owned(),
            entries,
            dirty: false,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up `query`, counting a hit or a miss.
    ///
    /// Cached failures count as hits. It's up to the caller to decide
    /// whether they're worth retrying.
    pub fn get(&mut self, query: &str) -> Option<&GeocodeResult> {
        let found = self.entries.get(query);
        if let Some(result) = found {
            self.hits += 1;
            counter!("ticketgeocode.cache_hits.total", 1, "status" => result.status().to_string());
        } else {
            self.misses += 1;
            counter!("ticketgeocode.cache_misses.total", 1);
        }
        found
    }

    /// Look up `query` without touching our statistics.
    pub fn peek(&self, query: &str) -> Option<&GeocodeResult> {
        self.entries.get(query)
    }

    /// Record `result` as our latest result for `query`.
    pub fn set(&mut self, query: String, result: GeocodeResult) {
        self.entries.insert(query, result);
        self.dirty = true;
    }

    /// Write our entries to disk, if anything has changed. Returns true if we
    /// actually wrote something.
    pub fn save(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        write_json_atomically(&self.path, &self.entries, false).with_context(|| {
            format_err!("could not save geocoding cache to {}", self.path.display())
        })?;
        self.dirty = false;
        debug!("saved {} cached results to {}", self.entries.len(), self.path.display());
        Ok(true)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
