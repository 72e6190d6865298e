//! Fallback geocoder. Ask a second provider about anything the first one has
//! never heard of.

use async_trait::async_trait;
use metrics::{counter, describe_counter};
use tracing::trace;

use crate::geocoders::{GeocodeResult, Geocoder, Outcome};

/// A geocoder that runs a second geocoder when the first one finds nothing.
pub struct Fallback {
    /// The geocoder we try first.
    primary: Box<dyn Geocoder>,

    /// The geocoder we try when `primary` returns `NoResults`.
    secondary: Box<dyn Geocoder>,

    /// `"{primary}+{secondary}"`.
    tag: String,
}

impl Fallback {
    /// Create a new geocoder which falls back from `primary` to `secondary`.
    ///
    /// We only fall back on `NoResults`. Transient failures are better
    /// handled by retrying the primary on a later run, and a `Forbidden`
    /// primary needs a human to look at it.
    pub fn new(primary: Box<dyn Geocoder>, secondary: Box<dyn Geocoder>) -> Fallback {
        describe_counter!(
            "ticketgeocode.fallbacks.total",
            "Queries passed to the fallback geocoder"
        );
        let tag = format!("{}+{}", primary.tag(), secondary.tag());
        Fallback {
            primary,
            secondary,
            tag,
        }
    }
}

#[async_trait]
impl Geocoder for Fallback {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn geocode(&self, query: &str) -> GeocodeResult {
        let first = self.primary.geocode(query).await;
        if first.outcome != Outcome::NoResults {
            return first;
        }

        trace!("falling back to {} for {:?}", self.secondary.tag(), query);
        counter!("ticketgeocode.fallbacks.total", 1, "geocoder" => self.secondary.tag().to_owned());
        let mut second = self.secondary.geocode(query).await;
        second.attempts += first.attempts;
        second
    }
}
