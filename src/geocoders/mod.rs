//! Geocoding backends, and the result types they share.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

pub mod backends;
pub mod client;
pub mod fallback;
pub mod rate_limit;
pub mod retry;

/// The status tag of a `GeocodeResult`.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Success,
    NoResults,
    RateLimited,
    Timeout,
    HttpError,
    Forbidden,
    Exception,
}

/// What happened when we tried to geocode a query.
///
/// Only `Success` carries coordinates, so a result "has coordinates" exactly
/// when it is a success.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// We found a location. These are the provider's first (best) candidate.
    Success {
        lat: f64,
        lon: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    /// The provider understood the query, but knows no such place.
    NoResults,
    /// HTTP 429, even after backing off.
    RateLimited,
    /// The request did not finish in time.
    Timeout,
    /// Any HTTP status we don't handle more specifically.
    HttpError { http_status: u16 },
    /// HTTP 403. Usually a bad API key.
    Forbidden,
    /// Anything else: connection failures, unparseable responses.
    Exception { message: String },
}

impl Outcome {
    /// The status tag for this outcome.
    pub fn status(&self) -> Status {
        match self {
            Outcome::Success { .. } => Status::Success,
            Outcome::NoResults => Status::NoResults,
            Outcome::RateLimited => Status::RateLimited,
            Outcome::Timeout => Status::Timeout,
            Outcome::HttpError { .. } => Status::HttpError,
            Outcome::Forbidden => Status::Forbidden,
            Outcome::Exception { .. } => Status::Exception,
        }
    }

    /// Could trying this query again plausibly produce a different outcome?
    ///
    /// Server errors are transient, but other 4xx errors mean that the
    /// provider rejected our request, and it will keep doing so.
    pub fn is_retryable(&self) -> bool {
        match self {
            Outcome::RateLimited | Outcome::Timeout | Outcome::Exception { .. } => true,
            Outcome::HttpError { http_status } => *http_status >= 500,
            Outcome::Success { .. } | Outcome::NoResults | Outcome::Forbidden => false,
        }
    }

    /// Which bucket of our failure report does this belong in? Returns `None`
    /// for successes.
    pub fn failure_category(&self) -> Option<FailureCategory> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::NoResults => Some(FailureCategory::NoResults),
            Outcome::Forbidden => Some(FailureCategory::Forbidden),
            other if other.is_retryable() => Some(FailureCategory::Retryable),
            _ => Some(FailureCategory::Other),
        }
    }
}

/// How we partition failures in our output.
#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumIter, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
#[strum(serialize_all = "snake_case")]
pub enum FailureCategory {
    Retryable,
    NoResults,
    Forbidden,
    Other,
}

/// The result of trying to geocode a single query.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GeocodeResult {
    #[serde(flatten)]
    pub outcome: Outcome,
    /// The tag of the geocoder which produced this result.
    pub source: String,
    /// When we produced this result.
    pub timestamp: DateTime<Utc>,
    /// The number of requests we made to get this result.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl GeocodeResult {
    /// Create a new result, timestamped now.
    pub fn new(outcome: Outcome, source: &str) -> GeocodeResult {
        GeocodeResult {
            outcome,
            source: source.to_owned(),
            timestamp: Utc::now(),
            attempts: 1,
        }
    }

    /// Shorthand for `self.outcome.status()`.
    pub fn status(&self) -> Status {
        self.outcome.status()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn is_retryable(&self) -> bool {
        self.outcome.is_retryable()
    }
}

impl fmt::Display for GeocodeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Success { lat, lon, .. } => {
                write!(f, "success ({}, {}) via {}", lat, lon, self.source)
            }
            Outcome::HttpError { http_status } => {
                write!(f, "http_error {} via {}", http_status, self.source)
            }
            Outcome::Exception { message } => {
                write!(f, "exception via {}: {}", self.source, message)
            }
            other => write!(f, "{} via {}", other.status(), self.source),
        }
    }
}

/// Abstract geocoding interface.
///
/// Geocoders never fail. Every problem we can have while talking to a
/// provider is turned into an `Outcome` and returned.
#[async_trait]
pub trait Geocoder: Send + Sync + 'static {
    /// A short name for this geocoder, like `nominatim`. Recorded as the
    /// `source` of our results.
    fn tag(&self) -> &str;

    /// Geocode a single normalized query.
    async fn geocode(&self, query: &str) -> GeocodeResult;
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn serializes_flat_success() {
        let result = GeocodeResult {
            outcome: Outcome::Success {
                lat: 43.7,
                lon: -79.5,
                display_name: Some("Keele Street".to_owned()),
            },
            source: "nominatim".to_owned(),
            timestamp: "2024-05-01T12:00:00Z".parse().unwrap(),
            attempts: 1,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "success",
                "lat": 43.7,
                "lon": -79.5,
                "display_name": "Keele Street",
                "source": "nominatim",
                "timestamp": "2024-05-01T12:00:00Z",
                "attempts": 1,
            })
        );
        let parsed: GeocodeResult = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn deserializes_failure_without_attempts() {
        let parsed: GeocodeResult = serde_json::from_value(json!({
            "status": "http_error",
            "http_status": 502,
            "source": "geocodio",
            "timestamp": "2024-05-01T12:00:00Z",
        }))
        .unwrap();
        assert_eq!(parsed.outcome, Outcome::HttpError { http_status: 502 });
        assert_eq!(parsed.attempts, 1);
        assert!(parsed.is_retryable());
    }

    #[test]
    fn success_if_and_only_if_coordinates() {
        let outcomes = vec![
            Outcome::Success {
                lat: 1.0,
                lon: 2.0,
                display_name: None,
            },
            Outcome::NoResults,
            Outcome::RateLimited,
            Outcome::Timeout,
            Outcome::HttpError { http_status: 500 },
            Outcome::Forbidden,
            Outcome::Exception {
                message: "boom".to_owned(),
            },
        ];
        // Make sure we've covered every status.
        assert_eq!(outcomes.len(), Status::iter().count());
        for outcome in outcomes {
            let value = serde_json::to_value(GeocodeResult::new(outcome, "t")).unwrap();
            let has_coordinates = value.get("lat").is_some() && value.get("lon").is_some();
            assert_eq!(value["status"] == "success", has_coordinates, "{}", value);
        }
    }

    #[test]
    fn failure_categories() {
        assert_eq!(
            Outcome::RateLimited.failure_category(),
            Some(FailureCategory::Retryable)
        );
        assert_eq!(
            Outcome::HttpError { http_status: 503 }.failure_category(),
            Some(FailureCategory::Retryable)
        );
        assert_eq!(
            Outcome::HttpError { http_status: 400 }.failure_category(),
            Some(FailureCategory::Other)
        );
        assert_eq!(
            Outcome::NoResults.failure_category(),
            Some(FailureCategory::NoResults)
        );
        assert_eq!(
            Outcome::Forbidden.failure_category(),
            Some(FailureCategory::Forbidden)
        );
        assert!(!Outcome::Forbidden.is_retryable());
        assert!(!Outcome::NoResults.is_retryable());
    }

    #[test]
    fn status_names() {
        assert_eq!(Status::NoResults.to_string(), "no_results");
        assert_eq!(Status::HttpError.as_ref(), "http_error");
        assert_eq!(FailureCategory::NoResults.as_ref(), "no_results");
    }
}
