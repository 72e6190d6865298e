//! A rate-limited, retrying client for a single geocoding provider.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, describe_counter};
use tokio::time::timeout;
use tracing::{instrument, trace, warn};

use crate::http::{HttpFetcher, HttpResponse};

use super::{
    backends::Backend, rate_limit::RateLimit, retry::RetryPolicy, GeocodeResult,
    Geocoder, Outcome,
};

/// Geocodes queries using a [`Backend`], turning every kind of failure into
/// an [`Outcome`].
///
/// This never looks at our cache. Deciding what needs to be geocoded, and
/// recording the results, is the caller's job.
pub struct ProviderClient {
    backend: Box<dyn Backend>,
    fetcher: Arc<dyn HttpFetcher>,
    rate_limit: RateLimit,
    retry: RetryPolicy,
    /// How long we wait for a single request.
    request_timeout: Duration,
}

impl ProviderClient {
    pub fn new(
        backend: Box<dyn Backend>,
        fetcher: Arc<dyn HttpFetcher>,
        rate_limit: RateLimit,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> ProviderClient {
        describe_counter!(
            "ticketgeocode.queries_geocoded.total",
            "Queries sent to a geocoding provider, by final status"
        );
        describe_counter!(
            "ticketgeocode.requests_retried.total",
            "Geocoding requests retried after a transient failure"
        );
        ProviderClient {
            backend,
            fetcher,
            rate_limit,
            retry,
            request_timeout,
        }
    }

    /// Resolve `query`, retrying transient failures according to our
    /// `RetryPolicy`.
    #[instrument(
        name = "ProviderClient::resolve",
        level = "debug",
        skip(self),
        fields(provider = self.backend.tag())
    )]
    pub async fn resolve(&self, query: &str) -> GeocodeResult {
        let (outcome, attempts) = self
            .retry
            .run(Outcome::is_retryable, |attempt| self.attempt(query, attempt))
            .await;

        let status = outcome.status();
        if attempts > 1 {
            counter!("ticketgeocode.requests_retried.total", u64::from(attempts - 1), "geocoder" => self.backend.tag().to_owned());
        }
        counter!("ticketgeocode.queries_geocoded.total", 1, "geocoder" => self.backend.tag().to_owned(), "status" => status.to_string());
        trace!("{:?} resolved as {} after {} attempts", query, status, attempts);

        GeocodeResult {
            outcome,
            source: self.backend.tag().to_owned(),
            timestamp: Utc::now(),
            attempts,
        }
    }

    /// Make a single request.
    async fn attempt(&self, query: &str, attempt: u32) -> Outcome {
        let url = match self.backend.request_url(query) {
            Ok(url) => url,
            Err(err) => {
                return Outcome::Exception {
                    message: format!("could not build request URL: {:#}", err),
                }
            }
        };

        let response = self
            .rate_limit
            .run(|| timeout(self.request_timeout, self.fetcher.get(&url)))
            .await;
        let outcome = match response {
            Err(_elapsed) => Outcome::Timeout,
            Ok(Err(err)) => Outcome::Exception {
                message: format!("{:#}", err),
            },
            Ok(Ok(response)) => classify_response(self.backend.as_ref(), &response),
        };

        match &outcome {
            Outcome::Forbidden => warn!(
                "{} refused our request with 403 Forbidden (check the API key)",
                self.backend.tag()
            ),
            other if other.is_retryable() => trace!(
                "attempt {} for {:?} failed: {}",
                attempt,
                query,
                other.status()
            ),
            _ => {}
        }
        outcome
    }
}

#[async_trait]
impl Geocoder for ProviderClient {
    fn tag(&self) -> &str {
        self.backend.tag()
    }

    async fn geocode(&self, query: &str) -> GeocodeResult {
        self.resolve(query).await
    }
}

/// Decide what an HTTP response means.
pub fn classify_response(backend: &dyn Backend, response: &HttpResponse) -> Outcome {
    match response.status {
        200..=299 => match backend.parse_response(&response.body) {
            Ok(Some(candidate)) => Outcome::Success {
                lat: candidate.lat,
                lon: candidate.lon,
                display_name: candidate.display_name,
            },
            Ok(None) => Outcome::NoResults,
            Err(err) => Outcome::Exception {
                message: format!("{:#}", err),
            },
        },
        403 => Outcome::Forbidden,
        429 => Outcome::RateLimited,
        408 | 504 => Outcome::Timeout,
        http_status => Outcome::HttpError { http_status },
    }
}
