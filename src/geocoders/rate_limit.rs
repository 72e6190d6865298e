//! Limits on how hard we hit a geocoding provider.

use std::{future::Future, time::Duration};

use anyhow::format_err;
use leaky_bucket::RateLimiter;
use tokio::{sync::Semaphore, time::sleep};
use tracing::{trace_span, warn, Instrument};

use crate::Result;

/// Limits both the number of requests in flight and the rate at which
/// requests start.
///
/// Every request must hold one of `max_in_flight` semaphore permits, and must
/// take a token from a bucket that holds at most one token and refills once
/// per `1 / requests_per_second`. So no matter how many tasks are waiting, we
/// can never start more than `requests_per_second` requests in any second.
/// We also never allow more slots than `default_max_in_flight` gives for our
/// rate, so slow responses can't pile up more than one second's worth of
/// requests.
pub struct RateLimit {
    /// One permit per request slot.
    in_flight: Semaphore,

    /// Paces request starts.
    starts: RateLimiter,

    /// How long a slot stays occupied after its request finishes.
    min_delay: Duration,
}

impl RateLimit {
    pub fn new(
        requests_per_second: f64,
        max_in_flight: usize,
        min_delay: Duration,
    ) -> Result<RateLimit> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return Err(format_err!(
                "requests per second must be a positive number, got {}",
                requests_per_second
            ));
        }
        if max_in_flight == 0 {
            return Err(format_err!("must allow at least one request in flight"));
        }
        let max_in_flight = Self::clamp_max_in_flight(requests_per_second, max_in_flight);
        let interval = Duration::from_secs_f64(1.0 / requests_per_second);
        if interval.is_zero() {
            return Err(format_err!(
                "requests per second is too large: {}",
                requests_per_second
            ));
        }
        let starts = RateLimiter::builder()
            .max(1)
            .initial(1)
            .refill(1)
            .interval(interval)
            .build();
        Ok(RateLimit {
            in_flight: Semaphore::new(max_in_flight),
            starts,
            min_delay,
        })
    }

    /// The default number of request slots for a given rate: the rate
    /// rounded down, but always at least one.
    pub fn default_max_in_flight(requests_per_second: f64) -> usize {
        if requests_per_second.is_finite() && requests_per_second >= 1.0 {
            requests_per_second.floor() as usize
        } else {
            1
        }
    }

    /// Limit `requested` slots to what our rate allows, warning if we had to
    /// lower it.
    pub fn clamp_max_in_flight(requests_per_second: f64, requested: usize) -> usize {
        let allowed = Self::default_max_in_flight(requests_per_second);
        if requested > allowed {
            warn!(
                "lowering requests in flight from {} to {} to stay under {} requests/sec",
                requested, allowed, requests_per_second
            );
            allowed
        } else {
            requested
        }
    }

    /// Start the request built by `make_request` once we have both a free
    /// slot and a start token. Nothing in `make_request` runs until then, so
    /// any deadline it sets does not include time spent waiting here.
    pub async fn run<F, Fut, T>(&self, make_request: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = self
            .in_flight
            .acquire()
            .instrument(trace_span!("rate_limit::slot"))
            .await
            .expect("rate limit semaphore is never closed");
        self.starts
            .acquire_one()
            .instrument(trace_span!("rate_limit::start"))
            .await;

        let output = make_request().await;

        if !self.min_delay.is_zero() {
            sleep(self.min_delay).await;
        }
        drop(permit);
        output
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use futures::future::join_all;

    use super::*;

    #[test]
    fn rejects_bad_configuration() {
        assert!(RateLimit::new(0.0, 1, Duration::ZERO).is_err());
        assert!(RateLimit::new(-1.0, 1, Duration::ZERO).is_err());
        assert!(RateLimit::new(f64::NAN, 1, Duration::ZERO).is_err());
        assert!(RateLimit::new(1.0, 0, Duration::ZERO).is_err());
    }

    #[test]
    fn slots_never_exceed_rate() {
        let limit = RateLimit::new(2.0, 6, Duration::ZERO).unwrap();
        assert_eq!(limit.in_flight.available_permits(), 2);
        let limit = RateLimit::new(0.5, 3, Duration::ZERO).unwrap();
        assert_eq!(limit.in_flight.available_permits(), 1);
        assert_eq!(RateLimit::clamp_max_in_flight(10.0, 4), 4);
    }

    #[tokio::test]
    async fn deadline_starts_after_slot_is_acquired() {
        // One slot, so the second request waits 40ms for the first.
        let limit = RateLimit::new(1000.0, 1, Duration::ZERO).unwrap();
        let results = join_all((0..2).map(|_| {
            limit.run(|| {
                tokio::time::timeout(Duration::from_millis(60), async {
                    sleep(Duration::from_millis(40)).await;
                })
            })
        }))
        .await;
        assert!(results.iter().all(|result| result.is_ok()));
    }

    #[test]
    fn default_slots_follow_rate() {
        assert_eq!(RateLimit::default_max_in_flight(0.5), 1);
        assert_eq!(RateLimit::default_max_in_flight(1.0), 1);
        assert_eq!(RateLimit::default_max_in_flight(10.7), 10);
    }

    #[tokio::test]
    async fn never_exceeds_max_in_flight() {
        let limit = RateLimit::new(1000.0, 3, Duration::ZERO).unwrap();
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let (current, peak) = (&current, &peak);

        let requests = (0..12).map(|_| {
            limit.run(move || async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(15)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            })
        });
        join_all(requests).await;

        assert_eq!(current.load(Ordering::SeqCst), 0);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn paces_request_starts() {
        // One start every 50ms, with plenty of free slots.
        let limit = RateLimit::new(20.0, 10, Duration::ZERO).unwrap();
        let start = Instant::now();
        join_all((0..5).map(|i| limit.run(move || async move { i }))).await;
        // The first request starts immediately, the rest wait for a token.
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[tokio::test]
    async fn holds_slot_for_min_delay() {
        let limit = RateLimit::new(1000.0, 1, Duration::from_millis(40)).unwrap();
        let start = Instant::now();
        join_all((0..3).map(|i| limit.run(move || async move { i }))).await;
        assert!(start.elapsed() >= Duration::from_millis(110));
    }
}
