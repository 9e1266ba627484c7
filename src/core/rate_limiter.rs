//! Global admission control for the proxy hot path.
//!
//! A fixed-window limiter (governor quota) partitioned by correlation id,
//! fronted by a small FIFO wait queue: a request that misses the window may
//! park in one of the queue slots until the limiter replenishes; with the
//! queue full it is rejected immediately, carrying the limiter's suggested
//! retry-after.
use std::{num::NonZeroU32, sync::Arc};

use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::RateLimitOptions,
    core::error::{GatewayError, GatewayResult},
};

type PartitionedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Why an admission attempt did not succeed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdmissionError {
    /// Window exhausted and no queue slot was free.
    #[error("rate limit exceeded")]
    Rejected {
        /// Suggested client retry-after in whole seconds, when known.
        retry_after: Option<u64>,
    },
    /// The caller's cancellation fired while queued.
    #[error("admission wait cancelled")]
    Cancelled,
}

/// Fixed-window admission controller keyed by partition (correlation id).
#[derive(Debug)]
pub struct AdmissionController {
    limiter: PartitionedLimiter,
    clock: DefaultClock,
    queue: Arc<Semaphore>,
}

impl AdmissionController {
    pub fn new(options: &RateLimitOptions) -> GatewayResult<Self> {
        let permits = NonZeroU32::new(options.permits).ok_or_else(|| {
            GatewayError::validation(
                "RateLimit.InvalidPermits",
                "rate limit permits must be greater than 0",
            )
        })?;
        if options.window_seconds == 0 {
            return Err(GatewayError::validation(
                "RateLimit.InvalidWindow",
                "rate limit window must be greater than 0 seconds",
            ));
        }

        // P permits per W seconds: one replenishment every W/P, bursting up
        // to the full window allowance.
        let window = std::time::Duration::from_secs(options.window_seconds);
        let quota = Quota::with_period(window / options.permits)
            .ok_or_else(|| {
                GatewayError::validation(
                    "RateLimit.InvalidWindow",
                    format!(
                        "window of {}s cannot be split into {} permits",
                        options.window_seconds, options.permits
                    ),
                )
            })?
            .allow_burst(permits);

        let clock = DefaultClock::default();
        let limiter = RateLimiter::new(quota, DefaultKeyedStateStore::default(), clock.clone());

        Ok(Self {
            limiter,
            clock,
            queue: Arc::new(Semaphore::new(options.queue_length)),
        })
    }

    /// Admit one request for the partition, parking in the wait queue when
    /// the window is exhausted. Queue slots drain oldest-first (the
    /// underlying semaphore is FIFO-fair).
    pub async fn admit(
        &self,
        partition: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdmissionError> {
        let key = partition.to_string();
        let not_until = match self.limiter.check_key(&key) {
            Ok(()) => return Ok(()),
            Err(not_until) => not_until,
        };

        let _slot = match self.queue.clone().try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => {
                return Err(AdmissionError::Rejected {
                    retry_after: Some(self.retry_after_secs(
                        not_until.wait_time_from(self.clock.now()),
                    )),
                });
            }
        };

        let mut wait = not_until.wait_time_from(self.clock.now());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AdmissionError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            match self.limiter.check_key(&key) {
                Ok(()) => return Ok(()),
                Err(not_until) => {
                    wait = not_until.wait_time_from(self.clock.now());
                }
            }
        }
    }

    fn retry_after_secs(&self, wait: std::time::Duration) -> u64 {
        // Round up so the client never retries inside the closed window.
        let secs = wait.as_secs();
        if wait.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(permits: u32, window_seconds: u64, queue_length: usize) -> AdmissionController {
        AdmissionController::new(&RateLimitOptions {
            permits,
            window_seconds,
            queue_length,
        })
        .expect("valid options")
    }

    #[tokio::test]
    async fn test_admits_within_window() {
        let controller = controller(3, 60, 0);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            assert!(controller.admit("c-1", &cancel).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_rejects_when_queue_full() {
        let controller = controller(1, 60, 0);
        let cancel = CancellationToken::new();

        assert!(controller.admit("c-1", &cancel).await.is_ok());
        match controller.admit("c-1", &cancel).await {
            Err(AdmissionError::Rejected { retry_after }) => {
                let secs = retry_after.expect("retry-after should be suggested");
                assert!(secs >= 1);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let controller = controller(1, 60, 0);
        let cancel = CancellationToken::new();

        assert!(controller.admit("c-1", &cancel).await.is_ok());
        // A different partition has its own window.
        assert!(controller.admit("c-2", &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_queued_request_eventually_admitted() {
        let controller = controller(1, 1, 1);
        let cancel = CancellationToken::new();

        assert!(controller.admit("c-1", &cancel).await.is_ok());
        // The window replenishes after ~1s; the queued request should clear.
        let admitted = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            controller.admit("c-1", &cancel),
        )
        .await;
        assert!(matches!(admitted, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_cancellation_while_queued() {
        let controller = controller(1, 60, 1);
        let cancel = CancellationToken::new();

        assert!(controller.admit("c-1", &cancel).await.is_ok());
        cancel.cancel();
        assert_eq!(
            controller.admit("c-1", &cancel).await,
            Err(AdmissionError::Cancelled)
        );
    }

    #[test]
    fn test_zero_permits_rejected_at_construction() {
        let err = AdmissionController::new(&RateLimitOptions {
            permits: 0,
            window_seconds: 60,
            queue_length: 10,
        })
        .unwrap_err();
        assert_eq!(err.code, "RateLimit.InvalidPermits");
    }
}
