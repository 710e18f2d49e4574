//! Reconnect policy for the worker's connection state machine.
//!
//! `CONNECTING -> ONLINE -> (error) BACKOFF -> CONNECTING`. Transient failures
//! sleep `base * retry_count`; rate-limit failures sleep the deep-sleep tier
//! without touching the retry count; fatal failures end the worker.

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::BackoffConfig,
    error::{ErrorTier, WorkerError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub transient_base: Duration,
    pub rate_limited_sleep: Duration,
    pub max_retries: Option<u32>,
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            transient_base: config.transient_base(),
            rate_limited_sleep: config.rate_limited_sleep(),
            max_retries: config.max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffDecision {
    Retry { delay: Duration, tier: ErrorTier },
    Terminate { reason: String },
}

#[derive(Debug)]
pub struct BackoffScheduler {
    policy: BackoffPolicy,
    retry_count: u32,
    last_tier: Option<ErrorTier>,
}

impl BackoffScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            retry_count: 0,
            last_tier: None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_tier(&self) -> Option<ErrorTier> {
        self.last_tier
    }

    pub fn on_connected(&mut self) {
        if self.retry_count > 0 {
            info!("Reconnected after {} transient retries", self.retry_count);
        }
        self.retry_count = 0;
        self.last_tier = None;
    }

    pub fn on_failure(&mut self, error: &WorkerError) -> BackoffDecision {
        let tier = error.tier();
        self.last_tier = Some(tier);

        match tier {
            ErrorTier::Transient => {
                self.retry_count = self.retry_count.saturating_add(1);
                if let Some(cap) = self.policy.max_retries {
                    if self.retry_count > cap {
                        return BackoffDecision::Terminate {
                            reason: format!("retry cap of {} exhausted: {}", cap, error),
                        };
                    }
                }
                BackoffDecision::Retry {
                    delay: self.policy.transient_base.saturating_mul(self.retry_count),
                    tier,
                }
            }
            ErrorTier::RateLimited => BackoffDecision::Retry {
                delay: self.policy.rate_limited_sleep,
                tier,
            },
            ErrorTier::Fatal => BackoffDecision::Terminate {
                reason: error.to_string(),
            },
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first. Returns `false` if cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => {
            warn!("Backoff sleep cancelled");
            false
        }
        _ = sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_policy(max_retries: Option<u32>) -> BackoffPolicy {
        BackoffPolicy {
            transient_base: Duration::from_millis(100),
            rate_limited_sleep: Duration::from_secs(60),
            max_retries,
        }
    }

    fn transient() -> WorkerError {
        WorkerError::TransientNetwork("connection reset".into())
    }

    fn retry_delay(decision: BackoffDecision) -> Duration {
        match decision {
            BackoffDecision::Retry { delay, .. } => delay,
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_transient_delays_grow_linearly() {
        let mut scheduler = BackoffScheduler::new(create_test_policy(None));
        let delays: Vec<Duration> = (0..3)
            .map(|_| retry_delay(scheduler.on_failure(&transient())))
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_rate_limited_uses_deep_sleep_regardless_of_retries() {
        let mut scheduler = BackoffScheduler::new(create_test_policy(None));
        for _ in 0..5 {
            scheduler.on_failure(&transient());
        }

        let decision = scheduler.on_failure(&WorkerError::RateLimited("429".into()));
        assert_eq!(
            decision,
            BackoffDecision::Retry {
                delay: Duration::from_secs(60),
                tier: ErrorTier::RateLimited,
            }
        );
        assert_eq!(scheduler.retry_count(), 5);
    }

    #[test]
    fn test_reset_on_connect() {
        let mut scheduler = BackoffScheduler::new(create_test_policy(None));
        scheduler.on_failure(&transient());
        scheduler.on_failure(&transient());
        scheduler.on_connected();

        assert_eq!(scheduler.retry_count(), 0);
        assert_eq!(
            retry_delay(scheduler.on_failure(&transient())),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_fatal_terminates() {
        let mut scheduler = BackoffScheduler::new(create_test_policy(None));
        let decision = scheduler.on_failure(&WorkerError::FatalConfig("bad key".into()));
        assert!(matches!(decision, BackoffDecision::Terminate { .. }));
        assert_eq!(scheduler.last_tier(), Some(ErrorTier::Fatal));
    }

    #[test]
    fn test_retry_cap_converts_to_termination() {
        let mut scheduler = BackoffScheduler::new(create_test_policy(Some(2)));
        assert!(matches!(
            scheduler.on_failure(&transient()),
            BackoffDecision::Retry { .. }
        ));
        assert!(matches!(
            scheduler.on_failure(&transient()),
            BackoffDecision::Retry { .. }
        ));
        assert!(matches!(
            scheduler.on_failure(&transient()),
            BackoffDecision::Terminate { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cancellable() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(3600), &cancel).await);

        let live = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_secs(3600), &live).await);
    }
}
