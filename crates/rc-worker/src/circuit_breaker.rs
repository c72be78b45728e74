//! Per-sink circuit breaker (spec §4.5). Closed lets calls through and
//! counts failures; `failure_threshold` consecutive failures opens it;
//! once `recovery_timeout` elapses it lets `half_open_probes` calls
//! through before closing again on success or reopening on failure.

use rc_common::CircuitBreakerConfig;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
    half_open_remaining: AtomicU32,
    start: Instant,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_remaining: AtomicU32::new(0),
            start: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Returns `true` when the caller may attempt the call.
    pub async fn allow(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::SeqCst);
                if self.now_millis().saturating_sub(opened_at) >= self.config.recovery_timeout_ms {
                    *state = BreakerState::HalfOpen;
                    self.half_open_remaining.store(self.config.half_open_probes, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                let remaining = self.half_open_remaining.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.half_open_remaining.fetch_sub(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *state = BreakerState::Closed;
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        match *state {
            BreakerState::HalfOpen => {
                self.open(&mut state);
            }
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.open(&mut state);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self, state: &mut BreakerState) {
        *state = BreakerState::Open;
        self.opened_at_millis.store(self.now_millis(), Ordering::SeqCst);
    }

    pub async fn is_open(&self) -> bool {
        matches!(*self.state.lock().await, BreakerState::Open)
    }
}

pub fn backoff_delay(policy: &rc_common::RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.multiplier.powi(attempt.saturating_sub(1) as i32);
    let delay_ms = (policy.initial_delay_ms as f64 * exp).min(policy.max_delay_ms as f64);
    Duration::from_millis(delay_ms.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_common::RetryPolicy;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_ms: 50,
            half_open_probes: 1,
        });

        assert!(breaker.allow().await);
        breaker.record_failure().await;
        assert!(!breaker.is_open().await);
        breaker.record_failure().await;
        assert!(breaker.is_open().await);
        assert!(!breaker.allow().await);
    }

    #[tokio::test]
    async fn half_opens_after_recovery_timeout() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_ms: 10,
            half_open_probes: 1,
        });
        breaker.record_failure().await;
        assert!(breaker.is_open().await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow().await);
        breaker.record_success().await;
        assert!(!breaker.is_open().await);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy { max_attempts: 5, initial_delay_ms: 100, max_delay_ms: 1000, multiplier: 2.0 };
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 10), Duration::from_millis(1000));
    }
}
