//! Consecutive-failure circuit breaker guarding broker publishes.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::util::lock::mutex_lock;

const SOURCE: &str = "application::resilience";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a trial call.
    pub open_cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Internal {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<Internal>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                open_cooldown: config.open_cooldown,
            },
            state: Mutex::new(Internal::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a call may proceed now. An open breaker whose cooldown has
    /// elapsed admits exactly one trial call.
    pub fn admit(&self) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "admit");
        match *state {
            Internal::Closed { .. } => true,
            Internal::Open { opened_at } if opened_at.elapsed() >= self.config.open_cooldown => {
                *state = Internal::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
            Internal::Open { .. } => false,
            Internal::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    false
                } else {
                    *state = Internal::HalfOpen {
                        trial_in_flight: true,
                    };
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        *mutex_lock(&self.state, SOURCE, "record_success") = Internal::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "record_failure");
        *state = match *state {
            Internal::Closed {
                consecutive_failures,
            } => {
                let next = consecutive_failures.saturating_add(1);
                if next >= self.config.failure_threshold {
                    Internal::Open {
                        opened_at: Instant::now(),
                    }
                } else {
                    Internal::Closed {
                        consecutive_failures: next,
                    }
                }
            }
            Internal::HalfOpen { .. } => Internal::Open {
                opened_at: Instant::now(),
            },
            open @ Internal::Open { .. } => open,
        };
    }

    pub fn state(&self) -> CircuitState {
        match *mutex_lock(&self.state, SOURCE, "state") {
            Internal::Closed { .. } => CircuitState::Closed,
            Internal::Open { .. } => CircuitState::Open,
            Internal::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            open_cooldown: Duration::from_secs(30),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_retries_after_cooldown() {
        let breaker = breaker(2);
        assert!(breaker.admit());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.admit());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.admit());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.admit(), "only one trial call at a time");

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_call_reopens() {
        let breaker = breaker(1);
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.admit());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.admit());
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = breaker(2);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
