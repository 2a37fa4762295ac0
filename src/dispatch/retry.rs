//! Per-delivery retry bookkeeping.
//!
//! `DeliveryAttempt` is a plain value: the worker feeds it send outcomes and
//! the current instant, and it says what happens next. Nothing in here sleeps
//! or reads a clock.

use std::time::Duration;

use tokio::time::Instant;

use crate::dispatch::sink::SinkError;

/// Longest a sink-requested cooldown is honoured
pub const MAX_COOLDOWN: Duration = Duration::from_secs(3600);

/// The instant a cooldown asked for at `now` ends, capped at `MAX_COOLDOWN`
pub fn cooldown_end(now: Instant, cooldown: Duration) -> Instant {
    now.checked_add(cooldown.min(MAX_COOLDOWN)).unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Backoff after the `failures`-th failed attempt: base, 2×base, 4×base, ...
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    InFlight { attempt: u32 },
    Retrying { attempt: u32, next_eligible: Instant },
    Delivered { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    policy: RetryPolicy,
    state: AttemptState,
    /// Sends that counted against the budget; rate limiting does not count
    consumed: u32,
}

impl DeliveryAttempt {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: AttemptState::Pending,
            consumed: 0,
        }
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    pub fn attempts(&self) -> u32 {
        self.consumed
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            AttemptState::Delivered { .. } | AttemptState::Failed { .. }
        )
    }

    /// When the next send may start, if we are waiting
    pub fn next_eligible(&self) -> Option<Instant> {
        match self.state {
            AttemptState::Retrying { next_eligible, .. } => Some(next_eligible),
            _ => None,
        }
    }

    /// Move to `InFlight` if a send may start at `now`
    pub fn start(&mut self, now: Instant) -> bool {
        let ready = match &self.state {
            AttemptState::Pending => true,
            AttemptState::Retrying { next_eligible, .. } => *next_eligible <= now,
            _ => false,
        };
        if ready {
            self.state = AttemptState::InFlight {
                attempt: self.consumed + 1,
            };
        }
        ready
    }

    /// Apply the outcome of the in-flight send
    pub fn resolve(&mut self, outcome: Result<(), SinkError>, now: Instant) -> &AttemptState {
        if !matches!(self.state, AttemptState::InFlight { .. }) {
            return &self.state;
        }

        self.state = match outcome {
            Ok(()) => {
                self.consumed += 1;
                AttemptState::Delivered {
                    attempts: self.consumed,
                }
            }
            Err(SinkError::RateLimited(cooldown)) => AttemptState::Retrying {
                attempt: self.consumed,
                next_eligible: cooldown_end(now, cooldown),
            },
            Err(SinkError::Transient(reason)) => {
                self.consumed += 1;
                if self.consumed >= self.policy.max_attempts {
                    AttemptState::Failed {
                        attempts: self.consumed,
                        reason,
                    }
                } else {
                    AttemptState::Retrying {
                        attempt: self.consumed,
                        next_eligible: now
                            .checked_add(self.policy.delay(self.consumed))
                            .unwrap_or(now),
                    }
                }
            }
            Err(e @ (SinkError::Permanent(_) | SinkError::PayloadTooLarge)) => {
                self.consumed += 1;
                AttemptState::Failed {
                    attempts: self.consumed,
                    reason: e.to_string(),
                }
            }
        };
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max).with_delays(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_success_first_time() {
        let now = Instant::now();
        let mut attempt = DeliveryAttempt::new(policy(3));
        assert!(attempt.start(now));
        assert_eq!(attempt.state(), &AttemptState::InFlight { attempt: 1 });

        attempt.resolve(Ok(()), now);
        assert_eq!(attempt.state(), &AttemptState::Delivered { attempts: 1 });
        assert!(attempt.is_terminal());
        assert!(!attempt.start(now));
    }

    #[test]
    fn test_transient_retries_then_fails() {
        let now = Instant::now();
        let mut attempt = DeliveryAttempt::new(policy(3));

        attempt.start(now);
        attempt.resolve(Err(SinkError::Transient("502".into())), now);
        assert_eq!(
            attempt.state(),
            &AttemptState::Retrying {
                attempt: 1,
                next_eligible: now + Duration::from_secs(1)
            }
        );
        assert!(!attempt.start(now));

        let later = now + Duration::from_secs(1);
        assert!(attempt.start(later));
        attempt.resolve(Err(SinkError::Transient("502".into())), later);
        assert_eq!(attempt.next_eligible(), Some(later + Duration::from_secs(2)));

        let last = later + Duration::from_secs(2);
        attempt.start(last);
        attempt.resolve(Err(SinkError::Transient("502".into())), last);
        assert_eq!(
            attempt.state(),
            &AttemptState::Failed {
                attempts: 3,
                reason: "502".into()
            }
        );
    }

    #[test]
    fn test_rate_limit_does_not_consume_attempt() {
        let now = Instant::now();
        let mut attempt = DeliveryAttempt::new(policy(1));

        for _ in 0..5 {
            attempt.start(now);
            attempt.resolve(Err(SinkError::RateLimited(Duration::ZERO)), now);
        }
        assert_eq!(attempt.attempts(), 0);
        assert!(!attempt.is_terminal());

        attempt.start(now);
        attempt.resolve(Ok(()), now);
        assert_eq!(attempt.state(), &AttemptState::Delivered { attempts: 1 });
    }

    #[test]
    fn test_huge_cooldown_is_capped() {
        let now = Instant::now();
        let mut attempt = DeliveryAttempt::new(policy(3));
        attempt.start(now);
        attempt.resolve(Err(SinkError::RateLimited(Duration::MAX)), now);

        assert_eq!(attempt.next_eligible(), Some(now + MAX_COOLDOWN));
        assert!(attempt.start(now + MAX_COOLDOWN));
    }

    #[test]
    fn test_huge_policy_delay_does_not_overflow() {
        let now = Instant::now();
        let policy = RetryPolicy::new(3).with_delays(Duration::MAX, Duration::MAX);
        let mut attempt = DeliveryAttempt::new(policy);
        attempt.start(now);
        attempt.resolve(Err(SinkError::Transient("502".into())), now);

        assert!(matches!(attempt.state(), AttemptState::Retrying { attempt: 1, .. }));
    }

    #[test]
    fn test_permanent_fails_immediately() {
        let now = Instant::now();
        let mut attempt = DeliveryAttempt::new(policy(5));
        attempt.start(now);
        attempt.resolve(Err(SinkError::Permanent("403".into())), now);

        assert!(matches!(
            attempt.state(),
            AttemptState::Failed { attempts: 1, .. }
        ));
    }

    #[test]
    fn test_resolve_without_start_is_ignored() {
        let now = Instant::now();
        let mut attempt = DeliveryAttempt::new(policy(5));
        attempt.resolve(Ok(()), now);
        assert_eq!(attempt.state(), &AttemptState::Pending);
    }
}
