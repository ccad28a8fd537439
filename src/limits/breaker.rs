//! Upstream circuit breaker.
//!
//! Trips after a run of consecutive failures, halts requests for a
//! cool-down, then lets a single probe through; the probe's outcome closes
//! or re-opens the breaker.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_limit: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_limit: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_limit: failure_limit.max(1),
            cooldown,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a request may proceed right now. While open, flips to
    /// half-open once the cool-down has elapsed and admits one probe.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let expired = self
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if expired {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
        self.opened_at = None;
    }

    pub fn on_failure(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                // Probe failed; back to a full cool-down.
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_limit {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_after_limit() {
        let mut b = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(b.allow());
        b.on_failure();
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn test_probe_closes_on_success() {
        let mut b = CircuitBreaker::new(1, Duration::ZERO);
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);

        // Cool-down of zero: next allow() admits the probe.
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Only one probe at a time.
        assert!(!b.allow());

        b.on_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut b = CircuitBreaker::new(1, Duration::ZERO);
        b.on_failure();
        assert!(b.allow());
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }
}
