//! The reconnection contract documented for the agent side (§4.5
//! "Reconnection"). The agent process itself is out of scope, but the
//! backoff shape is part of the contract this crate promises, so it lives
//! here as a pure, testable value type.

use std::time::Duration;

/// Exponential backoff with jitter: initial 1s, multiplier 2, cap 60s,
/// randomization factor 0.1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// The base delay (pre-jitter) for the given zero-indexed attempt
    /// number, capped at `self.cap`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }

    /// The delay window `[base * (1 - jitter), base * (1 + jitter)]` a caller
    /// should sample from before sleeping.
    pub fn jitter_window(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.base_delay(attempt).as_secs_f64();
        let low = (base * (1.0 - self.jitter)).max(0.0);
        let high = base * (1.0 + self.jitter);
        (Duration::from_secs_f64(low), Duration::from_secs_f64(high))
    }
}
