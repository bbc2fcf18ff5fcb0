//! Exponential backoff with jitter for reconnection attempts.
//!
//! The n-th consecutive call to [`ExponentialBackoff::delay`] returns `base * 2^(n-1)`,
//! capped at `max`. With [`ExponentialBackoff::with_jitter`] the delay is spread around that
//! value instead. If more than `reset` passes between two calls the
//! sequence starts over, so a link that has been healthy for a while reconnects quickly.
//!
//! ```rust
//! use cluster_link::utils::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(
//!     Duration::from_millis(100),
//!     Duration::from_secs(5),
//!     Duration::from_secs(30),
//! );
//! assert_eq!(backoff.delay(), Duration::from_millis(100));
//! assert_eq!(backoff.delay(), Duration::from_millis(200));
//! ```

use rand::Rng;
use std::time::{Duration, Instant};

/// Jitter is drawn uniformly from `[nominal * JITTER_LOW, nominal * JITTER_HIGH)`,
/// which keeps the mean at the nominal delay.
const JITTER_LOW: f64 = 0.5;
const JITTER_HIGH: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    reset: Duration,
    jitter: bool,
    invocations: u32,
    last_invocation: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, reset: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            reset,
            jitter: false,
            invocations: 0,
            last_invocation: None,
        }
    }

    /// Randomize each delay around its nominal value so peers do not retry in lockstep
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Next delay to wait before retrying
    pub fn delay(&mut self) -> Duration {
        let now = Instant::now();
        if let Some(last) = self.last_invocation {
            if now.duration_since(last) > self.reset {
                self.invocations = 0;
            }
        }
        self.last_invocation = Some(now);
        self.invocations = self.invocations.saturating_add(1);

        let nominal = self.nominal_delay(self.invocations);
        if self.jitter {
            nominal.mul_f64(rand::rng().random_range(JITTER_LOW..JITTER_HIGH))
        } else {
            nominal
        }
    }

    /// Delay of the `n`-th consecutive call (1-based), before jitter
    pub fn nominal_delay(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Consecutive calls since the last reset
    pub fn attempts(&self) -> u32 {
        self.invocations
    }

    pub fn reset(&mut self) {
        self.invocations = 0;
        self.last_invocation = None;
    }
}
