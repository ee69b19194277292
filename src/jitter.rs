//! Jitter over retry delays.
//!
//! Many limiter clients losing the same store connection retry on the same
//! exponential schedule; jitter desynchronizes them so the store does not
//! see a reconnect stampede.
//!
//! - `None`: exact delays, for deterministic tests.
//! - `Full`: uniform in `[0, delay]`, the default.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor under the delay.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy applied to each retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter; use the exact backoff delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`.
    Equal,
}

impl Jitter {
    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a caller-supplied RNG (for deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = Self::as_millis_saturated(delay);
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
        }
    }

    fn as_millis_saturated(duration: Duration) -> u64 {
        duration.as_millis().try_into().unwrap_or(u64::MAX)
    }
}
