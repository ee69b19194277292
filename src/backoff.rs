//! Backoff schedules for the connection layer's retry loop.
//!
//! Attempt semantics: attempt `0` is the initial store call and gets no
//! delay; retries start at attempt `1`. The exponential schedule doubles
//! from `base` per retry (`base * 2^(attempt-1)`), capped by `with_max` and
//! always saturating at [`MAX_BACKOFF`] so arithmetic can never overflow.

use std::fmt;
use std::time::Duration;

/// Delay used when a computation would overflow (1 hour, far beyond any
/// sane store retry schedule).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Constant,
    Exponential,
}

/// A retry delay schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    kind: Kind,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Fixed delay for every retry. Mostly useful in tests.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: Kind::Constant, base: delay, max: None }
    }

    /// Delay doubling from `base` per retry.
    pub fn exponential(base: Duration) -> Self {
        Self { kind: Kind::Exponential, base, max: None }
    }

    /// Cap the delay. Rejects a zero cap or a cap below `base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Delay before the given attempt (0-based; 0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.kind {
            Kind::Constant => self.base,
            Kind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = self.base.as_nanos().saturating_mul(multiplier);
                Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
            }
        };
        let capped = self.max.map(|m| raw.min(m)).unwrap_or(raw);
        capped.min(MAX_BACKOFF)
    }
}
