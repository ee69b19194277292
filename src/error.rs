//! Error types for acquisition, adjustment, and store access.
//!
//! Every failure mode is a distinct variant so callers can tell "try again
//! later" (`Timeout`) from "this will never succeed" (`CostExceedsCeiling`)
//! without string matching. Transient store failures are retried inside the
//! connection layer and only surface here as `ConnectionFailure` once the
//! retry budget is spent; everything else propagates on first occurrence.

use std::time::Duration;

use crate::models::{Dimension, RecordId};

/// Unified error type for all limiter operations.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The coordination store stayed unreachable through every retry.
    #[error("coordination store unreachable after {attempts} attempts: {source}")]
    ConnectionFailure {
        /// Total attempts made, including the initial one.
        attempts: u32,
        #[source]
        source: redis::RedisError,
    },

    /// A non-transient store error (protocol, type, auth). Not retried.
    #[error("coordination store command failed: {0}")]
    Store(#[from] redis::RedisError),

    /// The admission wait exceeded the configured `max_wait`.
    #[error("admission wait of {waited:?} exceeded max_wait of {max_wait:?}")]
    Timeout { waited: Duration, max_wait: Duration },

    /// A single request's cost can never fit the configured ceiling.
    #[error("cost of {cost} {dimension} exceeds the configured ceiling of {ceiling}")]
    CostExceedsCeiling { dimension: Dimension, cost: u64, ceiling: u64 },

    /// `adjust` targeted a record that expired, was already adjusted, or
    /// was never issued.
    #[error("reservation record {record_id} not found (expired, already adjusted, or never issued)")]
    RecordNotFound { record_id: RecordId },

    /// Contradictory or incomplete limit configuration. Raised at
    /// construction time, never during acquisition.
    #[error("invalid rate limit configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl RateLimitError {
    /// Check if this error is an exhausted-retries connection failure.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailure { .. })
    }

    /// Check if this error is an admission timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error marks a cost that can never be admitted.
    pub fn is_cost_exceeds_ceiling(&self) -> bool {
        matches!(self, Self::CostExceedsCeiling { .. })
    }

    /// Check if this error is a stale or unknown adjustment target.
    pub fn is_record_not_found(&self) -> bool {
        matches!(self, Self::RecordNotFound { .. })
    }

    /// Check if this error was raised by configuration validation.
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration { .. })
    }

    /// Access timeout details as (waited, max_wait).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { waited, max_wait } => Some((*waited, *max_wait)),
            _ => None,
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration { reason: reason.into() }
    }

    /// A reply from the store that the protocol does not recognize.
    pub(crate) fn protocol(detail: String) -> Self {
        Self::Store(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "unexpected script reply",
            detail,
        )))
    }
}
