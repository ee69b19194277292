//! Value objects returned by the limiter: acquisition results, status
//! snapshots, reservation record ids, and budget dimensions.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// One budget dimension tracked in the sliding window.
///
/// `Requests` is always charged at a unit cost of 1 per acquisition; the
/// token dimensions carry the caller-supplied costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dimension {
    Requests,
    Tokens,
    InputTokens,
    OutputTokens,
}

impl Dimension {
    /// Short tag used in store key names. Stable across releases: changing a
    /// tag orphans live counters.
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Dimension::Requests => "rpm",
            Dimension::Tokens => "tpm",
            Dimension::InputTokens => "in",
            Dimension::OutputTokens => "out",
        }
    }

    pub(crate) fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "rpm" => Some(Dimension::Requests),
            "tpm" => Some(Dimension::Tokens),
            "in" => Some(Dimension::InputTokens),
            "out" => Some(Dimension::OutputTokens),
            _ => None,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dimension::Requests => "requests",
            Dimension::Tokens => "tokens",
            Dimension::InputTokens => "input tokens",
            Dimension::OutputTokens => "output tokens",
        };
        write!(f, "{}", name)
    }
}

/// Identifier of a reservation record created by a split-mode acquisition.
///
/// The id is generated client-side and owned by the store once the
/// reservation is written; it can be passed between processes (any process
/// holding the id may reconcile the reservation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordId(Uuid);

impl RecordId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Outcome of a successful acquisition: the amounts actually reserved, and
/// in split mode the record id to reconcile through
/// [`RateLimiter::adjust`](crate::RateLimiter::adjust).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AcquireResult {
    /// Present only for split-mode acquisitions.
    pub record_id: Option<RecordId>,
    /// Tokens reserved against the unified budget (unified mode) or the
    /// input budget (split mode).
    pub input_tokens: u64,
    /// Output tokens reserved as an estimate; zero in unified mode.
    pub output_tokens: u64,
}

impl AcquireResult {
    /// Whether this acquisition can still be reconciled via `adjust`.
    pub fn is_adjustable(&self) -> bool {
        self.record_id.is_some()
    }
}

/// Read-only snapshot of remaining capacity in the current window.
///
/// Diagnostics only: the values are stale the moment they are read and must
/// never gate an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimitStatus {
    pub rpm_remaining: u64,
    /// Remaining unified token budget; `None` in split mode.
    pub tpm_remaining: Option<u64>,
    /// Remaining input token budget; `None` in unified mode.
    pub input_tpm_remaining: Option<u64>,
    /// Remaining output token budget; `None` in unified mode.
    pub output_tpm_remaining: Option<u64>,
}
