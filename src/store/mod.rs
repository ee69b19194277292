//! Storage seam for the admission protocol.
//!
//! The limiter never touches shared state directly; it speaks this trait,
//! and every method is one atomic step against the backing store. That
//! keeps the concurrency contract in one place: a `RedisStore` gives many
//! processes one shared budget, a `MemoryStore` gives one process the same
//! protocol without a network hop, and tests drive the protocol
//! deterministically through the latter.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RateLimitError;
use crate::models::{Dimension, RecordId};

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Arrival-ordered admission ticket. Monotonically increasing per
/// resource; owned by one waiting `acquire` call at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(pub u64);

/// One budget dimension to check and charge during admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionCharge {
    pub dimension: Dimension,
    pub ceiling: u64,
    pub cost: u64,
}

/// Reservation record to create on admission (split mode only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSpec {
    pub record_id: RecordId,
    pub reserved_output: u64,
}

/// Everything one admission attempt checks and charges atomically: either
/// every dimension is charged and the reservation written, or nothing is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitRequest {
    pub charges: Vec<DimensionCharge>,
    pub reservation: Option<ReservationSpec>,
}

/// Result of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Charged and (if requested) reserved; the ticket is consumed.
    Admitted,
    /// An earlier live ticket is still waiting; try again shortly.
    WaitTurn,
    /// Head of the queue, but the named dimension has no headroom.
    WaitCapacity { dimension: Dimension },
    /// The caller's own lease lapsed and its ticket was pruned; the caller
    /// must re-enqueue (its arrival position is forfeit).
    TicketExpired,
}

/// Atomic operations the admission engine requires of a coordination
/// store. Every method is a single atomic step; no partial effects are
/// ever observable by other callers.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Issue the next arrival ticket, registered with a liveness lease.
    async fn enqueue(&self, lease: Duration) -> Result<Ticket, RateLimitError>;

    /// Attempt admission for `ticket`, refreshing its lease. Only the
    /// lowest live ticket passes the turn gate; dead tickets ahead of it
    /// are pruned as a side effect.
    async fn try_admit(
        &self,
        ticket: Ticket,
        lease: Duration,
        request: &AdmitRequest,
    ) -> Result<AdmitOutcome, RateLimitError>;

    /// Remove a ticket from the queue (timeout or cancellation). Window
    /// state is untouched and remaining waiters keep their order. Returns
    /// whether the ticket was still queued.
    async fn withdraw(&self, ticket: Ticket) -> Result<bool, RateLimitError>;

    /// Reconcile a reservation with the actual output cost, applying the
    /// delta to the bucket the reservation charged. Fails with
    /// `RecordNotFound` for an expired, already-adjusted, or unknown
    /// record. Returns the signed delta applied.
    async fn adjust(&self, record_id: &RecordId, actual_output: u64)
        -> Result<i64, RateLimitError>;

    /// Remaining capacity per dimension in the current window. Read-only.
    async fn status(
        &self,
        ceilings: &[(Dimension, u64)],
    ) -> Result<Vec<(Dimension, u64)>, RateLimitError>;
}
