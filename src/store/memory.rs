//! In-process coordination store.
//!
//! Implements the identical admission protocol as the Redis store, with
//! the mutex standing in for the store's atomic execution. Useful on its
//! own for single-process deployments and as the deterministic backend for
//! the test suite (inject a `ManualClock` to move the window by hand).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::RateLimitError;
use crate::models::{Dimension, RecordId};
use crate::window::{WindowCounters, RECORD_TTL_SECS};

use super::{AdmitOutcome, AdmitRequest, CoordinationStore, Ticket};

#[derive(Debug)]
struct Record {
    reserved: u64,
    bucket: u64,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct Inner {
    seq: u64,
    /// ticket -> lease deadline in epoch millis.
    waiters: BTreeMap<u64, u64>,
    counters: WindowCounters,
    records: HashMap<RecordId, Record>,
}

/// Mutex-guarded store state; the mutex is the atomicity boundary, exactly
/// as the script execution is for Redis.
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Store on the system wall clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Store on a caller-supplied clock.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { clock: Arc::new(clock), inner: Mutex::new(Inner::default()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn enqueue(&self, lease: Duration) -> Result<Ticket, RateLimitError> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let ticket = inner.seq;
        inner.waiters.insert(ticket, now_ms + lease.as_millis() as u64);
        Ok(Ticket(ticket))
    }

    async fn try_admit(
        &self,
        ticket: Ticket,
        lease: Duration,
        request: &AdmitRequest,
    ) -> Result<AdmitOutcome, RateLimitError> {
        let now_ms = self.clock.now_millis();
        let now = now_ms / 1000;
        let mut inner = self.inner.lock().unwrap();

        if !inner.waiters.contains_key(&ticket.0) {
            return Ok(AdmitOutcome::TicketExpired);
        }

        // Turn gate: only the lowest live ticket proceeds; dead tickets
        // ahead of it are pruned here, as the admission script does.
        loop {
            let (head, deadline) = {
                let (k, v) = inner.waiters.first_key_value().expect("contains our ticket");
                (*k, *v)
            };
            if head == ticket.0 {
                break;
            }
            if deadline >= now_ms {
                return Ok(AdmitOutcome::WaitTurn);
            }
            inner.waiters.remove(&head);
        }

        inner.waiters.insert(ticket.0, now_ms + lease.as_millis() as u64);

        for charge in &request.charges {
            if charge.cost > 0
                && inner.counters.used(charge.dimension, now) + charge.cost > charge.ceiling
            {
                return Ok(AdmitOutcome::WaitCapacity { dimension: charge.dimension });
            }
        }

        for charge in &request.charges {
            if charge.cost > 0 {
                inner.counters.charge(charge.dimension, now, charge.cost);
            }
        }

        inner.waiters.remove(&ticket.0);

        if let Some(reservation) = &request.reservation {
            inner.records.insert(
                reservation.record_id.clone(),
                Record {
                    reserved: reservation.reserved_output,
                    bucket: now,
                    expires_at: now + RECORD_TTL_SECS,
                },
            );
        }

        // Lazy expiry, standing in for key TTLs on the Redis side.
        inner.counters.expire(now);
        inner.records.retain(|_, record| record.expires_at > now);

        Ok(AdmitOutcome::Admitted)
    }

    async fn withdraw(&self, ticket: Ticket) -> Result<bool, RateLimitError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.waiters.remove(&ticket.0).is_some())
    }

    async fn adjust(
        &self,
        record_id: &RecordId,
        actual_output: u64,
    ) -> Result<i64, RateLimitError> {
        let now = self.clock.now_secs();
        let mut inner = self.inner.lock().unwrap();

        let not_found = RateLimitError::RecordNotFound { record_id: record_id.clone() };
        let entry = inner
            .records
            .get(record_id)
            .map(|record| (record.reserved, record.bucket, record.expires_at));
        let (reserved, bucket) = match entry {
            Some((reserved, bucket, expires_at)) if expires_at > now => (reserved, bucket),
            Some(_) => {
                inner.records.remove(record_id);
                return Err(not_found);
            }
            None => return Err(not_found),
        };

        let delta = actual_output as i64 - reserved as i64;
        if delta != 0 {
            inner.counters.apply_delta(Dimension::OutputTokens, bucket, delta);
        }
        inner.records.remove(record_id);
        Ok(delta)
    }

    async fn status(
        &self,
        ceilings: &[(Dimension, u64)],
    ) -> Result<Vec<(Dimension, u64)>, RateLimitError> {
        let now = self.clock.now_secs();
        let inner = self.inner.lock().unwrap();
        Ok(ceilings
            .iter()
            .map(|(dimension, ceiling)| {
                (*dimension, ceiling.saturating_sub(inner.counters.used(*dimension, now)))
            })
            .collect())
    }
}
