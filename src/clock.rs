//! Clock abstraction giving the in-process store its time authority.
//!
//! Window buckets are addressed by wall-clock second, so the clock must be
//! a wall clock (bucket boundaries have to agree across processes), not a
//! monotonic one. The Redis store never consults this clock (it reads the
//! server's `TIME` inside each script), but `MemoryStore` does, and tests
//! drive `ManualClock` to move the window deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;

    /// Whole seconds since the Unix epoch; the bucket index unit.
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock for tests. Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at an arbitrary epoch offset. Starting well past zero keeps
    /// `now - 59` bucket arithmetic away from underflow in tests.
    pub fn starting_at(epoch: Duration) -> Self {
        let clock = Self::default();
        clock.millis.store(epoch.as_millis() as u64, Ordering::SeqCst);
        clock
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
