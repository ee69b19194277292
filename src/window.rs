//! Sliding-window bucket math.
//!
//! Consumption is recorded in 1-second buckets; the window at time `now` is
//! the trailing [`WINDOW_SECS`] buckets `now - 59 ..= now`. The
//! approximation error versus a continuous window is bounded by one bucket
//! width (1 second). The Lua scripts implement the same layout server-side;
//! this module is the in-process counterpart used by `MemoryStore`.

use std::collections::HashMap;

use crate::models::Dimension;

/// Length of the rolling accounting window, in seconds.
pub const WINDOW_SECS: u64 = 60;

/// How long a bucket is kept after it was last written, in seconds. Must
/// strictly exceed `WINDOW_SECS + RECORD_TTL_SECS` headroom so a live
/// reservation record always targets a still-existing bucket.
pub const BUCKET_TTL_SECS: u64 = 120;

/// TTL of a reservation record: once its bucket leaves the window the
/// record is gone and `adjust` fails with `RecordNotFound`.
pub const RECORD_TTL_SECS: u64 = WINDOW_SECS;

/// First bucket second inside the window ending at `now`.
pub(crate) fn window_start(now: u64) -> u64 {
    now.saturating_sub(WINDOW_SECS - 1)
}

/// Time-bucketed consumption counters for one resource, all dimensions.
#[derive(Debug, Default)]
pub(crate) struct WindowCounters {
    buckets: HashMap<(Dimension, u64), u64>,
}

impl WindowCounters {
    /// Sum of consumption recorded within the window ending at `now`.
    pub(crate) fn used(&self, dimension: Dimension, now: u64) -> u64 {
        let start = window_start(now);
        self.buckets
            .iter()
            .filter(|((dim, sec), _)| *dim == dimension && (start..=now).contains(sec))
            .map(|(_, cost)| cost)
            .sum()
    }

    /// Record `cost` in the bucket for the current second.
    pub(crate) fn charge(&mut self, dimension: Dimension, now: u64, cost: u64) {
        *self.buckets.entry((dimension, now)).or_insert(0) += cost;
    }

    /// Apply a signed reconciliation delta to a specific bucket. The
    /// reservation's own contribution bounds a negative delta, so the
    /// saturation never triggers for well-formed adjustments.
    pub(crate) fn apply_delta(&mut self, dimension: Dimension, bucket: u64, delta: i64) {
        let entry = self.buckets.entry((dimension, bucket)).or_insert(0);
        if delta >= 0 {
            *entry += delta as u64;
        } else {
            *entry = entry.saturating_sub(delta.unsigned_abs());
        }
    }

    /// Drop buckets old enough that no window or live record can reach
    /// them, mirroring the key TTL on the Redis side.
    pub(crate) fn expire(&mut self, now: u64) {
        let horizon = now.saturating_sub(BUCKET_TTL_SECS);
        self.buckets.retain(|(_, sec), _| *sec > horizon);
    }
}
