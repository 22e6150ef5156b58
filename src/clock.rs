//! Logical clock used to order store mutations independent of wall-clock time.
//!
//! Content servers stamp their payloads with their own clock value; the gateway
//! feeds that value through [`LogicalClock::observe`] before the store stamps the
//! write, so writes from independent feeds order causally.

use std::sync::atomic::{AtomicU64, Ordering};

/// Largest stamp accepted from a writer or a snapshot. The headroom above it
/// keeps the clock from ever reaching the top of the counter.
pub const MAX_EXTERNAL_STAMP: u64 = u64::MAX / 2;

#[derive(Debug, Default)]
pub struct LogicalClock {
    value: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    /// Advance by one and return the new value. An exhausted counter stays
    /// put rather than wrapping.
    pub fn tick(&self) -> u64 {
        match self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
        {
            Ok(prev) => prev + 1,
            Err(stuck) => stuck,
        }
    }

    /// Merge a stamp received from another writer: `max(local, remote) + 1`.
    pub fn observe(&self, remote: u64) -> u64 {
        match self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                local.max(remote).checked_add(1)
            }) {
            Ok(prev) => prev.max(remote) + 1,
            Err(stuck) => stuck,
        }
    }

    /// Raise the clock to at least `floor` without counting an event.
    pub fn restore(&self, floor: u64) {
        self.value.fetch_max(floor, Ordering::SeqCst);
    }

    pub fn read(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}
