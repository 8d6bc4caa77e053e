use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters owned by a Tree. Relaxed ordering is fine: readers only want
/// eventually consistent totals.
#[derive(Debug, Default)]
pub(crate) struct TreeCounters {
    pub nut_count: AtomicU64,
    pub total_stashed: AtomicU64,
    pub total_tossed: AtomicU64,
    pub squabbles_resolved: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub events_dropped: AtomicU64,
}

impl TreeCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TreeStats {
        TreeStats {
            nut_count: Self::read(&self.nut_count),
            total_stashed: Self::read(&self.total_stashed),
            total_tossed: Self::read(&self.total_tossed),
            squabbles_resolved: Self::read(&self.squabbles_resolved),
            cache_hits: Self::read(&self.cache_hits),
            cache_misses: Self::read(&self.cache_misses),
            events_dropped: Self::read(&self.events_dropped),
        }
    }
}

/// Point-in-time view of a Tree's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub nut_count: u64,
    pub total_stashed: u64,
    pub total_tossed: u64,
    pub squabbles_resolved: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub events_dropped: u64,
}
