//! Recency allocator statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for allocator reads and migrations.
///
/// Counters only ever increase; `hits + misses` equals the number of reads
/// the allocator has served.
#[derive(Debug, Default)]
pub struct AllocatorStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evicts: AtomicU64,
}

impl AllocatorStats {
    /// Fresh zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evict(&self) {
        self.evicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads served from the upper tier.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Reads that had to promote from the lower tier.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Refs moved out of a tier to make space.
    pub fn evicts(&self) -> u64 {
        self.evicts.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    pub fn summary(&self) -> AllocatorStatsSummary {
        AllocatorStatsSummary {
            hits: self.hits(),
            misses: self.misses(),
            evicts: self.evicts(),
        }
    }
}

/// Snapshot of [`AllocatorStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStatsSummary {
    /// Reads served from the upper tier.
    pub hits: u64,
    /// Reads promoted from the lower tier.
    pub misses: u64,
    /// Evicted refs.
    pub evicts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = AllocatorStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_evict();

        let summary = stats.summary();
        assert_eq!(summary.hits, 2);
        assert_eq!(summary.misses, 1);
        assert_eq!(summary.evicts, 1);
    }
}
