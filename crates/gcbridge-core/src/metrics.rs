//! Bridge operation counters.
//!
//! Relaxed ordering throughout; these are diagnostics, never used to
//! synchronize.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::classify::AllocPath;

/// Per-bridge operation counters.
pub struct BridgeMetrics {
    /// Allocations served by the pooled small-object primitive.
    pub small_allocs: AtomicU64,
    /// Allocations served by the off-page primitive.
    pub large_allocs: AtomicU64,
    /// Allocations served by either typed primitive.
    pub typed_allocs: AtomicU64,
    /// Explicit releases forwarded to the collector.
    pub releases: AtomicU64,
    /// Collections requested by the host.
    pub collections_forced: AtomicU64,
    /// Start events seen from the collector, forced or not.
    pub collections_observed: AtomicU64,
    /// Host stack scans performed.
    pub stack_marks: AtomicU64,
    pub out_of_memory: AtomicU64,
    /// Protocol violations reported to the host.
    pub misuse: AtomicU64,
    pub descriptor_cache_hits: AtomicU64,
    pub descriptor_cache_misses: AtomicU64,
}

impl BridgeMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            small_allocs: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            typed_allocs: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            collections_forced: AtomicU64::new(0),
            collections_observed: AtomicU64::new(0),
            stack_marks: AtomicU64::new(0),
            out_of_memory: AtomicU64::new(0),
            misuse: AtomicU64::new(0),
            descriptor_cache_hits: AtomicU64::new(0),
            descriptor_cache_misses: AtomicU64::new(0),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Count one successful allocation on `path`.
    pub fn record_alloc(&self, path: AllocPath) {
        let counter = match path {
            AllocPath::Small => &self.small_allocs,
            AllocPath::Large => &self.large_allocs,
            AllocPath::Typed | AllocPath::TypedArray => &self.typed_allocs,
        };
        Self::inc(counter);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            small_allocs: Self::get(&self.small_allocs),
            large_allocs: Self::get(&self.large_allocs),
            typed_allocs: Self::get(&self.typed_allocs),
            releases: Self::get(&self.releases),
            collections_forced: Self::get(&self.collections_forced),
            collections_observed: Self::get(&self.collections_observed),
            stack_marks: Self::get(&self.stack_marks),
            out_of_memory: Self::get(&self.out_of_memory),
            misuse: Self::get(&self.misuse),
            descriptor_cache_hits: Self::get(&self.descriptor_cache_hits),
            descriptor_cache_misses: Self::get(&self.descriptor_cache_misses),
        }
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`BridgeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub small_allocs: u64,
    pub large_allocs: u64,
    pub typed_allocs: u64,
    pub releases: u64,
    pub collections_forced: u64,
    pub collections_observed: u64,
    pub stack_marks: u64,
    pub out_of_memory: u64,
    pub misuse: u64,
    pub descriptor_cache_hits: u64,
    pub descriptor_cache_misses: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub const fn total_allocs(&self) -> u64 {
        self.small_allocs + self.large_allocs + self.typed_allocs
    }
}
