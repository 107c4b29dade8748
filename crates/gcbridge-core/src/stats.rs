//! Memory statistics in the collector's and the host's vocabulary.
//!
//! Purely observational: nothing here changes collector state, and the
//! numbers are a best-effort composition of independent queries rather than
//! one atomic snapshot.

use serde::Serialize;

use crate::collector::HeapUsage;

/// Raw counters as reported by the collector and the OS.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStatsSnapshot {
    pub heap_size_bytes: usize,
    pub free_bytes: usize,
    pub unmapped_bytes: usize,
    pub bytes_since_last_collection: usize,
    pub total_allocated_bytes: usize,
    pub os_obtained_bytes: usize,
    pub peak_resident_set_bytes: usize,
    pub collections: usize,
}

impl MemoryStatsSnapshot {
    #[must_use]
    pub const fn compose(
        usage: HeapUsage,
        os_obtained_bytes: usize,
        peak_resident_set_bytes: usize,
        collections: usize,
    ) -> Self {
        Self {
            heap_size_bytes: usage.heap_size,
            free_bytes: usage.free_bytes,
            unmapped_bytes: usage.unmapped_bytes,
            bytes_since_last_collection: usage.bytes_since_gc,
            total_allocated_bytes: usage.total_bytes,
            os_obtained_bytes,
            peak_resident_set_bytes,
            collections,
        }
    }

    /// Translate into the fields a host runtime's memory-stats call expects.
    #[must_use]
    pub fn host_view(&self) -> HostMemStats {
        HostMemStats {
            sys: widen(self.peak_resident_set_bytes).saturating_add(widen(self.os_obtained_bytes)),
            heap_sys: widen(self.heap_size_bytes),
            heap_idle: widen(self.free_bytes),
            heap_released: widen(self.unmapped_bytes),
            total_alloc: widen(self.total_allocated_bytes),
            num_gc: widen(self.collections),
        }
    }
}

/// Host-facing memory statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostMemStats {
    /// Process memory: peak RSS plus what the collector mapped from the OS.
    pub sys: u64,
    pub heap_sys: u64,
    pub heap_idle: u64,
    pub heap_released: u64,
    /// Cumulative bytes allocated. Never decreases.
    pub total_alloc: u64,
    pub num_gc: u64,
}

#[inline]
fn widen(v: usize) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_view_maps_each_field() {
        let usage = HeapUsage {
            heap_size: 1 << 20,
            free_bytes: 4096,
            unmapped_bytes: 512,
            bytes_since_gc: 128,
            total_bytes: 9000,
        };
        let snap = MemoryStatsSnapshot::compose(usage, 2 << 20, 7 << 20, 3);
        let host = snap.host_view();
        assert_eq!(host.sys, (7 << 20) + (2 << 20));
        assert_eq!(host.heap_sys, 1 << 20);
        assert_eq!(host.heap_idle, 4096);
        assert_eq!(host.heap_released, 512);
        assert_eq!(host.total_alloc, 9000);
        assert_eq!(host.num_gc, 3);
    }

    #[test]
    fn sys_saturates() {
        let snap = MemoryStatsSnapshot {
            os_obtained_bytes: usize::MAX,
            peak_resident_set_bytes: usize::MAX,
            ..MemoryStatsSnapshot::default()
        };
        assert_eq!(snap.host_view().sys, u64::MAX);
    }

    #[test]
    fn serializes_with_field_names() {
        let host = HostMemStats {
            heap_idle: 10,
            ..HostMemStats::default()
        };
        let v = serde_json::to_value(host).unwrap();
        assert_eq!(v["heap_idle"], 10);
        assert_eq!(v["num_gc"], 0);
    }
}
