//! ABI layer for memory statistics.

use gcbridge_core::HostMemStats;

use crate::state::bridge;

/// Memory statistics in the host runtime's vocabulary. All fields are bytes
/// except `num_gc`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcBridgeMemStats {
    pub sys: u64,
    pub heap_sys: u64,
    pub heap_idle: u64,
    pub heap_released: u64,
    pub total_alloc: u64,
    pub num_gc: u64,
}

impl From<HostMemStats> for GcBridgeMemStats {
    fn from(s: HostMemStats) -> Self {
        Self {
            sys: s.sys,
            heap_sys: s.heap_sys,
            heap_idle: s.heap_idle,
            heap_released: s.heap_released,
            total_alloc: s.total_alloc,
            num_gc: s.num_gc,
        }
    }
}

/// Fill `*out` with current statistics. Valid before `gcbridge_init`.
/// A null `out` is ignored.
///
/// # Safety
///
/// A non-null `out` must be valid for writes of one `GcBridgeMemStats`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gcbridge_read_mem_stats(out: *mut GcBridgeMemStats) {
    if out.is_null() {
        return;
    }
    let stats = bridge()
        .map(|b| GcBridgeMemStats::from(b.host_stats()))
        .unwrap_or_default();
    // SAFETY: caller contract.
    unsafe { out.write(stats) };
}
