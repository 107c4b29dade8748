//! Native collector interface.
//!
//! The bridge reaches the collector only through [`NativeCollector`]. Each
//! method corresponds to one entry point of the bdwgc C API; sizes are in
//! bytes. Implementations live in `gcbridge-native`.

use std::ffi::c_char;
use std::sync::Arc;

/// Opaque type descriptor (`GC_descr`) built by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GcDescriptor(pub usize);

/// Counters reported by `GC_get_heap_usage_safe`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    pub heap_size: usize,
    pub free_bytes: usize,
    pub unmapped_bytes: usize,
    pub bytes_since_gc: usize,
    pub total_bytes: usize,
}

/// Collection lifecycle events, numbered as bdwgc's `GC_EventType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionEvent {
    Start,
    MarkStart,
    MarkEnd,
    ReclaimStart,
    ReclaimEnd,
    End,
    PreStopWorld,
    PostStopWorld,
    PreStartWorld,
    PostStartWorld,
    ThreadSuspended,
    ThreadUnsuspended,
    Unknown(u32),
}

impl CollectionEvent {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Start,
            1 => Self::MarkStart,
            2 => Self::MarkEnd,
            3 => Self::ReclaimStart,
            4 => Self::ReclaimEnd,
            5 => Self::End,
            6 => Self::PreStopWorld,
            7 => Self::PostStopWorld,
            8 => Self::PreStartWorld,
            9 => Self::PostStartWorld,
            10 => Self::ThreadSuspended,
            11 => Self::ThreadUnsuspended,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Start => 0,
            Self::MarkStart => 1,
            Self::MarkEnd => 2,
            Self::ReclaimStart => 3,
            Self::ReclaimEnd => 4,
            Self::End => 5,
            Self::PreStopWorld => 6,
            Self::PostStopWorld => 7,
            Self::PreStartWorld => 8,
            Self::PostStartWorld => 9,
            Self::ThreadSuspended => 10,
            Self::ThreadUnsuspended => 11,
            Self::Unknown(raw) => raw,
        }
    }
}

/// Receiver for collection events.
pub type CollectionHook = Arc<dyn Fn(CollectionEvent) + Send + Sync>;

/// Warning procedure signature (`GC_warn_proc`).
pub type WarnProc = extern "C" fn(*mut c_char, usize);

/// Warning procedure that drops every message.
pub extern "C" fn ignore_warnings(_msg: *mut c_char, _arg: usize) {}

/// The fixed native API of a conservative mark-and-sweep collector.
///
/// Allocation primitives return null when the request cannot be satisfied
/// even after the collector's own collection attempt. Any primitive that
/// allocates may run a collection and fire the installed hook before it
/// returns.
pub trait NativeCollector: Send + Sync {
    /// Pooled small-object allocation. Memory is zeroed and scanned conservatively.
    fn malloc(&self, size: usize) -> *mut u8;

    /// Allocation for big objects that keeps interior pointers beyond the
    /// first page from retaining the block.
    fn malloc_ignore_off_page(&self, size: usize) -> *mut u8;

    /// Allocation scanned precisely according to `descriptor`.
    fn malloc_explicitly_typed(&self, size: usize, descriptor: GcDescriptor) -> *mut u8;

    /// Zeroed array of `count` elements, each scanned according to `descriptor`.
    fn calloc_explicitly_typed(
        &self,
        count: usize,
        elem_size: usize,
        descriptor: GcDescriptor,
    ) -> *mut u8;

    /// Build a descriptor from a pointer bitmap of `len_bits` words.
    fn make_descriptor(&self, bitmap: &[usize], len_bits: usize) -> GcDescriptor;

    /// Return a block to the collector outside of any cycle.
    ///
    /// # Safety
    ///
    /// `ptr` must be the base of a live block obtained from this collector.
    unsafe fn free(&self, ptr: *mut u8);

    /// Run one full collection.
    fn gcollect(&self);

    fn heap_usage(&self) -> HeapUsage;

    fn obtained_from_os_bytes(&self) -> usize;

    /// Number of completed collections.
    fn gc_no(&self) -> usize;

    /// Base address of the heap block containing `ptr`, or null. Like
    /// `GC_base`, this may answer for a slot that has already been reclaimed.
    fn base_of(&self, ptr: *const u8) -> *mut u8;

    /// Run `f` while no collection can start or finish.
    fn with_collection_lock(&self, f: &mut dyn FnMut());

    /// Whether the block at `base` survived the most recent completed
    /// collection. Only meaningful for blocks allocated before that
    /// collection started, and only inside
    /// [`with_collection_lock`](Self::with_collection_lock).
    fn survived_last_collection(&self, base: *const u8) -> bool;

    fn set_on_collection_event(&self, hook: CollectionHook);

    fn set_warn_proc(&self, warn: WarnProc);

    fn set_max_heap_size(&self, bytes: usize);

    /// Peak resident set size of the process, from the OS-facing allocator.
    fn peak_resident_set_bytes(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_numbering_round_trips() {
        for raw in 0..16 {
            assert_eq!(CollectionEvent::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(CollectionEvent::from_raw(0), CollectionEvent::Start);
        assert_eq!(CollectionEvent::from_raw(5), CollectionEvent::End);
        assert_eq!(CollectionEvent::from_raw(42), CollectionEvent::Unknown(42));
    }

    #[test]
    fn ignore_warnings_accepts_null() {
        ignore_warnings(std::ptr::null_mut(), 0);
    }
}
