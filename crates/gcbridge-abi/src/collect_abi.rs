//! ABI layer for heap setup and collection control.

use std::ffi::{c_int, c_void};

use gcbridge_core::error::{BridgeError, MisuseViolation, code};
use gcbridge_core::{CycleTicket, HeapConfig};

use crate::state::{MarkStackFn, bridge, publish_roots, set_mark_stack};

/// Route requests that carry a layout through the typed primitives.
pub const GCBRIDGE_FLAG_PRECISE: u32 = 1;

fn status(result: Result<(), BridgeError>) -> c_int {
    match result {
        Ok(()) => code::OK,
        Err(err) => err.code(),
    }
}

fn not_ready(op: &'static str) -> c_int {
    BridgeError::from(MisuseViolation::NotInitialized { op }).code()
}

/// Configure the collector. Must be called once, before any allocation.
#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_init(big_object_threshold: usize, max_heap: usize) -> c_int {
    gcbridge_init_with_flags(big_object_threshold, max_heap, 0)
}

/// [`gcbridge_init`] with `GCBRIDGE_FLAG_*` bits.
#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_init_with_flags(
    big_object_threshold: usize,
    max_heap: usize,
    flags: u32,
) -> c_int {
    let Some(bridge) = bridge() else {
        return not_ready("initialize");
    };
    let config = HeapConfig::default()
        .with_big_object_threshold(big_object_threshold)
        .with_max_heap(max_heap)
        .with_precise_allocation(flags & GCBRIDGE_FLAG_PRECISE != 0);
    status(bridge.initialize(config))
}

/// Register the host stack scanner run at the start of every collection.
/// Passing null unregisters it.
#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_set_mark_stack(mark_stack: Option<MarkStackFn>) {
    set_mark_stack(mark_stack);
}

/// Run a full collection and wait for it.
#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_gc() -> c_int {
    match bridge() {
        Some(bridge) => status(bridge.force_collect()),
        None => not_ready("force_collect"),
    }
}

/// Open a host marking window. Returns the ticket, or 0 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_begin_collection() -> u64 {
    bridge()
        .and_then(|bridge| bridge.begin_collection().ok())
        .map_or(0, CycleTicket::id)
}

/// Close the window for `ticket` and run the collection.
#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_confirm_roots_marked(ticket: u64) -> c_int {
    match bridge() {
        Some(bridge) => status(bridge.confirm_roots_marked(CycleTicket::from_raw(ticket))),
        None => not_ready("confirm_roots_marked"),
    }
}

/// Close the window for `ticket` without collecting.
#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_abandon_collection(ticket: u64) -> c_int {
    match bridge() {
        Some(bridge) => status(bridge.abandon_collection(CycleTicket::from_raw(ticket))),
        None => not_ready("abandon_collection"),
    }
}

/// Publish one word that may point into the heap. Call from the registered
/// mark-stack callback; values pushed outside a collection are kept for the
/// next one. libgc finds roots by scanning thread stacks itself, so with the
/// `bdwgc` backend this does nothing.
#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_push_root(value: usize) {
    publish_roots([value]);
}

/// Publish every aligned word in `[start, end)` as a root, as
/// [`gcbridge_push_root`] does. An empty or inverted range is ignored.
///
/// # Safety
///
/// The range must be readable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gcbridge_push_root_range(start: *const c_void, end: *const c_void) {
    const WORD: usize = std::mem::size_of::<usize>();
    let (start, end) = (start as usize, end as usize);
    let Some(first) = start.checked_next_multiple_of(WORD) else {
        return;
    };
    if start == 0 || end <= first {
        return;
    }
    let words = (end - first) / WORD;
    // SAFETY: `first` is aligned and `words` words fit inside the caller's
    // readable range.
    let values = unsafe { std::slice::from_raw_parts(first as *const usize, words) };
    publish_roots(values.iter().copied());
}

/// Heap-resident root range. Accepted and ignored; the collector already
/// scans its own heap.
#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_mark_roots(start: *const c_void, end: *const c_void) {
    if let Some(bridge) = bridge() {
        bridge.mark_roots(start.cast(), end.cast());
    }
}
