//! C-surface contract against the simulated backend.
//!
//! The bridge is process-global and can be initialized once, so the whole
//! lifecycle runs as one ordered test.

#![cfg(not(feature = "bdwgc"))]

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use gcbridge_abi::alloc_abi::{gcbridge_alloc, gcbridge_free, gcbridge_try_alloc, gcbridge_try_free};
use gcbridge_abi::collect_abi::{
    GCBRIDGE_FLAG_PRECISE, gcbridge_abandon_collection, gcbridge_begin_collection,
    gcbridge_confirm_roots_marked, gcbridge_gc, gcbridge_init, gcbridge_init_with_flags,
    gcbridge_mark_roots, gcbridge_push_root, gcbridge_push_root_range, gcbridge_set_mark_stack,
};
use gcbridge_abi::stats_abi::{GcBridgeMemStats, gcbridge_read_mem_stats};
use gcbridge_abi::with_bridge;
use gcbridge_core::error::code;
use parking_lot::Mutex;

static MARKS: AtomicUsize = AtomicUsize::new(0);
static HELD: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Publishes the host's held blocks through the C surface only.
extern "C" fn host_mark_stack() {
    MARKS.fetch_add(1, Ordering::SeqCst);
    let held: Vec<usize> = HELD.lock().clone();
    if let Some((first, rest)) = held.split_first() {
        gcbridge_push_root(*first);
        let range = rest.as_ptr_range();
        unsafe { gcbridge_push_root_range(range.start.cast(), range.end.cast()) };
    }
}

fn read_stats() -> GcBridgeMemStats {
    let mut stats = GcBridgeMemStats::default();
    unsafe { gcbridge_read_mem_stats(&mut stats) };
    stats
}

fn try_alloc(size: usize) -> (i32, *mut c_void) {
    let mut out = ptr::null_mut();
    let rc = unsafe { gcbridge_try_alloc(size, ptr::null(), 0, 0, &mut out) };
    (rc, out)
}

#[test]
fn abi_lifecycle_contract() {
    // Before init: everything except stats is refused.
    let (rc, out) = try_alloc(64);
    assert_eq!(rc, code::NOT_INITIALIZED);
    assert!(out.is_null());
    let mut word = 0usize;
    let stray = (&mut word as *mut usize).cast::<c_void>();
    assert_eq!(unsafe { gcbridge_try_free(stray) }, code::NOT_INITIALIZED);
    assert_eq!(gcbridge_gc(), code::NOT_INITIALIZED);
    assert_eq!(gcbridge_begin_collection(), 0);
    assert_eq!(read_stats().num_gc, 0);

    // Init validates, then refuses a second call.
    assert_eq!(gcbridge_init(0, 64 << 20), code::INVALID_CONFIG);
    assert_eq!(gcbridge_init(100 * 1024, 64 << 20), code::OK);
    assert_eq!(gcbridge_init(100 * 1024, 64 << 20), code::ALREADY_INITIALIZED);
    assert_eq!(
        gcbridge_init_with_flags(100 * 1024, 64 << 20, GCBRIDGE_FLAG_PRECISE),
        code::ALREADY_INITIALIZED
    );
    gcbridge_set_mark_stack(Some(host_mark_stack));

    // Small and large requests, both held by the host.
    let (rc, small) = try_alloc(50_000);
    assert_eq!(rc, code::OK);
    assert!(!small.is_null());
    let large = unsafe { gcbridge_alloc(200_000, ptr::null(), 0, 0) };
    assert!(!large.is_null());
    assert_eq!(large as usize % 16, 0);
    HELD.lock().extend([small as usize, large as usize]);

    let counts = with_bridge(|b| b.collector().call_counts()).unwrap();
    assert_eq!(counts.malloc, 1);
    assert_eq!(counts.malloc_ignore_off_page, 1);

    // A layout is ignored when precise allocation is off.
    let bitmap = [0b1usize];
    let mut typed = ptr::null_mut();
    assert_eq!(
        unsafe { gcbridge_try_alloc(32, bitmap.as_ptr(), 1, 1, &mut typed) },
        code::OK
    );
    assert_eq!(
        with_bridge(|b| b.collector().call_counts().malloc_explicitly_typed),
        Some(0)
    );

    assert_eq!(gcbridge_gc(), code::OK);
    assert_eq!(MARKS.load(Ordering::SeqCst), 1);
    let after_first = read_stats();
    assert_eq!(after_first.num_gc, 1);
    assert!(after_first.total_alloc >= 250_000);
    assert!(after_first.sys >= after_first.heap_sys);
    assert!(with_bridge(|b| b.collector().is_live(small.cast())).unwrap());
    assert!(with_bridge(|b| b.collector().is_live(large.cast())).unwrap());
    // The unheld typed block was reclaimed.
    assert!(!with_bridge(|b| b.collector().is_live(typed.cast())).unwrap());

    // Explicit release, then misuse.
    HELD.lock().clear();
    assert_eq!(unsafe { gcbridge_try_free(small) }, code::OK);
    assert_eq!(unsafe { gcbridge_try_free(small) }, code::DOUBLE_RELEASE);
    assert_eq!(unsafe { gcbridge_try_free(stray) }, code::UNOWNED_RELEASE);
    assert_eq!(unsafe { gcbridge_try_free(ptr::null_mut()) }, code::OK);
    unsafe { gcbridge_free(ptr::null_mut()) };
    unsafe { gcbridge_free(large) };

    assert_eq!(gcbridge_gc(), code::OK);
    let after_second = read_stats();
    assert!(after_second.heap_idle > after_first.heap_idle);
    assert_eq!(MARKS.load(Ordering::SeqCst), 2);

    // Two-phase collection.
    let ticket = gcbridge_begin_collection();
    assert_ne!(ticket, 0);
    assert_eq!(gcbridge_begin_collection(), 0);
    assert_eq!(gcbridge_gc(), code::COLLECTION_IN_PROGRESS);
    assert_eq!(gcbridge_confirm_roots_marked(ticket + 1), code::TICKET_MISMATCH);
    assert_eq!(gcbridge_confirm_roots_marked(ticket), code::OK);
    assert_eq!(MARKS.load(Ordering::SeqCst), 2);
    assert_eq!(read_stats().num_gc, 3);

    let ticket = gcbridge_begin_collection();
    assert_eq!(gcbridge_abandon_collection(ticket), code::OK);
    assert_eq!(gcbridge_abandon_collection(ticket), code::TICKET_MISMATCH);
    assert_eq!(read_stats().num_gc, 3);

    let region = [0usize; 2];
    gcbridge_mark_roots(region.as_ptr().cast(), region.as_ptr().wrapping_add(2).cast());

    let snap = with_bridge(|b| b.metrics().snapshot()).unwrap();
    assert_eq!(snap.releases, 2);
    assert_eq!(snap.collections_forced, 3);
    assert!(snap.misuse >= 2);

    let jsonl = with_bridge(|b| b.lifecycle_log().to_jsonl()).unwrap();
    let first: serde_json::Value =
        serde_json::from_str(jsonl.lines().next().expect("log line")).unwrap();
    assert!(first["trace_id"].as_str().unwrap().starts_with("gcbridge::"));
}
