use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gcbridge_core::error::code;
use gcbridge_core::{
    AllocPath, BridgeError, CheckLevel, DescriptorCache, GcBridge, HeapConfig, PointerBitmap,
};
use gcbridge_native::SimCollector;
use parking_lot::Mutex;

/// A host runtime: a bridge plus the pointers its "stack" currently holds.
struct Host {
    bridge: GcBridge<SimCollector>,
    stack: Arc<Mutex<Vec<usize>>>,
    marks: Arc<AtomicUsize>,
}

impl Host {
    fn new(config: HeapConfig) -> Self {
        let sim = SimCollector::new();
        let sink = sim.root_sink();
        let stack = Arc::new(Mutex::new(Vec::new()));
        let marks = Arc::new(AtomicUsize::new(0));

        let (held, counter) = (Arc::clone(&stack), Arc::clone(&marks));
        let bridge = GcBridge::with_descriptor_cache(
            sim,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                sink.extend(held.lock().iter().copied());
            },
            Arc::new(DescriptorCache::new()),
        );
        bridge.initialize(config).expect("initialize");
        Self {
            bridge,
            stack,
            marks,
        }
    }

    fn hold(&self, ptr: NonNull<u8>) {
        self.stack.lock().push(ptr.as_ptr() as usize);
    }

    fn drop_ref(&self, ptr: NonNull<u8>) {
        self.stack.lock().retain(|&p| p != ptr.as_ptr() as usize);
    }

    fn marks(&self) -> usize {
        self.marks.load(Ordering::SeqCst)
    }

    fn sim(&self) -> &SimCollector {
        self.bridge.collector()
    }
}

fn config() -> HeapConfig {
    HeapConfig::default()
        .with_big_object_threshold(100 * 1024)
        .with_max_heap(64 * 1024 * 1024)
        .with_check_level(CheckLevel::Strict)
}

#[test]
fn initialize_drives_the_collector_setup_calls() {
    let host = Host::new(config());
    let counts = host.sim().call_counts();
    assert_eq!(counts.set_on_collection_event, 1);
    assert_eq!(counts.make_descriptor, 1);
    assert_eq!(counts.set_warn_proc, 1);
    assert_eq!(counts.set_max_heap_size, 1);
    assert!(host.sim().has_warn_proc());
    assert_eq!(host.sim().max_heap(), 64 * 1024 * 1024);
}

#[test]
fn threshold_splits_small_and_large_paths() {
    let host = Host::new(config());
    let threshold = 100 * 1024;
    let sizes = [1, 16, 4096, threshold - 1, threshold, threshold + 1, 3 * threshold];
    for size in sizes {
        host.bridge.allocate(size, None).unwrap();
    }
    let counts = host.sim().call_counts();
    let small = sizes.iter().filter(|&&s| s < threshold).count() as u64;
    assert_eq!(counts.malloc, small);
    assert_eq!(counts.malloc_ignore_off_page, sizes.len() as u64 - small);
    assert_eq!(counts.malloc_explicitly_typed, 0);
}

#[test]
fn total_alloc_never_decreases() {
    let host = Host::new(config());
    let mut last = host.bridge.host_stats().total_alloc;
    let mut held = Vec::new();
    for i in 0..200usize {
        let size = 24 + (i * 7919) % 150_000;
        let ptr = host.bridge.allocate(size, None).unwrap();
        if i % 3 == 0 {
            unsafe { host.bridge.release(ptr) }.unwrap();
        } else {
            held.push(ptr);
        }
        if i % 50 == 49 {
            host.bridge.force_collect().unwrap();
        }
        let now = host.bridge.host_stats().total_alloc;
        assert!(now >= last, "step {i}: total_alloc went from {last} to {now}");
        last = now;
    }
}

#[test]
fn release_then_collect_does_not_shrink_heap_idle() {
    let host = Host::new(config());
    let ptr = host.bridge.allocate(5000, None).unwrap();
    host.hold(ptr);

    let before = host.bridge.host_stats().heap_idle;
    host.drop_ref(ptr);
    unsafe { host.bridge.release(ptr) }.unwrap();
    host.bridge.force_collect().unwrap();
    let after = host.bridge.host_stats().heap_idle;
    assert!(after >= before, "heap_idle {before} -> {after}");
    assert!(!host.sim().is_live(ptr.as_ptr()));
}

#[test]
fn each_forced_collection_marks_the_stack_once() {
    let host = Host::new(config());
    for round in 1..=5 {
        host.bridge.force_collect().unwrap();
        assert_eq!(host.marks(), round);
    }
    assert_eq!(host.sim().call_counts().gcollect, 5);
    assert_eq!(host.bridge.read_stats().collections, 5);
}

#[test]
fn identical_layouts_share_one_descriptor() {
    let host = Host::new(config().with_precise_allocation(true));
    let shape = PointerBitmap::from_words(&[0b0101], 4);

    host.bridge.allocate(32, Some(&shape)).unwrap();
    let first = host.bridge.resolve_descriptor(&shape);
    host.bridge.allocate(32, Some(&PointerBitmap::from_pointer_words(4, [0, 2]))).unwrap();
    let second = host.bridge.resolve_descriptor(&shape);

    assert!(Arc::ptr_eq(&first, &second));
    let counts = host.sim().call_counts();
    assert_eq!(counts.malloc_explicitly_typed, 2);
    // One priming call during initialize, one build for the shape.
    assert_eq!(counts.make_descriptor, 2);
}

#[test]
fn typed_allocation_keeps_only_described_pointers_alive() {
    let host = Host::new(config().with_precise_allocation(true));
    let word = std::mem::size_of::<usize>();
    let shape = PointerBitmap::from_pointer_words(2, [1]);

    let holder = host.bridge.allocate(2 * word, Some(&shape)).unwrap();
    let scalar_target = host.bridge.allocate(64, None).unwrap();
    let pointer_target = host.bridge.allocate(64, None).unwrap();
    let slots = holder.as_ptr().cast::<usize>();
    unsafe {
        slots.write(scalar_target.as_ptr() as usize);
        slots.add(1).write(pointer_target.as_ptr() as usize);
    }
    host.hold(holder);

    host.bridge.force_collect().unwrap();
    assert!(host.sim().is_live(pointer_target.as_ptr()));
    assert!(!host.sim().is_live(scalar_target.as_ptr()));
}

#[test]
fn ceiling_yields_out_of_memory_not_overcommit() {
    let max_heap = 1024 * 1024;
    let host = Host::new(config().with_max_heap(max_heap));
    let chunk = 64 * 1024;

    for _ in 0..(max_heap / chunk) {
        let ptr = host.bridge.allocate(chunk, None).unwrap();
        host.hold(ptr);
    }
    let err = host.bridge.allocate(chunk, None).unwrap_err();
    assert_eq!(
        err,
        BridgeError::OutOfMemory {
            requested: chunk,
            path: AllocPath::Small
        }
    );
    assert_eq!(err.code(), code::OUT_OF_MEMORY);

    let usage = host.bridge.read_stats();
    assert!(usage.heap_size_bytes <= max_heap);
    // The collector tried a collection before giving up, and the host marked.
    assert!(host.marks() >= 1);
    assert_eq!(host.sim().call_counts().warnings, 1);
    assert_eq!(host.bridge.metrics().snapshot().out_of_memory, 1);
}

#[test]
fn pressure_collection_reclaims_garbage_and_prunes_ledger() {
    let host = Host::new(config().with_max_heap(256 * 1024));
    let kept = host.bridge.allocate(64 * 1024, None).unwrap();
    host.hold(kept);
    let garbage = host.bridge.allocate(64 * 1024, None).unwrap();
    for _ in 0..2 {
        let ptr = host.bridge.allocate(64 * 1024, None).unwrap();
        host.hold(ptr);
    }
    assert_eq!(host.marks(), 0);

    // Full heap: this request forces a native cycle from inside malloc.
    host.bridge.allocate(64 * 1024, None).unwrap();
    assert_eq!(host.marks(), 1);
    assert!(host.sim().is_live(kept.as_ptr()));
    assert!(!host.sim().is_live(garbage.as_ptr()));

    let err = unsafe { host.bridge.release(garbage) }.unwrap_err();
    assert_eq!(err.code(), code::UNOWNED_RELEASE);
    unsafe { host.bridge.release(kept) }.unwrap();
}

#[test]
fn two_phase_collection_uses_host_marked_roots() {
    let host = Host::new(config());
    let sink = host.sim().root_sink();
    let kept = host.bridge.allocate(128, None).unwrap();
    let dropped = host.bridge.allocate(128, None).unwrap();

    let ticket = host.bridge.begin_collection().unwrap();
    sink.push_ptr(kept.as_ptr());
    host.bridge.confirm_roots_marked(ticket).unwrap();

    assert_eq!(host.marks(), 0);
    assert!(host.sim().is_live(kept.as_ptr()));
    assert!(!host.sim().is_live(dropped.as_ptr()));
    assert_eq!(host.sim().call_counts().gcollect, 1);
}

#[test]
fn double_release_is_caught_before_native_free() {
    let host = Host::new(config());
    let ptr = host.bridge.allocate(256, None).unwrap();
    unsafe { host.bridge.release(ptr) }.unwrap();
    let err = unsafe { host.bridge.release(ptr) }.unwrap_err();
    assert_eq!(err.code(), code::DOUBLE_RELEASE);
    assert_eq!(host.sim().call_counts().free, 1);
}

#[test]
fn end_to_end_small_and_large_lifecycle() {
    let host = Host::new(config());

    let small = host.bridge.allocate(50_000, None).unwrap();
    let large = host.bridge.allocate(200_000, None).unwrap();
    host.hold(small);
    host.hold(large);
    let counts = host.sim().call_counts();
    assert_eq!(counts.malloc, 1);
    assert_eq!(counts.malloc_ignore_off_page, 1);

    host.bridge.force_collect().unwrap();
    assert!(host.sim().is_live(small.as_ptr()));
    assert!(host.sim().is_live(large.as_ptr()));
    let after_first = host.bridge.host_stats();
    assert!(after_first.total_alloc >= 250_000);
    assert!(after_first.total_alloc < 250_000 + 64);
    assert_eq!(after_first.num_gc, 1);

    host.drop_ref(small);
    host.drop_ref(large);
    unsafe {
        host.bridge.release(small).unwrap();
        host.bridge.release(large).unwrap();
    }
    host.bridge.force_collect().unwrap();

    let after_second = host.bridge.host_stats();
    assert!(
        after_second.heap_idle > after_first.heap_idle,
        "heap_idle {} -> {}",
        after_first.heap_idle,
        after_second.heap_idle
    );
    assert_eq!(after_second.num_gc, 2);
    assert_eq!(host.marks(), 2);
    assert!(after_second.sys >= after_second.heap_sys);

    let snap = host.bridge.metrics().snapshot();
    assert_eq!(snap.small_allocs, 1);
    assert_eq!(snap.large_allocs, 1);
    assert_eq!(snap.releases, 2);
    assert_eq!(snap.collections_forced, 2);
}
