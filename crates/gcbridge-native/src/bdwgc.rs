//! Binding to the system Boehm-Demers-Weiser collector (`libgc`).

use std::ffi::{c_int, c_void};
use std::sync::Once;

use gcbridge_core::collector::WarnProc;
use gcbridge_core::{CollectionEvent, CollectionHook, GcDescriptor, HeapUsage, NativeCollector};
use parking_lot::RwLock;

use crate::os;

type GcWord = usize;
type GcEventProc = extern "C" fn(c_int);
type GcFn = extern "C" fn(*mut c_void) -> *mut c_void;

#[link(name = "gc")]
unsafe extern "C" {
    fn GC_init();
    fn GC_malloc(size: usize) -> *mut c_void;
    fn GC_malloc_ignore_off_page(size: usize) -> *mut c_void;
    fn GC_malloc_explicitly_typed(size: usize, descriptor: GcWord) -> *mut c_void;
    fn GC_calloc_explicitly_typed(count: usize, elem_size: usize, descriptor: GcWord) -> *mut c_void;
    fn GC_make_descriptor(bitmap: *const GcWord, len: usize) -> GcWord;
    fn GC_free(ptr: *mut c_void);
    fn GC_gcollect();
    fn GC_get_gc_no() -> GcWord;
    fn GC_get_heap_usage_safe(
        heap_size: *mut GcWord,
        free_bytes: *mut GcWord,
        unmapped_bytes: *mut GcWord,
        bytes_since_gc: *mut GcWord,
        total_bytes: *mut GcWord,
    );
    fn GC_get_obtained_from_os_bytes() -> usize;
    fn GC_set_on_collection_event(proc_: GcEventProc);
    fn GC_set_warn_proc(proc_: WarnProc);
    fn GC_set_max_heap_size(bytes: GcWord);
    fn GC_base(ptr: *mut c_void) -> *mut c_void;
    fn GC_is_marked(ptr: *const c_void) -> c_int;
    fn GC_call_with_alloc_lock(f: GcFn, client_data: *mut c_void) -> *mut c_void;
}

// libgc keeps a single callback slot per process; so does this binding.
static EVENT_HOOK: RwLock<Option<CollectionHook>> = RwLock::new(None);
static GC_INIT: Once = Once::new();

extern "C" fn event_trampoline(raw: c_int) {
    let hook = EVENT_HOOK.read().clone();
    if let Some(hook) = hook {
        hook(CollectionEvent::from_raw(raw as u32));
    }
}

extern "C" fn run_locked(data: *mut c_void) -> *mut c_void {
    // SAFETY: `data` points at the `&mut dyn FnMut()` owned by the
    // `with_collection_lock` frame that is blocked on this call.
    let f = unsafe { &mut *data.cast::<&mut dyn FnMut()>() };
    f();
    std::ptr::null_mut()
}

/// Handle to the process-wide libgc heap.
#[derive(Debug, Clone, Copy)]
pub struct BdwgcCollector {
    _private: (),
}

impl BdwgcCollector {
    /// Initializes libgc on first use.
    #[must_use]
    pub fn new() -> Self {
        GC_INIT.call_once(|| {
            // SAFETY: GC_init is idempotent and takes no arguments.
            unsafe { GC_init() };
        });
        Self { _private: () }
    }
}

impl Default for BdwgcCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeCollector for BdwgcCollector {
    fn malloc(&self, size: usize) -> *mut u8 {
        // SAFETY: plain allocation call.
        unsafe { GC_malloc(size).cast() }
    }

    fn malloc_ignore_off_page(&self, size: usize) -> *mut u8 {
        // SAFETY: plain allocation call.
        unsafe { GC_malloc_ignore_off_page(size).cast() }
    }

    fn malloc_explicitly_typed(&self, size: usize, descriptor: GcDescriptor) -> *mut u8 {
        // SAFETY: descriptor was produced by GC_make_descriptor.
        unsafe { GC_malloc_explicitly_typed(size, descriptor.0).cast() }
    }

    fn calloc_explicitly_typed(
        &self,
        count: usize,
        elem_size: usize,
        descriptor: GcDescriptor,
    ) -> *mut u8 {
        // SAFETY: descriptor was produced by GC_make_descriptor.
        unsafe { GC_calloc_explicitly_typed(count, elem_size, descriptor.0).cast() }
    }

    fn make_descriptor(&self, bitmap: &[usize], len_bits: usize) -> GcDescriptor {
        let len_bits = len_bits.min(bitmap.len() * usize::BITS as usize);
        let ptr = if bitmap.is_empty() {
            std::ptr::null()
        } else {
            bitmap.as_ptr()
        };
        // SAFETY: libgc reads at most `len_bits` bits from `ptr`, which the
        // clamp above keeps inside `bitmap`.
        GcDescriptor(unsafe { GC_make_descriptor(ptr, len_bits) })
    }

    unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: caller guarantees `ptr` is a live libgc block.
        unsafe { GC_free(ptr.cast()) }
    }

    fn gcollect(&self) {
        // SAFETY: no preconditions beyond GC_init.
        unsafe { GC_gcollect() }
    }

    fn heap_usage(&self) -> HeapUsage {
        let mut usage = HeapUsage::default();
        // SAFETY: all five out-pointers are valid for one word each.
        unsafe {
            GC_get_heap_usage_safe(
                &mut usage.heap_size,
                &mut usage.free_bytes,
                &mut usage.unmapped_bytes,
                &mut usage.bytes_since_gc,
                &mut usage.total_bytes,
            );
        }
        usage
    }

    fn obtained_from_os_bytes(&self) -> usize {
        // SAFETY: read-only query.
        unsafe { GC_get_obtained_from_os_bytes() }
    }

    fn gc_no(&self) -> usize {
        // SAFETY: read-only query.
        unsafe { GC_get_gc_no() }
    }

    fn base_of(&self, ptr: *const u8) -> *mut u8 {
        // SAFETY: GC_base accepts any address and returns null for foreign ones.
        unsafe { GC_base(ptr.cast_mut().cast()).cast() }
    }

    fn with_collection_lock(&self, mut f: &mut dyn FnMut()) {
        let data = (&raw mut f).cast::<c_void>();
        // SAFETY: `run_locked` only dereferences `data` while this frame is live.
        unsafe { GC_call_with_alloc_lock(run_locked, data) };
    }

    fn survived_last_collection(&self, base: *const u8) -> bool {
        // Mark bits of the last cycle stay valid until the next one clears
        // them; lazily swept slots have theirs cleared.
        // SAFETY: callers hold the allocator lock and pass a libgc object base.
        unsafe { GC_is_marked(base.cast()) != 0 }
    }

    fn set_on_collection_event(&self, hook: CollectionHook) {
        *EVENT_HOOK.write() = Some(hook);
        // SAFETY: the trampoline is a plain extern "C" fn with static lifetime.
        unsafe { GC_set_on_collection_event(event_trampoline) }
    }

    fn set_warn_proc(&self, warn: WarnProc) {
        // SAFETY: `warn` is an extern "C" fn with static lifetime.
        unsafe { GC_set_warn_proc(warn) }
    }

    fn set_max_heap_size(&self, bytes: usize) {
        // SAFETY: plain setter.
        unsafe { GC_set_max_heap_size(bytes) }
    }

    fn peak_resident_set_bytes(&self) -> usize {
        os::peak_rss_bytes()
    }
}
