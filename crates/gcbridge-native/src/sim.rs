//! In-process conservative mark-and-sweep collector.
//!
//! [`SimCollector`] implements the same observable contract as bdwgc through
//! [`NativeCollector`] so the bridge can be exercised without linking libgc:
//!
//! - blocks are zeroed and rounded up to a 16-byte granule;
//! - the only roots are the values the host publishes through a
//!   [`RootSink`] while the `Start` event runs, cleared after every cycle;
//! - block contents are scanned conservatively, except typed blocks, which
//!   are scanned according to their descriptor;
//! - any interior pointer retains a block, but off-page blocks are only
//!   retained by pointers into their first [`OFF_PAGE_WINDOW`] bytes;
//! - the heap grows in [`HEAP_INCREMENT`] steps up to the configured ceiling;
//!   a request that does not fit triggers one collection and a retry before
//!   null is returned.
//!
//! Collections only happen on request or under ceiling pressure, so a test
//! can count exactly how often the host marker runs.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use gcbridge_core::collector::WarnProc;
use gcbridge_core::{CollectionEvent, CollectionHook, GcDescriptor, HeapUsage, NativeCollector};
use parking_lot::{Mutex, RwLock};

use crate::os;

pub const GRANULE: usize = 16;
pub const HEAP_INCREMENT: usize = 64 * 1024;
pub const OFF_PAGE_WINDOW: usize = 4096;

const WORD: usize = std::mem::size_of::<usize>();
const WORD_BITS: usize = usize::BITS as usize;

// bdwgc descriptor tags (low two bits).
const DS_TAGS: usize = 0b11;
const DS_LENGTH: usize = 0;
const DS_BITMAP: usize = 1;
const SIGNB: usize = 1 << (WORD_BITS - 1);

const OOM_WARNING: &CStr = c"GC Warning: Out of Memory! Returning NULL!\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Conservative,
    OffPage,
    Typed { descriptor: usize, elem_words: usize },
}

#[derive(Debug)]
struct Block {
    layout: Layout,
    kind: BlockKind,
    marked: bool,
}

impl Block {
    fn size(&self) -> usize {
        self.layout.size()
    }

    /// Bytes from the base within which a pointer retains this block.
    fn reach(&self) -> usize {
        match self.kind {
            BlockKind::OffPage => self.size().min(OFF_PAGE_WINDOW),
            _ => self.size(),
        }
    }

    fn holds_pointer(&self, word: usize) -> bool {
        match self.kind {
            BlockKind::Conservative | BlockKind::OffPage => true,
            BlockKind::Typed {
                descriptor,
                elem_words,
            } => descriptor_marks_word(descriptor, word % elem_words.max(1)),
        }
    }
}

/// Whether a bdwgc-style descriptor declares word `word` a pointer.
fn descriptor_marks_word(descriptor: usize, word: usize) -> bool {
    match descriptor & DS_TAGS {
        DS_LENGTH => word.saturating_mul(WORD) < descriptor,
        DS_BITMAP => word < WORD_BITS - 2 && descriptor & (SIGNB >> word) != 0,
        _ => false,
    }
}

/// Encode a pointer bitmap the way bdwgc's `GC_make_descriptor` does for
/// simple layouts: no pointers and pointer-only prefixes become length
/// descriptors, short sparse layouts become bitmap descriptors. Layouts too
/// long for a bitmap fall back to a conservative length descriptor.
#[must_use]
pub fn encode_descriptor(bitmap: &[usize], len_bits: usize) -> usize {
    let bit = |i: usize| {
        bitmap
            .get(i / WORD_BITS)
            .is_some_and(|w| w & (1usize << (i % WORD_BITS)) != 0)
    };
    let Some(last_set) = (0..len_bits).rev().find(|&i| bit(i)) else {
        return DS_LENGTH;
    };
    let prefix_bytes = (last_set + 1).saturating_mul(WORD);
    if (0..last_set).all(bit) || last_set >= WORD_BITS - 2 {
        return prefix_bytes | DS_LENGTH;
    }
    let mut descriptor = DS_BITMAP;
    for i in (0..=last_set).filter(|&i| bit(i)) {
        descriptor |= SIGNB >> i;
    }
    descriptor
}

struct SimHeap {
    blocks: BTreeMap<usize, Block>,
    heap_size: usize,
    live_bytes: usize,
    max_heap: usize,
    bytes_since_gc: usize,
    total_bytes: usize,
}

impl SimHeap {
    fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            heap_size: 0,
            live_bytes: 0,
            max_heap: usize::MAX,
            bytes_since_gc: 0,
            total_bytes: 0,
        }
    }

    /// Make room for `bytes` more live data, growing the heap if the
    /// ceiling allows.
    fn reserve(&mut self, bytes: usize) -> bool {
        let Some(needed) = self.live_bytes.checked_add(bytes) else {
            return false;
        };
        if needed > self.heap_size {
            if needed > self.max_heap {
                return false;
            }
            let grown = needed
                .checked_next_multiple_of(HEAP_INCREMENT)
                .unwrap_or(needed);
            self.heap_size = grown.min(self.max_heap);
        }
        self.live_bytes = needed;
        true
    }

    fn block_containing(&self, value: usize, within_reach: bool) -> Option<usize> {
        let (&base, block) = self.blocks.range(..=value).next_back()?;
        let limit = if within_reach {
            block.reach()
        } else {
            block.size()
        };
        (value - base < limit).then_some(base)
    }

    fn mark_from(&mut self, roots: &[usize]) {
        let mut pending: Vec<usize> = roots
            .iter()
            .filter_map(|&v| self.block_containing(v, true))
            .collect();

        while let Some(base) = pending.pop() {
            let Some(block) = self.blocks.get_mut(&base) else {
                continue;
            };
            if block.marked {
                continue;
            }
            block.marked = true;

            let words = block.size() / WORD;
            for word in 0..words {
                let Some(block) = self.blocks.get(&base) else {
                    break;
                };
                if !block.holds_pointer(word) {
                    continue;
                }
                // SAFETY: `base` is a live block of at least `words * WORD`
                // bytes, allocated with 16-byte alignment.
                let value = unsafe { ((base + word * WORD) as *const usize).read() };
                if let Some(target) = self.block_containing(value, true) {
                    if self.blocks.get(&target).is_some_and(|b| !b.marked) {
                        pending.push(target);
                    }
                }
            }
        }
    }

    fn sweep(&mut self) -> usize {
        let dead: Vec<usize> = self
            .blocks
            .iter()
            .filter(|(_, b)| !b.marked)
            .map(|(&base, _)| base)
            .collect();
        for base in &dead {
            if let Some(block) = self.blocks.remove(base) {
                self.live_bytes = self.live_bytes.saturating_sub(block.size());
                // SAFETY: allocated in `SimCollector::allocate_block` with
                // this layout and removed from the map exactly once.
                unsafe { dealloc(*base as *mut u8, block.layout) };
            }
        }
        for block in self.blocks.values_mut() {
            block.marked = false;
        }
        self.bytes_since_gc = 0;
        dead.len()
    }
}

impl Drop for SimHeap {
    fn drop(&mut self) {
        for (base, block) in std::mem::take(&mut self.blocks) {
            // SAFETY: every block in the map is owned by the heap.
            unsafe { dealloc(base as *mut u8, block.layout) };
        }
    }
}

/// Where the host publishes root values while a `Start` event runs.
///
/// Holds no reference back to the collector, so a marker closure can keep
/// one without creating a cycle through the installed hook.
#[derive(Clone, Default)]
pub struct RootSink {
    roots: Arc<Mutex<Vec<usize>>>,
}

impl RootSink {
    /// Publish one word that may point into the heap.
    pub fn push(&self, value: usize) {
        self.roots.lock().push(value);
    }

    pub fn push_ptr<T>(&self, ptr: *const T) {
        self.push(ptr as usize);
    }

    pub fn extend(&self, values: impl IntoIterator<Item = usize>) {
        self.roots.lock().extend(values);
    }

    fn take(&self) -> Vec<usize> {
        std::mem::take(&mut *self.roots.lock())
    }
}

/// Per-primitive call counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimCallCounts {
    pub malloc: u64,
    pub malloc_ignore_off_page: u64,
    pub malloc_explicitly_typed: u64,
    pub calloc_explicitly_typed: u64,
    pub make_descriptor: u64,
    pub free: u64,
    pub gcollect: u64,
    pub set_on_collection_event: u64,
    pub set_warn_proc: u64,
    pub set_max_heap_size: u64,
    pub warnings: u64,
}

#[derive(Default)]
struct SimCounters {
    malloc: AtomicU64,
    malloc_ignore_off_page: AtomicU64,
    malloc_explicitly_typed: AtomicU64,
    calloc_explicitly_typed: AtomicU64,
    make_descriptor: AtomicU64,
    free: AtomicU64,
    gcollect: AtomicU64,
    set_on_collection_event: AtomicU64,
    set_warn_proc: AtomicU64,
    set_max_heap_size: AtomicU64,
    warnings: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct SimShared {
    heap: Mutex<SimHeap>,
    hook: RwLock<Option<CollectionHook>>,
    warn_proc: RwLock<Option<WarnProc>>,
    roots: RootSink,
    collecting: AtomicBool,
    // Held from marking through reclaim.
    cycle: Mutex<()>,
    gc_no: AtomicUsize,
    counters: SimCounters,
}

/// Cloneable handle to one simulated collector heap.
#[derive(Clone)]
pub struct SimCollector {
    shared: Arc<SimShared>,
}

impl SimCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SimShared {
                heap: Mutex::new(SimHeap::new()),
                hook: RwLock::new(None),
                warn_proc: RwLock::new(None),
                roots: RootSink::default(),
                collecting: AtomicBool::new(false),
                cycle: Mutex::new(()),
                gc_no: AtomicUsize::new(0),
                counters: SimCounters::default(),
            }),
        }
    }

    /// Sink for host roots. Values pushed outside a `Start` event are kept
    /// until the next cycle.
    #[must_use]
    pub fn root_sink(&self) -> RootSink {
        self.shared.roots.clone()
    }

    pub fn push_root(&self, value: usize) {
        self.shared.roots.push(value);
    }

    #[must_use]
    pub fn call_counts(&self) -> SimCallCounts {
        let c = &self.shared.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        SimCallCounts {
            malloc: get(&c.malloc),
            malloc_ignore_off_page: get(&c.malloc_ignore_off_page),
            malloc_explicitly_typed: get(&c.malloc_explicitly_typed),
            calloc_explicitly_typed: get(&c.calloc_explicitly_typed),
            make_descriptor: get(&c.make_descriptor),
            free: get(&c.free),
            gcollect: get(&c.gcollect),
            set_on_collection_event: get(&c.set_on_collection_event),
            set_warn_proc: get(&c.set_warn_proc),
            set_max_heap_size: get(&c.set_max_heap_size),
            warnings: get(&c.warnings),
        }
    }

    /// True if `ptr` is the base of a live block.
    #[must_use]
    pub fn is_live(&self, ptr: *const u8) -> bool {
        self.shared.heap.lock().blocks.contains_key(&(ptr as usize))
    }

    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.shared.heap.lock().blocks.len()
    }

    #[must_use]
    pub fn max_heap(&self) -> usize {
        self.shared.heap.lock().max_heap
    }

    #[must_use]
    pub fn has_warn_proc(&self) -> bool {
        self.shared.warn_proc.read().is_some()
    }

    fn fire(&self, event: CollectionEvent) {
        let hook = self.shared.hook.read().clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }

    /// One full cycle. A request made while a cycle is running is dropped.
    fn collect(&self) {
        if self.shared.collecting.swap(true, Ordering::AcqRel) {
            return;
        }

        self.fire(CollectionEvent::Start);
        self.fire(CollectionEvent::MarkStart);
        let cycle = self.shared.cycle.lock();
        let roots = self.shared.roots.take();
        self.shared.heap.lock().mark_from(&roots);
        self.fire(CollectionEvent::MarkEnd);

        self.fire(CollectionEvent::ReclaimStart);
        self.shared.heap.lock().sweep();
        self.shared.gc_no.fetch_add(1, Ordering::AcqRel);
        self.fire(CollectionEvent::ReclaimEnd);

        drop(cycle);
        self.shared.collecting.store(false, Ordering::Release);
        self.fire(CollectionEvent::End);
    }

    fn out_of_memory(&self, requested: usize) -> *mut u8 {
        bump(&self.shared.counters.warnings);
        let warn = *self.shared.warn_proc.read();
        if let Some(warn) = warn {
            warn(OOM_WARNING.as_ptr().cast_mut(), requested);
        }
        std::ptr::null_mut()
    }

    fn allocate_block(&self, size: usize, kind: BlockKind) -> *mut u8 {
        let Some(rounded) = size.max(1).checked_next_multiple_of(GRANULE) else {
            return self.out_of_memory(size);
        };
        let Ok(layout) = Layout::from_size_align(rounded, GRANULE) else {
            return self.out_of_memory(size);
        };

        let mut heap = self.shared.heap.lock();
        if !heap.reserve(rounded) {
            drop(heap);
            self.collect();
            heap = self.shared.heap.lock();
            if !heap.reserve(rounded) {
                drop(heap);
                return self.out_of_memory(rounded);
            }
        }

        // SAFETY: `layout` has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            heap.live_bytes = heap.live_bytes.saturating_sub(rounded);
            drop(heap);
            return self.out_of_memory(rounded);
        }
        heap.blocks.insert(
            ptr as usize,
            Block {
                layout,
                kind,
                marked: false,
            },
        );
        heap.total_bytes = heap.total_bytes.saturating_add(rounded);
        heap.bytes_since_gc = heap.bytes_since_gc.saturating_add(rounded);
        ptr
    }
}

impl Default for SimCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.shared.heap.lock();
        f.debug_struct("SimCollector")
            .field("blocks", &heap.blocks.len())
            .field("heap_size", &heap.heap_size)
            .field("live_bytes", &heap.live_bytes)
            .field("max_heap", &heap.max_heap)
            .field("gc_no", &self.shared.gc_no.load(Ordering::Relaxed))
            .finish()
    }
}

impl NativeCollector for SimCollector {
    fn malloc(&self, size: usize) -> *mut u8 {
        bump(&self.shared.counters.malloc);
        self.allocate_block(size, BlockKind::Conservative)
    }

    fn malloc_ignore_off_page(&self, size: usize) -> *mut u8 {
        bump(&self.shared.counters.malloc_ignore_off_page);
        self.allocate_block(size, BlockKind::OffPage)
    }

    fn malloc_explicitly_typed(&self, size: usize, descriptor: GcDescriptor) -> *mut u8 {
        bump(&self.shared.counters.malloc_explicitly_typed);
        let elem_words = size.div_ceil(WORD).max(1);
        self.allocate_block(
            size,
            BlockKind::Typed {
                descriptor: descriptor.0,
                elem_words,
            },
        )
    }

    fn calloc_explicitly_typed(
        &self,
        count: usize,
        elem_size: usize,
        descriptor: GcDescriptor,
    ) -> *mut u8 {
        bump(&self.shared.counters.calloc_explicitly_typed);
        let elem_words = elem_size.div_ceil(WORD).max(1);
        let Some(total) = elem_words
            .checked_mul(WORD)
            .and_then(|elem| elem.checked_mul(count))
        else {
            return self.out_of_memory(usize::MAX);
        };
        self.allocate_block(
            total,
            BlockKind::Typed {
                descriptor: descriptor.0,
                elem_words,
            },
        )
    }

    fn make_descriptor(&self, bitmap: &[usize], len_bits: usize) -> GcDescriptor {
        bump(&self.shared.counters.make_descriptor);
        GcDescriptor(encode_descriptor(bitmap, len_bits))
    }

    unsafe fn free(&self, ptr: *mut u8) {
        bump(&self.shared.counters.free);
        let mut heap = self.shared.heap.lock();
        if let Some(block) = heap.blocks.remove(&(ptr as usize)) {
            heap.live_bytes = heap.live_bytes.saturating_sub(block.size());
            // SAFETY: the block was allocated with this layout and has just
            // left the map.
            unsafe { dealloc(ptr, block.layout) };
        }
    }

    fn gcollect(&self) {
        bump(&self.shared.counters.gcollect);
        self.collect();
    }

    fn heap_usage(&self) -> HeapUsage {
        let heap = self.shared.heap.lock();
        HeapUsage {
            heap_size: heap.heap_size,
            free_bytes: heap.heap_size.saturating_sub(heap.live_bytes),
            unmapped_bytes: 0,
            bytes_since_gc: heap.bytes_since_gc,
            total_bytes: heap.total_bytes,
        }
    }

    fn obtained_from_os_bytes(&self) -> usize {
        self.shared.heap.lock().heap_size
    }

    fn gc_no(&self) -> usize {
        self.shared.gc_no.load(Ordering::Acquire)
    }

    fn base_of(&self, ptr: *const u8) -> *mut u8 {
        let heap = self.shared.heap.lock();
        heap.block_containing(ptr as usize, false)
            .map_or(std::ptr::null_mut(), |base| base as *mut u8)
    }

    fn with_collection_lock(&self, f: &mut dyn FnMut()) {
        let _cycle = self.shared.cycle.lock();
        f();
    }

    fn survived_last_collection(&self, base: *const u8) -> bool {
        self.is_live(base)
    }

    fn set_on_collection_event(&self, hook: CollectionHook) {
        bump(&self.shared.counters.set_on_collection_event);
        *self.shared.hook.write() = Some(hook);
    }

    fn set_warn_proc(&self, warn: WarnProc) {
        bump(&self.shared.counters.set_warn_proc);
        *self.shared.warn_proc.write() = Some(warn);
    }

    fn set_max_heap_size(&self, bytes: usize) {
        bump(&self.shared.counters.set_max_heap_size);
        self.shared.heap.lock().max_heap = bytes;
    }

    fn peak_resident_set_bytes(&self) -> usize {
        os::peak_rss_bytes()
    }
}
