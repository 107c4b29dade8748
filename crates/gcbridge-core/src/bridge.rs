//! The bridge facade: everything a host memory hook calls.
//!
//! [`GcBridge`] owns the heap manager, collection controller, ownership
//! ledger and a handle to the descriptor cache, and forwards to a
//! [`NativeCollector`]. Allocations are routed by size (and layout, when
//! precise allocation is on) to exactly one native primitive.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::classify::{AllocPath, select_path};
use crate::collector::{CollectionEvent, CollectionHook, NativeCollector};
use crate::config::{CheckLevel, HeapConfig};
use crate::controller::{CollectionController, CollectionState, CycleTicket, RootMarker};
use crate::descriptor::{CacheOutcome, DescriptorCache, DescriptorHandle, PointerBitmap};
use crate::error::{BridgeError, MisuseViolation};
use crate::fatal;
use crate::heap::HeapManager;
use crate::ledger::{OwnershipLedger, ReleaseVerdict};
use crate::lifecycle::{LifecycleLog, LogLevel};
use crate::metrics::BridgeMetrics;
use crate::stats::{HostMemStats, MemoryStatsSnapshot};

const WORD: usize = std::mem::size_of::<usize>();

pub struct GcBridge<C: NativeCollector + 'static> {
    collector: Arc<C>,
    heap: HeapManager,
    controller: Arc<CollectionController>,
    ledger: OwnershipLedger,
    descriptors: Arc<DescriptorCache>,
    metrics: Arc<BridgeMetrics>,
    log: Arc<LifecycleLog>,
}

impl<C: NativeCollector + 'static> GcBridge<C> {
    /// Bridge over `collector` using the process-wide descriptor cache.
    pub fn new(collector: C, marker: impl RootMarker + 'static) -> Self {
        Self::with_descriptor_cache(collector, marker, Arc::clone(DescriptorCache::global()))
    }

    /// Bridge with a caller-provided descriptor cache.
    pub fn with_descriptor_cache(
        collector: C,
        marker: impl RootMarker + 'static,
        descriptors: Arc<DescriptorCache>,
    ) -> Self {
        let metrics = Arc::new(BridgeMetrics::new());
        let log = Arc::new(LifecycleLog::new());
        let controller = Arc::new(CollectionController::new(
            Box::new(marker),
            Arc::clone(&metrics),
            Arc::clone(&log),
        ));
        Self {
            collector: Arc::new(collector),
            heap: HeapManager::new(),
            controller,
            ledger: OwnershipLedger::new(),
            descriptors,
            metrics,
            log,
        }
    }

    /// Configure the native collector. Must precede every other operation
    /// except [`read_stats`](Self::read_stats).
    pub fn initialize(&self, config: HeapConfig) -> Result<(), BridgeError> {
        let controller = Arc::clone(&self.controller);
        let hook: CollectionHook = Arc::new(move |event: CollectionEvent| {
            controller.on_collection_event(event);
        });
        self.heap
            .initialize(&*self.collector, config, hook, &self.log)
            .map_err(|err| self.note_error("initialize", err))
    }

    fn ready(&self, op: &'static str) -> Result<HeapConfig, BridgeError> {
        self.heap
            .require_ready(op)
            .copied()
            .map_err(|err| self.note_error(op, err))
    }

    fn note_error(&self, symbol: &'static str, err: BridgeError) -> BridgeError {
        if let BridgeError::Misuse(violation) = err {
            BridgeMetrics::inc(&self.metrics.misuse);
            self.log
                .emit(LogLevel::Warn, symbol, "rejected", misuse_outcome(violation), |r| {
                    r.with_details(violation.to_string())
                });
        }
        err
    }

    /// Allocate `size` bytes of zeroed, collector-managed memory.
    ///
    /// `layout` is only consulted when precise allocation is enabled; typed
    /// requests always cover at least the words the layout describes.
    pub fn allocate(
        &self,
        size: usize,
        layout: Option<&PointerBitmap>,
    ) -> Result<NonNull<u8>, BridgeError> {
        let config = self.ready("allocate")?;
        self.prune_if_collected();

        let mut size = size.max(1);
        let typed = match layout {
            Some(bitmap) if config.precise_allocation => Some(self.resolve_descriptor(bitmap)),
            _ => None,
        };
        if let Some(handle) = &typed {
            size = size.max(handle.len_words.saturating_mul(WORD));
        }

        let path = select_path(size, config.big_object_threshold_bytes, typed.is_some());
        let raw = match (&typed, path) {
            (Some(handle), _) => self
                .collector
                .malloc_explicitly_typed(size, handle.descriptor),
            (None, AllocPath::Large) => self.collector.malloc_ignore_off_page(size),
            (None, _) => self.collector.malloc(size),
        };
        self.finish_allocation(raw, size, path, config.check_level)
    }

    /// Allocate a zeroed array of `count` elements.
    ///
    /// With precise allocation on and a layout for one element, the typed
    /// array primitive is used. Otherwise this is an untyped allocation of
    /// `count * elem_size` bytes.
    pub fn allocate_array(
        &self,
        count: usize,
        elem_size: usize,
        layout: Option<&PointerBitmap>,
    ) -> Result<NonNull<u8>, BridgeError> {
        let config = self.ready("allocate_array")?;

        let Some(bitmap) = layout.filter(|_| config.precise_allocation) else {
            let total = count.checked_mul(elem_size).ok_or_else(|| {
                self.out_of_memory(usize::MAX, AllocPath::Large)
            })?;
            return self.allocate(total, None);
        };

        self.prune_if_collected();
        let handle = self.resolve_descriptor(bitmap);
        let elem_size = elem_size.max(handle.len_words.saturating_mul(WORD)).max(1);
        let count = count.max(1);
        let Some(total) = count.checked_mul(elem_size) else {
            return Err(self.out_of_memory(usize::MAX, AllocPath::TypedArray));
        };

        let raw = self
            .collector
            .calloc_explicitly_typed(count, elem_size, handle.descriptor);
        self.finish_allocation(raw, total, AllocPath::TypedArray, config.check_level)
    }

    fn finish_allocation(
        &self,
        raw: *mut u8,
        size: usize,
        path: AllocPath,
        check_level: CheckLevel,
    ) -> Result<NonNull<u8>, BridgeError> {
        let Some(ptr) = NonNull::new(raw) else {
            return Err(self.out_of_memory(size, path));
        };
        let addr = ptr.as_ptr() as usize;
        if check_level.tracks_ownership() {
            let epoch = self.collector.gc_no();
            self.ledger.record_allocation(addr, size, path, epoch);
        }
        self.metrics.record_alloc(path);
        self.log.emit(LogLevel::Trace, "allocate", "served", "ok", |r| {
            r.with_ptr(addr).with_size(size).with_path(path)
        });
        Ok(ptr)
    }

    fn out_of_memory(&self, requested: usize, path: AllocPath) -> BridgeError {
        BridgeMetrics::inc(&self.metrics.out_of_memory);
        self.log
            .emit(LogLevel::Error, "allocate", "failed", "out_of_memory", |r| {
                r.with_size(requested).with_path(path)
            });
        BridgeError::OutOfMemory { requested, path }
    }

    /// [`allocate`](Self::allocate), aborting the process on any error.
    pub fn allocate_or_abort(&self, size: usize, layout: Option<&PointerBitmap>) -> NonNull<u8> {
        match self.allocate(size, layout) {
            Ok(ptr) => ptr,
            Err(err) => fatal::abort_on(&self.log, "allocate", &err),
        }
    }

    /// Return a block to the collector immediately.
    ///
    /// With [`CheckLevel::Strict`], pointers the bridge does not currently own
    /// are rejected and never reach the native free.
    ///
    /// # Safety
    ///
    /// With [`CheckLevel::Off`], `ptr` must be the base of a live block
    /// returned by this bridge and must not be used afterwards. With `Strict`
    /// only the second requirement applies.
    pub unsafe fn release(&self, ptr: NonNull<u8>) -> Result<(), BridgeError> {
        let config = self.ready("release")?;
        self.prune_if_collected();

        let addr = ptr.as_ptr() as usize;
        if config.check_level.tracks_ownership() {
            match self.ledger.check_release(addr) {
                ReleaseVerdict::Owned(_) => {}
                ReleaseVerdict::DoubleRelease => {
                    let err = MisuseViolation::DoubleRelease { addr }.into();
                    return Err(self.note_error("release", err));
                }
                ReleaseVerdict::Unowned => {
                    let err = MisuseViolation::UnownedRelease { addr }.into();
                    return Err(self.note_error("release", err));
                }
            }
        }

        // SAFETY: under Strict the ledger just confirmed `addr` is a live
        // block from this collector; under Off the caller guarantees it.
        unsafe { self.collector.free(ptr.as_ptr()) };
        BridgeMetrics::inc(&self.metrics.releases);
        self.log
            .emit(LogLevel::Debug, "release", "freed", "ok", |r| r.with_ptr(addr));
        Ok(())
    }

    /// [`release`](Self::release), aborting the process on misuse.
    ///
    /// # Safety
    ///
    /// Same contract as [`release`](Self::release).
    pub unsafe fn release_or_abort(&self, ptr: NonNull<u8>) {
        // SAFETY: forwarded caller contract.
        if let Err(err) = unsafe { self.release(ptr) } {
            fatal::abort_on(&self.log, "release", &err);
        }
    }

    /// Run one full collection and block until it completes. The host
    /// marker runs once, from the collector's `Start` event.
    pub fn force_collect(&self) -> Result<(), BridgeError> {
        self.ready("force_collect")?;
        self.controller
            .prepare_forced_cycle()
            .map_err(|err| self.note_error("force_collect", err))?;

        BridgeMetrics::inc(&self.metrics.collections_forced);
        self.collector.gcollect();
        self.controller.finish_cycle();
        self.prune_if_collected();

        let gc_no = self.collector.gc_no();
        self.log
            .emit(LogLevel::Debug, "force_collect", "completed", "ok", |r| {
                r.with_details(format!("gc_no={gc_no}"))
            });
        Ok(())
    }

    /// Open a host marking window. The host marks its roots, then calls
    /// [`confirm_roots_marked`](Self::confirm_roots_marked).
    pub fn begin_collection(&self) -> Result<CycleTicket, BridgeError> {
        self.ready("begin_collection")?;
        self.controller
            .begin()
            .map_err(|err| self.note_error("begin_collection", err))
    }

    /// Close the window opened by `ticket` and run the native cycle without
    /// calling the host marker again.
    pub fn confirm_roots_marked(&self, ticket: CycleTicket) -> Result<(), BridgeError> {
        self.ready("confirm_roots_marked")?;
        self.controller
            .confirm(ticket)
            .map_err(|err| self.note_error("confirm_roots_marked", err))?;

        BridgeMetrics::inc(&self.metrics.collections_forced);
        self.collector.gcollect();
        self.controller.finish_cycle();
        self.prune_if_collected();
        Ok(())
    }

    /// Close an unconfirmed window without collecting.
    pub fn abandon_collection(&self, ticket: CycleTicket) -> Result<(), BridgeError> {
        self.ready("abandon_collection")?;
        self.controller
            .abandon(ticket)
            .map_err(|err| self.note_error("abandon_collection", err))
    }

    /// Heap-resident root ranges need no registration: the collector already
    /// scans its own heap. Accepted and ignored.
    pub fn mark_roots(&self, _start: *const u8, _end: *const u8) {}

    /// Collector and OS counters. Valid before initialization.
    #[must_use]
    pub fn read_stats(&self) -> MemoryStatsSnapshot {
        MemoryStatsSnapshot::compose(
            self.collector.heap_usage(),
            self.collector.obtained_from_os_bytes(),
            self.collector.peak_resident_set_bytes(),
            self.collector.gc_no(),
        )
    }

    #[must_use]
    pub fn host_stats(&self) -> HostMemStats {
        self.read_stats().host_view()
    }

    /// Cached descriptor for `bitmap`, built by the collector on first use.
    pub fn resolve_descriptor(&self, bitmap: &PointerBitmap) -> DescriptorHandle {
        let (handle, outcome) = self.descriptors.resolve(bitmap, |b| {
            self.collector.make_descriptor(b.words(), b.len_words())
        });
        match outcome {
            CacheOutcome::Hit => BridgeMetrics::inc(&self.metrics.descriptor_cache_hits),
            CacheOutcome::Miss => {
                BridgeMetrics::inc(&self.metrics.descriptor_cache_misses);
                self.log.emit(LogLevel::Debug, "descriptor", "built", "ok", |r| {
                    r.with_size(bitmap.len_words())
                        .with_details(format!("pointer_words={}", bitmap.pointer_count()))
                });
            }
        }
        handle
    }

    fn prune_if_collected(&self) {
        if !self.controller.take_prune_pending() {
            return;
        }
        let collector = &self.collector;
        let ledger = &self.ledger;
        let mut removed = 0;
        collector.with_collection_lock(&mut || {
            let completed = collector.gc_no();
            removed = ledger.prune(completed, |addr| {
                collector.survived_last_collection(addr as *const u8)
            });
        });
        if removed > 0 {
            self.log.emit(LogLevel::Debug, "ledger", "pruned", "ok", |r| {
                r.with_details(format!("reclaimed={removed}"))
            });
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heap.is_ready()
    }

    #[must_use]
    pub fn config(&self) -> Option<&HeapConfig> {
        self.heap.config()
    }

    #[must_use]
    pub fn collection_state(&self) -> CollectionState {
        self.controller.state()
    }

    #[must_use]
    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn lifecycle_log(&self) -> &LifecycleLog {
        &self.log
    }

    #[must_use]
    pub fn descriptor_cache(&self) -> &Arc<DescriptorCache> {
        &self.descriptors
    }

    #[must_use]
    pub fn collector(&self) -> &C {
        &self.collector
    }

    /// Number of blocks the ownership ledger currently tracks.
    #[must_use]
    pub fn tracked_blocks(&self) -> usize {
        self.ledger.live_count()
    }
}

const fn misuse_outcome(violation: MisuseViolation) -> &'static str {
    match violation {
        MisuseViolation::NotInitialized { .. } => "not_initialized",
        MisuseViolation::AlreadyInitialized => "already_initialized",
        MisuseViolation::DoubleRelease { .. } => "double_release",
        MisuseViolation::UnownedRelease { .. } => "unowned_release",
        MisuseViolation::CollectionInProgress { .. } => "collection_in_progress",
        MisuseViolation::TicketMismatch { .. } => "ticket_mismatch",
    }
}
