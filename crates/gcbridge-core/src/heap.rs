//! One-time native heap setup.
//!
//! The collector must be configured before the first allocation: the event
//! hook has to be in place so no cycle runs without the host marking its
//! roots, typed allocation needs one descriptor built up front, and the heap
//! ceiling cannot be lowered under live data later.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::collector::{CollectionHook, NativeCollector, ignore_warnings};
use crate::config::HeapConfig;
use crate::error::{BridgeError, MisuseViolation};
use crate::lifecycle::{LifecycleLog, LogLevel};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

pub struct HeapManager {
    state: AtomicU8,
    config: OnceLock<HeapConfig>,
}

impl HeapManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            config: OnceLock::new(),
        }
    }

    /// Configure `collector` once. A second call, including one racing the
    /// first, fails with `AlreadyInitialized`.
    pub fn initialize<C: NativeCollector + ?Sized>(
        &self,
        collector: &C,
        config: HeapConfig,
        hook: CollectionHook,
        log: &LifecycleLog,
    ) -> Result<(), BridgeError> {
        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MisuseViolation::AlreadyInitialized.into());
        }

        if let Err(err) = config.validate() {
            self.state.store(UNINIT, Ordering::Release);
            return Err(err);
        }

        collector.set_on_collection_event(hook);
        // Builds the collector's typed-allocation tables.
        let _ = collector.make_descriptor(&[], 0);
        collector.set_warn_proc(ignore_warnings);
        collector.set_max_heap_size(config.max_heap_bytes);

        let _ = self.config.set(config);
        self.state.store(READY, Ordering::Release);

        log.emit(LogLevel::Info, "heap", "initialized", "ok", |r| {
            r.with_size(config.max_heap_bytes).with_details(format!(
                "threshold={} precise={} checks={}",
                config.big_object_threshold_bytes,
                config.precise_allocation,
                config.check_level.as_str()
            ))
        });
        Ok(())
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Frozen configuration, or `NotInitialized` naming `op`.
    pub fn require_ready(&self, op: &'static str) -> Result<&HeapConfig, BridgeError> {
        if !self.is_ready() {
            return Err(MisuseViolation::NotInitialized { op }.into());
        }
        self.config
            .get()
            .ok_or(BridgeError::Misuse(MisuseViolation::NotInitialized { op }))
    }

    #[must_use]
    pub fn config(&self) -> Option<&HeapConfig> {
        if self.is_ready() {
            self.config.get()
        } else {
            None
        }
    }
}

impl Default for HeapManager {
    fn default() -> Self {
        Self::new()
    }
}
