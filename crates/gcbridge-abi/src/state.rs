//! Process-wide bridge instance behind the C entry points.
//!
//! The bridge object is created on first touch and leaked; `gcbridge_init`
//! only configures it. Creation uses a manual atomic state machine rather
//! than `OnceLock` so a reentrant call during construction (an allocation
//! routed back into the bridge) sees `None` instead of blocking on itself.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use gcbridge_core::GcBridge;
use parking_lot::RwLock;

#[cfg(feature = "bdwgc")]
pub type Backend = gcbridge_native::BdwgcCollector;
#[cfg(not(feature = "bdwgc"))]
pub type Backend = gcbridge_native::SimCollector;

/// Host stack scanner registered through `gcbridge_set_mark_stack`.
pub type MarkStackFn = extern "C" fn();

const STATE_UNINIT: u8 = 0;
const STATE_CREATING: u8 = 1;
const STATE_READY: u8 = 2;

static BRIDGE_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static BRIDGE_PTR: AtomicPtr<GcBridge<Backend>> = AtomicPtr::new(std::ptr::null_mut());
static MARK_STACK: RwLock<Option<MarkStackFn>> = RwLock::new(None);

pub(crate) fn set_mark_stack(f: Option<MarkStackFn>) {
    *MARK_STACK.write() = f;
}

/// Hand host roots to the simulated heap. libgc scans stacks on its own.
#[cfg(not(feature = "bdwgc"))]
pub(crate) fn publish_roots(values: impl IntoIterator<Item = usize>) {
    if let Some(bridge) = bridge() {
        bridge.collector().root_sink().extend(values);
    }
}

#[cfg(feature = "bdwgc")]
pub(crate) fn publish_roots(_values: impl IntoIterator<Item = usize>) {}

fn host_mark_stack() {
    let f = *MARK_STACK.read();
    if let Some(f) = f {
        f();
    }
}

fn load_ready() -> Option<&'static GcBridge<Backend>> {
    let ptr = BRIDGE_PTR.load(Ordering::Acquire);
    // SAFETY: once READY, BRIDGE_PTR holds a leaked Box that is never freed
    // or replaced.
    (!ptr.is_null()).then(|| unsafe { &*ptr })
}

/// The process bridge, created on first use. `None` only for a reentrant
/// call made while the bridge itself is being constructed.
pub(crate) fn bridge() -> Option<&'static GcBridge<Backend>> {
    match BRIDGE_STATE.load(Ordering::Acquire) {
        STATE_READY => return load_ready(),
        STATE_CREATING => return None,
        _ => {}
    }

    if BRIDGE_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_CREATING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return if BRIDGE_STATE.load(Ordering::Acquire) == STATE_READY {
            load_ready()
        } else {
            None
        };
    }

    let bridge = Box::new(GcBridge::new(Backend::new(), host_mark_stack));
    let ptr = Box::into_raw(bridge);
    BRIDGE_PTR.store(ptr, Ordering::Release);
    BRIDGE_STATE.store(STATE_READY, Ordering::Release);
    load_ready()
}

/// Run `f` against the process bridge from Rust.
pub fn with_bridge<R>(f: impl FnOnce(&GcBridge<Backend>) -> R) -> Option<R> {
    bridge().map(f)
}
