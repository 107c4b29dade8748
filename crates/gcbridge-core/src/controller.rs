//! Root-marking protocol between the host and the native collector.
//!
//! A conservative collector cannot see roots that live on a stack it does not
//! know how to walk, so the host scans its own stack when a cycle starts and
//! publishes what it finds. Two ways in:
//!
//! - **Hook-driven**: the native `Start` event calls the host
//!   [`RootMarker`] before the collector proceeds, once per cycle. This covers
//!   both host-forced cycles and cycles the collector starts on its own under
//!   allocation pressure.
//! - **Two-phase**: the host calls `begin` to open a marking window, marks on
//!   its own schedule, then `confirm`s. The cycle that follows skips the
//!   `Start` mark because the host already did it.
//!
//! ```text
//! Idle --begin/Start--> CollectingRoots --confirm/marked--> CollectingHeap --End--> Idle
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use serde::Serialize;

use crate::collector::CollectionEvent;
use crate::error::{BridgeError, MisuseViolation};
use crate::lifecycle::{LifecycleLog, LogLevel};
use crate::metrics::BridgeMetrics;

/// The host's stack scanner.
pub trait RootMarker: Send + Sync {
    /// Scan the host stack and publish every root to the collector.
    fn mark_stack(&self);
}

impl<F> RootMarker for F
where
    F: Fn() + Send + Sync,
{
    fn mark_stack(&self) {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    Idle,
    CollectingRoots,
    CollectingHeap,
}

impl CollectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CollectingRoots => "collecting_roots",
            Self::CollectingHeap => "collecting_heap",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_ROOTS => Self::CollectingRoots,
            STATE_HEAP => Self::CollectingHeap,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const STATE_IDLE: u8 = 0;
const STATE_ROOTS: u8 = 1;
const STATE_HEAP: u8 = 2;

const NO_WINDOW: u64 = 0;

/// Token for one host marking window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CycleTicket {
    id: u64,
}

impl CycleTicket {
    /// Rebuild a ticket from the id handed across the C boundary.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self { id }
    }

    #[must_use]
    pub const fn id(self) -> u64 {
        self.id
    }
}

pub struct CollectionController {
    state: AtomicU8,
    window: AtomicU64,
    next_ticket: AtomicU64,
    /// Host marked during the open window; the next `Start` must not re-mark.
    premarked: AtomicBool,
    /// A marker call is on the stack.
    marking: AtomicBool,
    /// An `End` was seen since the ledger was last pruned.
    prune_pending: AtomicBool,
    marker: Box<dyn RootMarker>,
    metrics: Arc<BridgeMetrics>,
    log: Arc<LifecycleLog>,
}

impl CollectionController {
    pub fn new(
        marker: Box<dyn RootMarker>,
        metrics: Arc<BridgeMetrics>,
        log: Arc<LifecycleLog>,
    ) -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
            window: AtomicU64::new(NO_WINDOW),
            next_ticket: AtomicU64::new(1),
            premarked: AtomicBool::new(false),
            marking: AtomicBool::new(false),
            prune_pending: AtomicBool::new(false),
            marker,
            metrics,
            log,
        }
    }

    #[must_use]
    pub fn state(&self) -> CollectionState {
        CollectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while a host marking window is open.
    #[must_use]
    pub fn window_open(&self) -> bool {
        self.window.load(Ordering::Acquire) != NO_WINDOW
    }

    /// Native event hook. Installed on the collector during initialization.
    pub fn on_collection_event(&self, event: CollectionEvent) {
        match event {
            CollectionEvent::Start => self.on_start(),
            CollectionEvent::End => self.on_end(),
            _ => {}
        }
    }

    fn on_start(&self) {
        BridgeMetrics::inc(&self.metrics.collections_observed);

        if self.premarked.swap(false, Ordering::AcqRel) {
            self.state.store(STATE_HEAP, Ordering::Release);
            self.log
                .emit(LogLevel::Debug, "collect", "start", "host_premarked", |r| r);
            return;
        }

        if self.window_open() {
            // Collector-initiated cycle inside an open window; stay in roots.
            self.run_marker("window_pressure");
            return;
        }

        self.state.store(STATE_ROOTS, Ordering::Release);
        self.run_marker("marked");
        self.state.store(STATE_HEAP, Ordering::Release);
    }

    fn run_marker(&self, outcome: &'static str) {
        if self.marking.swap(true, Ordering::AcqRel) {
            self.log
                .emit(LogLevel::Warn, "collect", "start", "nested_mark_skipped", |r| r);
            return;
        }
        self.marker.mark_stack();
        self.marking.store(false, Ordering::Release);
        BridgeMetrics::inc(&self.metrics.stack_marks);
        self.log.emit(LogLevel::Debug, "collect", "start", outcome, |r| r);
    }

    fn on_end(&self) {
        self.prune_pending.store(true, Ordering::Release);
        let next = if self.window_open() {
            STATE_ROOTS
        } else {
            STATE_IDLE
        };
        self.state.store(next, Ordering::Release);
        self.log.emit(LogLevel::Debug, "collect", "end", "ok", |r| r);
    }

    /// Open a host marking window.
    pub fn begin(&self) -> Result<CycleTicket, BridgeError> {
        if let Err(current) = self.state.compare_exchange(
            STATE_IDLE,
            STATE_ROOTS,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(MisuseViolation::CollectionInProgress {
                state: CollectionState::from_u8(current),
            }
            .into());
        }
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.window.store(id, Ordering::Release);
        self.log
            .emit(LogLevel::Debug, "begin_collection", "window_opened", "ok", |r| {
                r.with_details(format!("ticket={id}"))
            });
        Ok(CycleTicket { id })
    }

    fn close_window(&self, ticket: CycleTicket) -> Result<(), BridgeError> {
        let expected = self.window.load(Ordering::Acquire);
        if expected == NO_WINDOW || expected != ticket.id {
            return Err(MisuseViolation::TicketMismatch {
                expected,
                got: ticket.id,
            }
            .into());
        }
        self.window
            .compare_exchange(expected, NO_WINDOW, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| {
                BridgeError::from(MisuseViolation::TicketMismatch {
                    expected: current,
                    got: ticket.id,
                })
            })
    }

    /// Close the window after the host marked its roots. The caller runs the
    /// native cycle next.
    pub fn confirm(&self, ticket: CycleTicket) -> Result<(), BridgeError> {
        self.close_window(ticket)?;
        self.premarked.store(true, Ordering::Release);
        self.state.store(STATE_HEAP, Ordering::Release);
        Ok(())
    }

    /// Close an unconfirmed window without collecting.
    pub fn abandon(&self, ticket: CycleTicket) -> Result<(), BridgeError> {
        self.close_window(ticket)?;
        self.state.store(STATE_IDLE, Ordering::Release);
        self.log
            .emit(LogLevel::Debug, "abandon_collection", "window_closed", "ok", |r| r);
        Ok(())
    }

    /// Check that a host-forced cycle may start.
    pub fn prepare_forced_cycle(&self) -> Result<(), BridgeError> {
        match self.state() {
            CollectionState::Idle => Ok(()),
            state => Err(MisuseViolation::CollectionInProgress { state }.into()),
        }
    }

    /// Settle state after the native cycle returned.
    pub fn finish_cycle(&self) {
        self.premarked.store(false, Ordering::Release);
        if !self.window_open() {
            self.state.store(STATE_IDLE, Ordering::Release);
        }
    }

    /// Consume the pending-prune flag set by an `End` event.
    pub fn take_prune_pending(&self) -> bool {
        self.prune_pending.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for CollectionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionController")
            .field("state", &self.state())
            .field("window", &self.window.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
