//! Ownership ledger for explicit releases.
//!
//! Tracks every block the bridge handed out so a release can be classified
//! before it reaches the native free, which has undefined behavior on a
//! pointer it does not own. Recently released addresses are remembered in a
//! bounded window so a second release of the same pointer is reported as a
//! double release rather than an unknown pointer.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::classify::AllocPath;

/// How many released addresses are remembered for double-release detection.
pub const RELEASED_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub size: usize,
    pub path: AllocPath,
    /// Completed collections when the block was handed out.
    pub epoch: usize,
}

/// Classification of a release request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseVerdict {
    /// Live block owned by the bridge; it has been removed from the ledger.
    Owned(LedgerEntry),
    DoubleRelease,
    Unowned,
}

#[derive(Default)]
struct LedgerInner {
    live: HashMap<usize, LedgerEntry>,
    live_bytes: usize,
    released: HashSet<usize>,
    released_order: VecDeque<usize>,
}

impl LedgerInner {
    fn remember_released(&mut self, addr: usize) {
        if !self.released.insert(addr) {
            return;
        }
        self.released_order.push_back(addr);
        while self.released_order.len() > RELEASED_WINDOW {
            if let Some(old) = self.released_order.pop_front() {
                self.released.remove(&old);
            }
        }
    }

    fn forget_released(&mut self, addr: usize) {
        if self.released.remove(&addr) {
            self.released_order.retain(|a| *a != addr);
        }
    }
}

pub struct OwnershipLedger {
    inner: Mutex<LedgerInner>,
}

impl OwnershipLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Enter a freshly allocated block. `epoch` is the collector's completed
    /// collection count read after the allocation returned. An address reused
    /// by the collector stops counting as released.
    pub fn record_allocation(&self, addr: usize, size: usize, path: AllocPath, epoch: usize) {
        let mut inner = self.inner.lock();
        inner.forget_released(addr);
        let entry = LedgerEntry { size, path, epoch };
        if let Some(prev) = inner.live.insert(addr, entry) {
            inner.live_bytes = inner.live_bytes.saturating_sub(prev.size);
        }
        inner.live_bytes = inner.live_bytes.saturating_add(size);
    }

    /// Classify a release of `addr`. An owned block leaves the ledger and
    /// enters the released window.
    pub fn check_release(&self, addr: usize) -> ReleaseVerdict {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.live.remove(&addr) {
            inner.live_bytes = inner.live_bytes.saturating_sub(entry.size);
            inner.remember_released(addr);
            return ReleaseVerdict::Owned(entry);
        }
        if inner.released.contains(&addr) {
            ReleaseVerdict::DoubleRelease
        } else {
            ReleaseVerdict::Unowned
        }
    }

    /// Drop entries for blocks the collector has reclaimed. Only entries
    /// recorded before collection `completed` finished are tested with
    /// `survived`; newer ones are kept. Returns how many entries were removed.
    pub fn prune(&self, completed: usize, mut survived: impl FnMut(usize) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.live.len();
        let mut reclaimed_bytes = 0usize;
        inner.live.retain(|addr, entry| {
            let keep = entry.epoch >= completed || survived(*addr);
            if !keep {
                reclaimed_bytes = reclaimed_bytes.saturating_add(entry.size);
            }
            keep
        });
        inner.live_bytes = inner.live_bytes.saturating_sub(reclaimed_bytes);
        before - inner.live.len()
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.inner.lock().live.contains_key(&addr)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.inner.lock().live_bytes
    }
}

impl Default for OwnershipLedger {
    fn default() -> Self {
        Self::new()
    }
}
