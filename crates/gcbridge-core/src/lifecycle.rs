//! Structured lifecycle records.
//!
//! The bridge runs inside hosts that usually have no console, so it never
//! prints. Each decision (initialization, allocation outcome, release
//! verdict, collection phase) becomes a [`LifecycleRecord`] in a bounded
//! in-memory ring that the host drains or renders as JSONL.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::classify::AllocPath;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    const fn as_u8(self) -> u8 {
        self as u8
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            4 => Self::Error,
            _ => Self::Fatal,
        }
    }
}

/// One lifecycle decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    pub decision_id: u64,
    pub trace_id: String,
    pub level: LogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<AllocPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LifecycleRecord {
    #[must_use]
    pub fn new(
        decision_id: u64,
        level: LogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            decision_id,
            trace_id: format!("gcbridge::{symbol}::{decision_id:016x}"),
            level,
            symbol,
            event,
            outcome,
            ptr: None,
            size: None,
            path: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: AllocPath) -> Self {
        self.path = Some(path);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Bounded ring of lifecycle records. Oldest records are dropped first.
pub struct LifecycleLog {
    records: Mutex<VecDeque<LifecycleRecord>>,
    capacity: usize,
    min_level: AtomicU8,
    next_id: AtomicU64,
}

impl LifecycleLog {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
            min_level: AtomicU8::new(LogLevel::Debug.as_u8()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level.as_u8(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn min_level(&self) -> LogLevel {
        LogLevel::from_u8(self.min_level.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level()
    }

    /// Record a decision if `level` passes the filter. `fill` attaches the
    /// optional fields and only runs for records that are kept.
    ///
    /// Returns the decision id, or `None` when filtered out.
    pub fn emit(
        &self,
        level: LogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
        fill: impl FnOnce(LifecycleRecord) -> LifecycleRecord,
    ) -> Option<u64> {
        if !self.enabled(level) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = fill(LifecycleRecord::new(id, level, symbol, event, outcome));

        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Some(id)
    }

    /// Remove and return all buffered records, oldest first.
    pub fn drain(&self) -> Vec<LifecycleRecord> {
        self.records.lock().drain(..).collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<LifecycleRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Buffered records as one JSON object per line.
    #[must_use]
    pub fn to_jsonl(&self) -> String {
        let records = self.records.lock();
        let mut out = String::new();
        for record in records.iter() {
            if let Ok(line) = serde_json::to_string(record) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LifecycleLog {
    fn default() -> Self {
        Self::new()
    }
}
