//! Heap configuration and runtime check level.
//!
//! [`HeapConfig`] is handed to `initialize` once and frozen afterwards.
//!
//! The ownership check level is process-wide and read from the
//! `GCBRIDGE_CHECKS` environment variable:
//! - `strict` (default): every allocation is entered in the ownership ledger
//!   and misuse (double release, unowned release) is reported as an error
//!   before it reaches the native collector.
//! - `off`: pure passthrough, matching a bare collector binding. Releasing a
//!   pointer the collector does not own is undefined behavior again.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::BridgeError;

/// bdwgc recommends `GC_malloc_ignore_off_page` above roughly 100 KiB.
pub const DEFAULT_BIG_OBJECT_THRESHOLD: usize = 100 * 1024;

/// Ceiling used by sandboxed hosts whose linear memory is capped at 1 GiB.
pub const DEFAULT_MAX_HEAP: usize = 1024 * 1024 * 1024;

/// How much bookkeeping the bridge does on top of the native collector.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckLevel {
    /// Track ownership and turn misuse into explicit errors.
    #[default]
    Strict,
    /// No tracking. Benchmark baseline and reference behavior.
    Off,
}

impl CheckLevel {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" | "passthrough" => Self::Off,
            _ => Self::Strict,
        }
    }

    /// Returns true if releases are checked against the ownership ledger.
    #[must_use]
    pub const fn tracks_ownership(self) -> bool {
        matches!(self, Self::Strict)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Off => "off",
        }
    }
}

// 0=unresolved, 1=Strict, 2=Off, 255=resolving.
static CACHED_LEVEL: AtomicU8 = AtomicU8::new(0);

const LEVEL_UNRESOLVED: u8 = 0;
const LEVEL_STRICT: u8 = 1;
const LEVEL_OFF: u8 = 2;
const LEVEL_RESOLVING: u8 = 255;

fn level_to_u8(level: CheckLevel) -> u8 {
    match level {
        CheckLevel::Strict => LEVEL_STRICT,
        CheckLevel::Off => LEVEL_OFF,
    }
}

fn u8_to_level(v: u8) -> CheckLevel {
    match v {
        LEVEL_OFF => CheckLevel::Off,
        _ => CheckLevel::Strict,
    }
}

/// Process-wide check level (reads the env var on first call, caches thereafter).
///
/// The env lookup may allocate, and allocation may be routed back into the
/// bridge. A reentrant call that observes the resolving state gets `Strict`.
#[must_use]
pub fn process_check_level() -> CheckLevel {
    let cached = CACHED_LEVEL.load(Ordering::Relaxed);

    if cached != LEVEL_UNRESOLVED && cached != LEVEL_RESOLVING {
        return u8_to_level(cached);
    }

    if cached == LEVEL_RESOLVING {
        return CheckLevel::Strict;
    }

    if CACHED_LEVEL
        .compare_exchange(
            LEVEL_UNRESOLVED,
            LEVEL_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_LEVEL.load(Ordering::Relaxed);
        return if v != LEVEL_UNRESOLVED && v != LEVEL_RESOLVING {
            u8_to_level(v)
        } else {
            CheckLevel::Strict
        };
    }

    let level = std::env::var("GCBRIDGE_CHECKS")
        .map(|v| CheckLevel::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_LEVEL.store(level_to_u8(level), Ordering::Release);
    level
}

/// Heap setup handed to `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Requests at or above this size take the off-page path.
    pub big_object_threshold_bytes: usize,
    /// Hard ceiling passed to the collector.
    pub max_heap_bytes: usize,
    /// Route requests carrying a layout through the typed primitives.
    pub precise_allocation: bool,
    /// Ownership bookkeeping level.
    pub check_level: CheckLevel,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            big_object_threshold_bytes: DEFAULT_BIG_OBJECT_THRESHOLD,
            max_heap_bytes: DEFAULT_MAX_HEAP,
            precise_allocation: false,
            check_level: process_check_level(),
        }
    }
}

impl HeapConfig {
    #[must_use]
    pub fn with_big_object_threshold(mut self, bytes: usize) -> Self {
        self.big_object_threshold_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_max_heap(mut self, bytes: usize) -> Self {
        self.max_heap_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_precise_allocation(mut self, enabled: bool) -> Self {
        self.precise_allocation = enabled;
        self
    }

    #[must_use]
    pub fn with_check_level(mut self, level: CheckLevel) -> Self {
        self.check_level = level;
        self
    }

    /// Reject configurations the collector cannot honor.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.big_object_threshold_bytes == 0 {
            return Err(BridgeError::InvalidConfig(
                "big_object_threshold_bytes must be non-zero",
            ));
        }
        if self.max_heap_bytes == 0 {
            return Err(BridgeError::InvalidConfig("max_heap_bytes must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_check_levels() {
        assert_eq!(CheckLevel::from_str_loose("strict"), CheckLevel::Strict);
        assert_eq!(CheckLevel::from_str_loose("STRICT"), CheckLevel::Strict);
        assert_eq!(CheckLevel::from_str_loose("default"), CheckLevel::Strict);
        assert_eq!(CheckLevel::from_str_loose("off"), CheckLevel::Off);
        assert_eq!(CheckLevel::from_str_loose(" none "), CheckLevel::Off);
        assert_eq!(CheckLevel::from_str_loose("disabled"), CheckLevel::Off);
        assert_eq!(CheckLevel::from_str_loose("bogus"), CheckLevel::Strict);
    }

    #[test]
    fn only_strict_tracks_ownership() {
        assert!(CheckLevel::Strict.tracks_ownership());
        assert!(!CheckLevel::Off.tracks_ownership());
    }

    #[test]
    fn defaults_match_reference_constants() {
        let config = HeapConfig::default();
        assert_eq!(config.big_object_threshold_bytes, 100 * 1024);
        assert_eq!(config.max_heap_bytes, 1024 * 1024 * 1024);
        assert!(!config.precise_allocation);
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        assert!(HeapConfig::default().validate().is_ok());
        assert!(matches!(
            HeapConfig::default().with_max_heap(0).validate(),
            Err(BridgeError::InvalidConfig(_))
        ));
        assert!(matches!(
            HeapConfig::default().with_big_object_threshold(0).validate(),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cached_level_is_process_sticky_until_cache_reset() {
        let previous = CACHED_LEVEL.swap(LEVEL_OFF, Ordering::SeqCst);
        assert_eq!(process_check_level(), CheckLevel::Off);
        assert_eq!(process_check_level(), CheckLevel::Off);

        CACHED_LEVEL.store(LEVEL_STRICT, Ordering::SeqCst);
        assert_eq!(process_check_level(), CheckLevel::Strict);

        CACHED_LEVEL.store(previous, Ordering::SeqCst);
    }

    #[test]
    fn resolving_state_returns_strict() {
        let previous = CACHED_LEVEL.swap(LEVEL_RESOLVING, Ordering::SeqCst);
        assert_eq!(process_check_level(), CheckLevel::Strict);
        CACHED_LEVEL.store(previous, Ordering::SeqCst);
    }
}
