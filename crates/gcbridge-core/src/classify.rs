//! Allocation path selection.
//!
//! Every request is served by exactly one native primitive. Untyped requests
//! are partitioned by the big-object threshold; requests resolved to a type
//! descriptor go to the typed primitives regardless of size.

use std::fmt;

use serde::Serialize;

/// Native primitive that served (or would serve) a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocPath {
    /// Pooled small-object allocation (`GC_malloc`).
    Small,
    /// Off-page allocation for big objects (`GC_malloc_ignore_off_page`).
    Large,
    /// Precise allocation with a type descriptor (`GC_malloc_explicitly_typed`).
    Typed,
    /// Precise zeroed array allocation (`GC_calloc_explicitly_typed`).
    TypedArray,
}

impl AllocPath {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Large => "large",
            Self::Typed => "typed",
            Self::TypedArray => "typed_array",
        }
    }

    #[must_use]
    pub const fn is_typed(self) -> bool {
        matches!(self, Self::Typed | Self::TypedArray)
    }
}

impl fmt::Display for AllocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Path for an untyped request of `size` bytes.
#[inline]
#[must_use]
pub const fn untyped_path(size: usize, big_object_threshold: usize) -> AllocPath {
    if size >= big_object_threshold {
        AllocPath::Large
    } else {
        AllocPath::Small
    }
}

/// Path for a single-object request, typed when a descriptor was resolved.
#[inline]
#[must_use]
pub const fn select_path(size: usize, big_object_threshold: usize, typed: bool) -> AllocPath {
    if typed {
        AllocPath::Typed
    } else {
        untyped_path(size, big_object_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: usize = 100 * 1024;

    #[test]
    fn threshold_is_inclusive_for_large() {
        assert_eq!(untyped_path(THRESHOLD - 1, THRESHOLD), AllocPath::Small);
        assert_eq!(untyped_path(THRESHOLD, THRESHOLD), AllocPath::Large);
        assert_eq!(untyped_path(THRESHOLD + 1, THRESHOLD), AllocPath::Large);
    }

    #[test]
    fn every_size_lands_in_exactly_one_untyped_path() {
        for size in (0..4 * THRESHOLD).step_by(997) {
            let path = untyped_path(size, THRESHOLD);
            assert_eq!(path == AllocPath::Large, size >= THRESHOLD, "size={size}");
            assert!(!path.is_typed());
        }
    }

    #[test]
    fn typed_overrides_size() {
        assert_eq!(select_path(16, THRESHOLD, true), AllocPath::Typed);
        assert_eq!(select_path(THRESHOLD * 2, THRESHOLD, true), AllocPath::Typed);
        assert_eq!(select_path(16, THRESHOLD, false), AllocPath::Small);
    }

    #[test]
    fn display_matches_serde_names() {
        for path in [
            AllocPath::Small,
            AllocPath::Large,
            AllocPath::Typed,
            AllocPath::TypedArray,
        ] {
            let json = serde_json::to_string(&path).unwrap();
            assert_eq!(json, format!("\"{path}\""));
        }
    }
}
