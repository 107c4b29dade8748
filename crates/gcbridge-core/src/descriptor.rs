//! Pointer layouts and the typed-allocation descriptor cache.
//!
//! A [`PointerBitmap`] says which words of an object hold pointers. The
//! collector turns a bitmap into an opaque [`GcDescriptor`]; building one is
//! not free, so descriptors are cached per distinct bitmap for the lifetime of
//! the process. The set of object shapes in a program is bounded, so the cache
//! is append-only and never evicts.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::collector::GcDescriptor;

const WORD_BITS: usize = usize::BITS as usize;

/// Which words of an object hold pointers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointerBitmap {
    len_words: usize,
    bits: Box<[usize]>,
}

impl PointerBitmap {
    /// Bitmap from raw words, bit `i % WORD_BITS` of word `i / WORD_BITS`
    /// describing object word `i`. Bits past `len_words` are cleared so equal
    /// shapes always compare equal.
    #[must_use]
    pub fn from_words(words: &[usize], len_words: usize) -> Self {
        let needed = len_words.div_ceil(WORD_BITS);
        let mut bits = vec![0usize; needed];
        for (dst, src) in bits.iter_mut().zip(words) {
            *dst = *src;
        }
        let tail = len_words % WORD_BITS;
        if tail != 0 {
            if let Some(last) = bits.last_mut() {
                *last &= (1usize << tail) - 1;
            }
        }
        Self {
            len_words,
            bits: bits.into_boxed_slice(),
        }
    }

    /// Bitmap of `len_words` words with the given word indices marked.
    /// Indices past the end are ignored.
    #[must_use]
    pub fn from_pointer_words(len_words: usize, pointer_words: impl IntoIterator<Item = usize>) -> Self {
        let mut bits = vec![0usize; len_words.div_ceil(WORD_BITS)];
        for idx in pointer_words {
            if idx < len_words {
                bits[idx / WORD_BITS] |= 1usize << (idx % WORD_BITS);
            }
        }
        Self {
            len_words,
            bits: bits.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn len_words(&self) -> usize {
        self.len_words
    }

    #[must_use]
    pub fn words(&self) -> &[usize] {
        &self.bits
    }

    #[must_use]
    pub fn is_pointer(&self, word: usize) -> bool {
        word < self.len_words && self.bits[word / WORD_BITS] & (1usize << (word % WORD_BITS)) != 0
    }

    #[must_use]
    pub fn pointer_count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// A collector descriptor together with the object length it describes.
#[derive(Debug, PartialEq, Eq)]
pub struct AllocationDescriptor {
    pub descriptor: GcDescriptor,
    pub len_words: usize,
}

/// Shared handle; identity (`Arc::ptr_eq`) is stable per cached shape.
pub type DescriptorHandle = Arc<AllocationDescriptor>;

/// Whether a lookup was served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

/// Append-only map from bitmap shape to descriptor handle.
///
/// Descriptors are computed outside the lock. Two threads missing on the same
/// shape may both compute it; the first insert wins and both callers get the
/// winner's handle.
pub struct DescriptorCache {
    entries: RwLock<HashMap<PointerBitmap, DescriptorHandle>>,
}

impl DescriptorCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Process-wide cache, created on first use and never torn down.
    pub fn global() -> &'static Arc<DescriptorCache> {
        static GLOBAL: OnceLock<Arc<DescriptorCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(DescriptorCache::new()))
    }

    #[must_use]
    pub fn lookup(&self, bitmap: &PointerBitmap) -> Option<DescriptorHandle> {
        self.entries.read().get(bitmap).cloned()
    }

    /// Cached handle for `bitmap`, building it with `build` on a miss.
    pub fn resolve(
        &self,
        bitmap: &PointerBitmap,
        build: impl FnOnce(&PointerBitmap) -> GcDescriptor,
    ) -> (DescriptorHandle, CacheOutcome) {
        if let Some(handle) = self.lookup(bitmap) {
            return (handle, CacheOutcome::Hit);
        }

        let computed = Arc::new(AllocationDescriptor {
            descriptor: build(bitmap),
            len_words: bitmap.len_words(),
        });

        let mut entries = self.entries.write();
        let handle = entries.entry(bitmap.clone()).or_insert(computed).clone();
        (handle, CacheOutcome::Miss)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DescriptorCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_words_masks_bits_past_length() {
        let a = PointerBitmap::from_words(&[0b1111_0101], 3);
        let b = PointerBitmap::from_words(&[0b0000_0101], 3);
        assert_eq!(a, b);
        assert!(a.is_pointer(0));
        assert!(!a.is_pointer(1));
        assert!(a.is_pointer(2));
        assert!(!a.is_pointer(3));
        assert_eq!(a.pointer_count(), 2);
    }

    #[test]
    fn pointer_word_indices_match_raw_words() {
        let from_idx = PointerBitmap::from_pointer_words(70, [0, 5, 64, 69, 200]);
        let mut raw = [0usize; 2];
        raw[0] = 1 | (1 << 5);
        raw[1] = 1 | (1 << 5);
        if WORD_BITS == 64 {
            assert_eq!(from_idx, PointerBitmap::from_words(&raw, 70));
        }
        assert_eq!(from_idx.pointer_count(), 4);
        assert!(from_idx.is_pointer(69));
        assert!(!from_idx.is_pointer(200));
    }

    #[test]
    fn short_word_slices_are_zero_extended() {
        let bitmap = PointerBitmap::from_words(&[], 130);
        assert_eq!(bitmap.pointer_count(), 0);
        assert_eq!(bitmap.words().len(), 130usize.div_ceil(WORD_BITS));
    }

    #[test]
    fn identical_shapes_resolve_to_identical_handle() {
        let cache = DescriptorCache::new();
        let mut builds = 0;
        let shape = PointerBitmap::from_pointer_words(4, [1, 3]);

        let (first, outcome) = cache.resolve(&shape, |_| {
            builds += 1;
            GcDescriptor(0xA1)
        });
        assert_eq!(outcome, CacheOutcome::Miss);

        let (second, outcome) = cache.resolve(&shape.clone(), |_| {
            builds += 1;
            GcDescriptor(0xB2)
        });
        assert_eq!(outcome, CacheOutcome::Hit);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.descriptor, GcDescriptor(0xA1));
        assert_eq!(builds, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_shapes_get_distinct_entries() {
        let cache = DescriptorCache::new();
        let (a, _) = cache.resolve(&PointerBitmap::from_pointer_words(4, [0]), |_| GcDescriptor(1));
        let (b, _) = cache.resolve(&PointerBitmap::from_pointer_words(5, [0]), |_| GcDescriptor(2));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_misses_converge_on_one_handle() {
        let cache = Arc::new(DescriptorCache::new());
        let shape = PointerBitmap::from_pointer_words(8, [2, 4, 6]);
        let handles: Vec<DescriptorHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|i| {
                    let cache = Arc::clone(&cache);
                    let shape = shape.clone();
                    scope.spawn(move || cache.resolve(&shape, |_| GcDescriptor(i)).0)
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        let settled = cache.lookup(&shape).expect("cached");
        for handle in &handles {
            assert!(Arc::ptr_eq(handle, &settled));
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn global_cache_is_a_singleton() {
        assert!(Arc::ptr_eq(DescriptorCache::global(), DescriptorCache::global()));
    }
}
