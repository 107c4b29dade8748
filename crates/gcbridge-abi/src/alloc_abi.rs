//! ABI layer for allocation and explicit release.
//!
//! `gcbridge_alloc` and `gcbridge_free` keep the fatal contract hosts expect
//! from an allocator hook: failure aborts the process. The `try_` variants
//! return a status code instead.

use std::ffi::{c_int, c_void};
use std::ptr::NonNull;

use gcbridge_core::PointerBitmap;
use gcbridge_core::error::{BridgeError, MisuseViolation, code};

use crate::state::bridge;

/// Layout from the C arguments. A null bitmap or zero length means untyped.
/// `layout_words` is capped at the words the bitmap can describe.
///
/// # Safety
///
/// A non-null `bitmap` must be readable for `bitmap_words` words.
unsafe fn layout_from_raw(
    bitmap: *const usize,
    bitmap_words: usize,
    layout_words: usize,
) -> Option<PointerBitmap> {
    if bitmap.is_null() || layout_words == 0 {
        return None;
    }
    let layout_words = layout_words.min(bitmap_words.saturating_mul(usize::BITS as usize));
    if layout_words == 0 {
        return None;
    }
    // SAFETY: caller contract.
    let words = unsafe { std::slice::from_raw_parts(bitmap, bitmap_words) };
    Some(PointerBitmap::from_words(words, layout_words))
}

fn not_ready(op: &'static str) -> BridgeError {
    MisuseViolation::NotInitialized { op }.into()
}

/// Allocate `size` zeroed, collector-managed bytes. Aborts on failure.
///
/// `bitmap`/`bitmap_words` describe which of the first `layout_words` words
/// hold pointers; pass null and 0 for an untyped request.
///
/// # Safety
///
/// A non-null `bitmap` must be readable for `bitmap_words` words.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gcbridge_alloc(
    size: usize,
    bitmap: *const usize,
    bitmap_words: usize,
    layout_words: usize,
) -> *mut c_void {
    let Some(bridge) = bridge() else {
        std::process::abort();
    };
    // SAFETY: forwarded caller contract.
    let layout = unsafe { layout_from_raw(bitmap, bitmap_words, layout_words) };
    bridge.allocate_or_abort(size, layout.as_ref()).as_ptr().cast()
}

/// Allocate without aborting. On success writes the block to `*out` (when
/// `out` is non-null) and returns 0.
///
/// # Safety
///
/// Same as [`gcbridge_alloc`]; a non-null `out` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gcbridge_try_alloc(
    size: usize,
    bitmap: *const usize,
    bitmap_words: usize,
    layout_words: usize,
    out: *mut *mut c_void,
) -> c_int {
    let Some(bridge) = bridge() else {
        return not_ready("allocate").code();
    };
    // SAFETY: forwarded caller contract.
    let layout = unsafe { layout_from_raw(bitmap, bitmap_words, layout_words) };
    match bridge.allocate(size, layout.as_ref()) {
        Ok(ptr) => {
            if !out.is_null() {
                // SAFETY: caller guarantees `out` is writable.
                unsafe { out.write(ptr.as_ptr().cast()) };
            }
            code::OK
        }
        Err(err) => err.code(),
    }
}

/// Return `ptr` to the collector now. Null is a no-op; misuse aborts.
///
/// # Safety
///
/// `ptr` must not be used afterwards. With ownership checks off it must be
/// a live block returned by this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gcbridge_free(ptr: *mut c_void) {
    let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
        return;
    };
    let Some(bridge) = bridge() else {
        std::process::abort();
    };
    // SAFETY: forwarded caller contract.
    unsafe { bridge.release_or_abort(ptr) };
}

/// Release without aborting. Null returns 0.
///
/// # Safety
///
/// Same as [`gcbridge_free`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gcbridge_try_free(ptr: *mut c_void) -> c_int {
    let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
        return code::OK;
    };
    let Some(bridge) = bridge() else {
        return not_ready("release").code();
    };
    // SAFETY: forwarded caller contract.
    match unsafe { bridge.release(ptr) } {
        Ok(()) => code::OK,
        Err(err) => err.code(),
    }
}
