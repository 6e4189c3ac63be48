//! Allocator accounting hooks.
//!
//! The storage core tracks its resident footprint through a process-wide
//! **used-memory gauge** maintained by [`CountingAlloc`], a thin
//! [`GlobalAlloc`] wrapper over the system allocator. Every allocation
//! adds its word-aligned size to the gauge; every free subtracts it.
//! Background workers free large values concurrently with the request
//! thread, so the gauge is a relaxed atomic.
//!
//! Allocation failure is routed through a replaceable **out-of-memory
//! handler**. The default handler writes a diagnostic to stderr and
//! aborts the process; a host that prefers to degrade differently can
//! install its own with [`set_oom_handler`]. A custom handler that
//! returns leaves the null pointer to propagate, so the standard
//! `handle_alloc_error` machinery still fires.
//!
//! The allocator is **not** installed automatically — a library must not
//! hijack the global allocator. Embedding servers opt in:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: celerisdb::mem::CountingAlloc = celerisdb::mem::CountingAlloc;
//! ```

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

// ------------------------------------------------------------------------------------------------
// Used-memory gauge
// ------------------------------------------------------------------------------------------------

/// Total bytes currently allocated through [`CountingAlloc`], rounded up
/// to word alignment per allocation.
static USED_MEMORY: AtomicUsize = AtomicUsize::new(0);

/// Installed out-of-memory handler, stored as a raw `fn(usize)` address.
/// Zero means "use the default handler".
static OOM_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Returns the current used-memory gauge in bytes.
///
/// Zero until [`CountingAlloc`] is installed as the global allocator.
pub fn used_memory() -> usize {
    USED_MEMORY.load(Ordering::Relaxed)
}

/// Replaces the out-of-memory handler.
///
/// The handler receives the size of the failed allocation. It may log,
/// record, or abort; if it returns, the allocation fails normally (the
/// caller sees a null pointer and Rust aborts via `handle_alloc_error`).
pub fn set_oom_handler(handler: fn(usize)) {
    OOM_HANDLER.store(handler as usize, Ordering::SeqCst);
}

/// Rounds `n` up to the next multiple of the platform word size.
///
/// Mirrors the accounting granularity of the underlying allocator: a
/// 3-byte allocation still consumes a full word.
#[inline]
pub(crate) fn round_to_word(n: usize) -> usize {
    const WORD: usize = size_of::<usize>();
    n.checked_add(WORD - 1).map_or(usize::MAX & !(WORD - 1), |v| v & !(WORD - 1))
}

/// Invokes the configured OOM handler for a failed allocation of `size`
/// bytes. The default handler never returns.
fn notify_oom(size: usize) {
    let raw = OOM_HANDLER.load(Ordering::SeqCst);
    if raw == 0 {
        // No tracing here: the subscriber may itself need to allocate.
        eprintln!("celerisdb: out of memory allocating {size} bytes, aborting");
        std::process::abort();
    }
    // SAFETY: the only writer of OOM_HANDLER is `set_oom_handler`, which
    // stores a valid `fn(usize)` address; zero is filtered above.
    let handler: fn(usize) = unsafe { std::mem::transmute::<usize, fn(usize)>(raw) };
    handler(size);
}

// ------------------------------------------------------------------------------------------------
// Counting allocator
// ------------------------------------------------------------------------------------------------

/// A [`GlobalAlloc`] that delegates to the system allocator while
/// maintaining the process-wide used-memory gauge.
///
/// The gauge uses relaxed atomics: it is a statistic, not a
/// synchronization point, and it is updated from worker threads during
/// deferred frees concurrently with the request thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingAlloc;

// SAFETY: all methods delegate directly to `System`, which upholds the
// `GlobalAlloc` contract; the gauge updates have no effect on the
// returned memory.
unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if ptr.is_null() {
            notify_oom(layout.size());
        } else {
            USED_MEMORY.fetch_add(round_to_word(layout.size()), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if ptr.is_null() {
            notify_oom(layout.size());
        } else {
            USED_MEMORY.fetch_add(round_to_word(layout.size()), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        USED_MEMORY.fetch_sub(round_to_word(layout.size()), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if new_ptr.is_null() {
            notify_oom(new_size);
        } else {
            let old = round_to_word(layout.size());
            let new = round_to_word(new_size);
            if new >= old {
                USED_MEMORY.fetch_add(new - old, Ordering::Relaxed);
            } else {
                USED_MEMORY.fetch_sub(old - new, Ordering::Relaxed);
            }
        }
        new_ptr
    }
}
