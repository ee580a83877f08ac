//! The allocation contract shared by every arena
//!
//! An arena hands out raw memory of one kind (host, pinned, device, managed)
//! and takes it back. Callers hold an [`ArenaHandle`] obtained from the
//! registry and never learn which concrete allocator sits behind it.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::info::ArenaInfo;
use super::profiler::ArenaProfiler;
use crate::error::{fatal, ArenaError, ArenaResult};

/// Alignment of every pointer an arena returns
pub const ALIGN_SIZE: usize = 16;

/// Round `size` up to a multiple of `align` (a power of two)
///
/// `size` must leave room for the rounding; see [`checked_aligned_size`].
#[inline]
pub const fn aligned_size(align: usize, size: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// [`aligned_size`], or `None` when the rounded size does not fit in `usize`
#[inline]
pub const fn checked_aligned_size(align: usize, size: usize) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(n) => Some(n & !(align - 1)),
        None => None,
    }
}

/// Block size for a request of `nbytes`: at least one unit, rounded to
/// [`ALIGN_SIZE`]
pub(crate) fn request_size(nbytes: usize) -> ArenaResult<usize> {
    checked_aligned_size(ALIGN_SIZE, nbytes.max(1)).ok_or_else(|| too_large(nbytes))
}

pub(crate) fn too_large(nbytes: usize) -> ArenaError {
    ArenaError::SystemAllocationFailed {
        requested: nbytes,
        reason: "request size overflows the address space".to_string(),
    }
}

/// Check whether `ptr` is a multiple of `alignment` (a power of two)
#[inline]
pub fn is_aligned(ptr: *const u8, alignment: usize) -> bool {
    (ptr as usize) & (alignment - 1) == 0
}

/// Concrete allocator behind a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArenaKind {
    Coalescing,
    Pool,
    Basic,
    Null,
}

impl fmt::Display for ArenaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaKind::Coalescing => write!(f, "CoalescingArena"),
            ArenaKind::Pool => write!(f, "PoolArena"),
            ArenaKind::Basic => write!(f, "BasicArena"),
            ArenaKind::Null => write!(f, "NullArena"),
        }
    }
}

/// Usage snapshot reported by arenas that keep counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaUsage {
    /// Bytes currently obtained from the system
    pub heap_bytes: usize,
    /// Bytes handed out to callers
    pub used_bytes: usize,
    /// Bytes held by the arena but not handed out
    pub cached_bytes: usize,
    pub peak_heap_bytes: usize,
    pub peak_used_bytes: usize,
    /// Outstanding allocations
    pub live_allocations: usize,
    /// Calls into the system allocator
    pub system_allocs: u64,
    /// Calls returning memory to the system
    pub system_frees: u64,
}

/// Shared handle to an arena
pub type ArenaHandle = Arc<dyn Arena>;

/// Whether two handles point at the same physical arena
pub fn same_arena(a: &ArenaHandle, b: &ArenaHandle) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Log a rejected operation and, for misuse, trip a debug assertion
///
/// Anything other than misuse cannot be survived and goes through [`fatal`].
#[track_caller]
pub(crate) fn reject(err: ArenaError) {
    if err.is_fatal() {
        fatal(err);
    }
    tracing::error!(category = %err.category(), "{}", err);
    debug_assert!(false, "{}", err);
}

/// Allocator interface implemented by every arena
///
/// Only the `try_*` operations, [`Arena::arena_info`], [`Arena::kind`] and
/// [`Arena::profiler`] are required; everything else has a default built on
/// top of them.
pub trait Arena: Send + Sync + fmt::Debug {
    /// Allocate at least `nbytes` bytes aligned to [`ALIGN_SIZE`]
    fn try_alloc(&self, nbytes: usize) -> ArenaResult<*mut u8>;

    /// Return a pointer obtained from this arena. Null is a no-op.
    fn try_free(&self, p: *mut u8) -> ArenaResult<()>;

    fn arena_info(&self) -> &ArenaInfo;

    fn kind(&self) -> ArenaKind;

    fn profiler(&self) -> &ArenaProfiler;

    /// Whether the backing memory comes from a GPU runtime
    fn gpu_backed(&self) -> bool {
        false
    }

    /// Allocate or terminate the rank
    ///
    /// Never returns null for a satisfiable request. Only [`ArenaKind::Null`]
    /// returns null.
    #[track_caller]
    fn alloc(&self, nbytes: usize) -> *mut u8 {
        match self.try_alloc(nbytes) {
            Ok(p) => p,
            Err(e) => fatal(e),
        }
    }

    /// Return memory to the arena
    ///
    /// Foreign pointers and double frees are logged and ignored; debug builds
    /// assert.
    #[track_caller]
    fn free(&self, p: *mut u8) {
        if let Err(e) = self.try_free(p) {
            reject(e);
        }
    }

    /// Grow the allocation at `p` without moving it, to at most `szmax` bytes
    ///
    /// Returns the pointer to use and its usable size. Arenas that cannot grow
    /// in place return a fresh allocation of `szmax` bytes; the caller copies
    /// and frees the old one.
    fn alloc_in_place(&self, _p: *mut u8, _szmin: usize, szmax: usize) -> (*mut u8, usize) {
        (self.alloc(szmax), szmax)
    }

    /// Shrink the allocation at `p` to `nbytes`
    ///
    /// The default cannot shrink and returns a fresh allocation.
    fn shrink_in_place(&self, _p: *mut u8, nbytes: usize) -> *mut u8 {
        self.alloc(nbytes)
    }

    /// Release cached memory; returns the number of bytes given back
    fn free_unused(&self) -> usize {
        0
    }

    /// Whether `nbytes` more device memory is available
    ///
    /// May release cached memory to make room.
    fn has_free_device_memory(&self, _nbytes: usize) -> bool {
        true
    }

    fn is_device_accessible(&self) -> bool {
        self.arena_info().is_device_accessible(self.gpu_backed())
    }

    fn is_host_accessible(&self) -> bool {
        self.arena_info().is_host_accessible(self.gpu_backed())
    }

    fn is_managed(&self) -> bool {
        self.arena_info().is_managed(self.gpu_backed())
    }

    fn is_device(&self) -> bool {
        self.arena_info().is_device(self.gpu_backed())
    }

    fn is_pinned(&self) -> bool {
        self.arena_info().is_pinned(self.gpu_backed())
    }

    /// Whether frees are ordered with respect to a GPU stream
    fn is_stream_ordered(&self) -> bool {
        false
    }

    /// Round `nbytes` up to [`ALIGN_SIZE`]
    fn align(&self, nbytes: usize) -> usize {
        aligned_size(ALIGN_SIZE, nbytes)
    }

    /// Counters for diagnostics; `None` when the arena keeps none
    fn usage(&self) -> Option<ArenaUsage> {
        None
    }

    fn register_for_profiling(&self, memory_name: &str) -> ArenaResult<()> {
        self.profiler().register(memory_name)
    }

    fn deregister_from_profiling(&self) {
        self.profiler().deregister()
    }
}
