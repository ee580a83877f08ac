//! System memory backends
//!
//! A [`MemoryBackend`] is the "system allocator" underneath every arena: the
//! host allocator, or the GPU vendor runtime. Arenas never call `malloc` or
//! `hipMalloc` directly; they ask their backend, which picks the right call
//! from the arena's [`ArenaInfo`].

pub mod hip_backend;
mod host;

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::ArenaResult;
use crate::memory::ArenaInfo;

pub use hip_backend::{HipError, HipResult};
#[cfg(feature = "rocm")]
pub use hip_backend::HipMemoryBackend;
pub use host::HostBackend;

/// Source of raw memory for arenas
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Short backend name used in diagnostics
    fn name(&self) -> &str;

    /// Whether allocations can land on a GPU
    fn has_gpu(&self) -> bool {
        false
    }

    /// Obtain `nbytes` of memory of the kind described by `info`
    fn allocate(&self, nbytes: usize, info: &ArenaInfo) -> ArenaResult<NonNull<u8>>;

    /// Return memory to the system
    ///
    /// # Safety
    ///
    /// `p` must come from [`MemoryBackend::allocate`] on this backend with the
    /// same `nbytes` and `info`, and must not be used afterwards.
    unsafe fn deallocate(&self, p: NonNull<u8>, nbytes: usize, info: &ArenaInfo);

    /// Free device memory in bytes (`usize::MAX` without a GPU)
    fn free_mem_available(&self) -> usize {
        usize::MAX
    }

    /// Total device memory in bytes (0 without a GPU)
    fn total_mem(&self) -> usize {
        0
    }
}

/// Shared handle to a backend
pub type BackendHandle = Arc<dyn MemoryBackend>;

/// Pick the backend for this run
///
/// With the `rocm` feature a HIP device is used when one is present; every
/// other case falls back to host memory.
pub fn default_backend() -> BackendHandle {
    #[cfg(feature = "rocm")]
    {
        match HipMemoryBackend::new() {
            Ok(backend) => return Arc::new(backend),
            Err(e) => {
                tracing::warn!("No usable HIP device ({}), falling back to host memory", e);
            }
        }
    }
    Arc::new(HostBackend::new())
}
