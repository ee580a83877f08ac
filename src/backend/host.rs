//! Host memory backend built on the C allocator

use std::ffi::c_void;
use std::ptr::{self, NonNull};

use super::MemoryBackend;
use crate::error::{ArenaError, ArenaResult};
use crate::memory::{ArenaInfo, ALIGN_SIZE};

/// Plain host memory, page-locked with `mlock` when the arena asks for host
/// allocation (pinned memory on a host-only run)
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl HostBackend {
    pub fn new() -> Self {
        HostBackend
    }
}

impl MemoryBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn allocate(&self, nbytes: usize, info: &ArenaInfo) -> ArenaResult<NonNull<u8>> {
        let mut p: *mut c_void = ptr::null_mut();
        // posix_memalign(0) may legally return null
        let rc = unsafe { libc::posix_memalign(&mut p, ALIGN_SIZE, nbytes.max(1)) };
        if rc != 0 || p.is_null() {
            tracing::error!("HostBackend: posix_memalign failed ({}) for {} bytes", rc, nbytes);
            return Err(ArenaError::SystemAllocationFailed {
                requested: nbytes,
                reason: format!("posix_memalign returned {}", rc),
            });
        }

        if info.device_use_hostalloc && nbytes > 0 {
            let rc = unsafe { libc::mlock(p, nbytes) };
            if rc != 0 {
                // RLIMIT_MEMLOCK is commonly tiny; pinning is an optimization here
                tracing::warn!(
                    "HostBackend: mlock of {} bytes failed: {}",
                    nbytes,
                    std::io::Error::last_os_error()
                );
            }
        }

        tracing::trace!("HostBackend: allocated {} bytes at {:?}", nbytes, p);
        // posix_memalign succeeded with a non-null pointer
        NonNull::new(p as *mut u8).ok_or(ArenaError::SystemAllocationFailed {
            requested: nbytes,
            reason: "null pointer".to_string(),
        })
    }

    unsafe fn deallocate(&self, p: NonNull<u8>, nbytes: usize, info: &ArenaInfo) {
        let raw = p.as_ptr() as *mut c_void;
        if info.device_use_hostalloc && nbytes > 0 {
            libc::munlock(raw, nbytes);
        }
        libc::free(raw);
    }
}
