//! Common test utilities for arena integration tests
//!
//! Provides a simulated GPU backend so device, managed and out-of-memory
//! paths can be exercised on machines without a GPU, plus tempfile helpers
//! for usage-report tests.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::SimulatedGpuBackend;
//!
//! let gpu = SimulatedGpuBackend::with_total_mb(64);
//! let arena = CoalescingArena::with_backend(
//!     ArenaInfo::default().set_device_memory(),
//!     gpu.clone(),
//! );
//! ```

#![allow(dead_code)]

mod tempfile_helpers;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arenaforge::backend::{HostBackend, MemoryBackend};
use arenaforge::error::{ArenaError, ArenaResult};
use arenaforge::memory::ArenaInfo;
pub use serial_test::serial;
pub use tempfile_helpers::*;

pub const MB: usize = 1024 * 1024;

/// GPU backend with a fixed amount of "device memory"
///
/// Device and managed allocations are served from host memory but counted
/// against `total`; pinned and CPU allocations pass through to the host and
/// are not counted, as on a real device.
#[derive(Debug)]
pub struct SimulatedGpuBackend {
    total: usize,
    in_use: AtomicUsize,
    device_allocs: AtomicUsize,
    device_frees: AtomicUsize,
    host: HostBackend,
}

impl SimulatedGpuBackend {
    pub fn with_total(total: usize) -> Arc<Self> {
        Arc::new(SimulatedGpuBackend {
            total,
            in_use: AtomicUsize::new(0),
            device_allocs: AtomicUsize::new(0),
            device_frees: AtomicUsize::new(0),
            host: HostBackend::new(),
        })
    }

    pub fn with_total_mb(mb: usize) -> Arc<Self> {
        Self::with_total(mb * MB)
    }

    /// Device bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn device_allocs(&self) -> usize {
        self.device_allocs.load(Ordering::SeqCst)
    }

    pub fn device_frees(&self) -> usize {
        self.device_frees.load(Ordering::SeqCst)
    }

    fn counts_against_device(info: &ArenaInfo) -> bool {
        !info.use_cpu_memory && !info.device_use_hostalloc
    }
}

impl MemoryBackend for SimulatedGpuBackend {
    fn name(&self) -> &str {
        "simulated-gpu"
    }

    fn has_gpu(&self) -> bool {
        true
    }

    fn allocate(&self, nbytes: usize, info: &ArenaInfo) -> ArenaResult<NonNull<u8>> {
        if !Self::counts_against_device(info) {
            return self.host.allocate(nbytes, info);
        }

        let previous = self.in_use.fetch_add(nbytes, Ordering::SeqCst);
        if previous + nbytes > self.total {
            self.in_use.fetch_sub(nbytes, Ordering::SeqCst);
            return Err(ArenaError::SystemAllocationFailed {
                requested: nbytes,
                reason: "simulated device out of memory".to_string(),
            });
        }

        let host_info = ArenaInfo::default().set_cpu_memory();
        match self.host.allocate(nbytes, &host_info) {
            Ok(p) => {
                self.device_allocs.fetch_add(1, Ordering::SeqCst);
                Ok(p)
            }
            Err(e) => {
                self.in_use.fetch_sub(nbytes, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    unsafe fn deallocate(&self, p: NonNull<u8>, nbytes: usize, info: &ArenaInfo) {
        if !Self::counts_against_device(info) {
            self.host.deallocate(p, nbytes, info);
            return;
        }
        self.host
            .deallocate(p, nbytes, &ArenaInfo::default().set_cpu_memory());
        self.in_use.fetch_sub(nbytes, Ordering::SeqCst);
        self.device_frees.fetch_add(1, Ordering::SeqCst);
    }

    fn free_mem_available(&self) -> usize {
        self.total.saturating_sub(self.in_use())
    }

    fn total_mem(&self) -> usize {
        self.total
    }
}

/// Addresses `[p, p + len)` of two allocations do not intersect
pub fn disjoint(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 + a.1 <= b.0 || b.0 + b.1 <= a.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_backend_limits_device_memory() {
        let gpu = SimulatedGpuBackend::with_total(4096);
        let info = ArenaInfo::default().set_device_memory();

        let p = gpu.allocate(3000, &info).unwrap();
        assert_eq!(gpu.free_mem_available(), 1096);
        assert!(gpu.allocate(2000, &info).is_err());
        assert_eq!(gpu.in_use(), 3000);

        unsafe { gpu.deallocate(p, 3000, &info) };
        assert_eq!(gpu.free_mem_available(), 4096);
        assert_eq!(gpu.device_frees(), 1);
    }

    #[test]
    fn test_simulated_backend_pinned_is_not_counted() {
        let gpu = SimulatedGpuBackend::with_total(1024);
        let info = ArenaInfo::default().set_host_alloc();
        let p = gpu.allocate(8192, &info).unwrap();
        assert_eq!(gpu.in_use(), 0);
        unsafe { gpu.deallocate(p, 8192, &info) };
    }
}
