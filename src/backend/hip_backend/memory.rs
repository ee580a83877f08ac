//! HIP memory backend: device, managed and pinned allocations through the ROCm runtime

use std::ffi::{c_void, CStr};
use std::ptr::{self, NonNull};

use crate::backend::hip_backend::error::{HipError, HipResult};
use crate::backend::hip_backend::ffi;
use crate::backend::{HostBackend, MemoryBackend};
use crate::error::{ArenaError, ArenaResult};
use crate::memory::ArenaInfo;

/// Human-readable name of a HIP error code
fn error_string(code: i32) -> String {
    let raw = unsafe { ffi::hipGetErrorString(code) };
    if raw.is_null() {
        return format!("hipError {}", code);
    }
    // SAFETY: hipGetErrorString returns a static NUL-terminated string
    unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
}

fn check(code: i32, call: &str, nbytes: usize) -> HipResult<()> {
    if code == ffi::HIP_SUCCESS {
        return Ok(());
    }
    Err(HipError::MemoryAllocationFailed(format!(
        "{} failed with code {} ({}) for {} bytes",
        call,
        code,
        error_string(code),
        nbytes
    )))
}

/// Memory backend bound to one HIP device
///
/// CPU-memory requests are forwarded to [`HostBackend`] so a single backend
/// serves every arena of a GPU run.
#[derive(Debug)]
pub struct HipMemoryBackend {
    device_id: i32,
    total_mem: usize,
    host: HostBackend,
}

impl HipMemoryBackend {
    /// Initialize the HIP runtime and bind device 0
    pub fn new() -> HipResult<Self> {
        Self::with_device(0)
    }

    /// Initialize the HIP runtime and bind the given device
    pub fn with_device(device_id: i32) -> HipResult<Self> {
        let result = unsafe { ffi::hipInit(0) };
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::InitializationFailed(format!(
                "hipInit failed with code {} ({})",
                result,
                error_string(result)
            )));
        }

        let mut count: i32 = 0;
        let result = unsafe { ffi::hipGetDeviceCount(&mut count) };
        if result != ffi::HIP_SUCCESS || count <= 0 {
            return Err(HipError::DeviceNotFound);
        }
        if device_id >= count {
            return Err(HipError::DeviceError(format!(
                "device {} requested but only {} present",
                device_id, count
            )));
        }

        let result = unsafe { ffi::hipSetDevice(device_id) };
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::DeviceError(format!(
                "hipSetDevice({}) failed with code {}",
                device_id, result
            )));
        }

        let (_, total_mem) = Self::memory_info()?;
        tracing::info!(
            "HIP memory backend on device {}: {} MB global memory",
            device_id,
            total_mem / (1024 * 1024)
        );

        Ok(Self {
            device_id,
            total_mem,
            host: HostBackend::new(),
        })
    }

    /// Device this backend allocates on
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// `(free, total)` device memory in bytes
    pub fn memory_info() -> HipResult<(usize, usize)> {
        let mut free: usize = 0;
        let mut total: usize = 0;

        let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::MemoryQueryFailed(format!(
                "hipMemGetInfo failed with code {}",
                result
            )));
        }

        Ok((free, total))
    }

    fn advise(&self, p: *mut c_void, nbytes: usize, advice: i32) -> HipResult<()> {
        let result = unsafe { ffi::hipMemAdvise(p, nbytes, advice, self.device_id) };
        if result != ffi::HIP_SUCCESS {
            return Err(HipError::MemoryAdviseFailed(format!(
                "hipMemAdvise({}) failed with code {}",
                advice, result
            )));
        }
        Ok(())
    }

    fn allocate_managed(&self, nbytes: usize, info: &ArenaInfo) -> HipResult<*mut c_void> {
        let mut p: *mut c_void = ptr::null_mut();
        let result = unsafe { ffi::hipMallocManaged(&mut p, nbytes, ffi::HIP_MEM_ATTACH_GLOBAL) };
        check(result, "hipMallocManaged", nbytes)?;

        // Device atomics on managed memory require coarse-grained coherence
        self.advise(p, nbytes, ffi::HIP_MEM_ADVISE_SET_COARSE_GRAIN)?;
        if info.device_set_readonly {
            self.advise(p, nbytes, ffi::HIP_MEM_ADVISE_SET_READ_MOSTLY)?;
        }
        if info.device_set_preferred {
            self.advise(p, nbytes, ffi::HIP_MEM_ADVISE_SET_PREFERRED_LOCATION)?;
        }
        Ok(p)
    }
}

impl MemoryBackend for HipMemoryBackend {
    fn name(&self) -> &str {
        "hip"
    }

    fn has_gpu(&self) -> bool {
        true
    }

    fn allocate(&self, nbytes: usize, info: &ArenaInfo) -> ArenaResult<NonNull<u8>> {
        if info.use_cpu_memory {
            return self.host.allocate(nbytes, info);
        }

        tracing::trace!("HipMemoryBackend::allocate: {} bytes ({:?})", nbytes, info);

        let p = if info.device_use_hostalloc {
            let mut p: *mut c_void = ptr::null_mut();
            let flags = ffi::HIP_HOST_MALLOC_MAPPED | ffi::HIP_HOST_MALLOC_NON_COHERENT;
            let result = unsafe { ffi::hipHostMalloc(&mut p, nbytes, flags) };
            check(result, "hipHostMalloc", nbytes)?;
            p
        } else if info.device_use_managed_memory {
            self.allocate_managed(nbytes, info)?
        } else {
            let mut p: *mut c_void = ptr::null_mut();
            let result = unsafe { ffi::hipMalloc(&mut p, nbytes) };
            check(result, "hipMalloc", nbytes)?;
            p
        };

        NonNull::new(p as *mut u8).ok_or_else(|| {
            ArenaError::Hip(HipError::MemoryAllocationFailed(format!(
                "HIP returned null pointer for {} bytes",
                nbytes
            )))
        })
    }

    unsafe fn deallocate(&self, p: NonNull<u8>, nbytes: usize, info: &ArenaInfo) {
        if info.use_cpu_memory {
            self.host.deallocate(p, nbytes, info);
            return;
        }

        let raw = p.as_ptr() as *mut c_void;
        let (call, result) = if info.device_use_hostalloc {
            ("hipHostFree", ffi::hipHostFree(raw))
        } else {
            ("hipFree", ffi::hipFree(raw))
        };
        if result != ffi::HIP_SUCCESS {
            // Freeing is not allowed to fail; a failure here means the driver is gone
            crate::error::fatal(ArenaError::Hip(HipError::MemoryFreeFailed(format!(
                "{} failed with code {} ({}) for {:?}",
                call,
                result,
                error_string(result),
                raw
            ))));
        }
    }

    fn free_mem_available(&self) -> usize {
        match Self::memory_info() {
            Ok((free, _)) => free,
            Err(e) => {
                tracing::error!("Could not query free device memory: {}", e);
                0
            }
        }
    }

    fn total_mem(&self) -> usize {
        self.total_mem
    }
}
