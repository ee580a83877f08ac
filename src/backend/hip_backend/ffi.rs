//! HIP FFI bindings
//!
//! Only the memory-management slice of the ROCm HIP API is bound here.
//! All functions are called through `HipMemoryBackend`.

use std::ffi::c_void;

#[link(name = "amdhip64")]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipMallocManaged(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipHostFree(ptr: *mut c_void) -> i32;
    pub fn hipMemAdvise(ptr: *const c_void, count: usize, advice: i32, device: i32) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const std::ffi::c_char;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// `hipMemAttachGlobal`: managed memory accessible from any stream
pub const HIP_MEM_ATTACH_GLOBAL: u32 = 0x1;

/// `hipHostMallocMapped`: map the pinned allocation into the device address space
pub const HIP_HOST_MALLOC_MAPPED: u32 = 0x2;
/// `hipHostMallocNonCoherent`
pub const HIP_HOST_MALLOC_NON_COHERENT: u32 = 0x8000_0000;

// hipMemoryAdvise values
pub const HIP_MEM_ADVISE_SET_READ_MOSTLY: i32 = 1;
pub const HIP_MEM_ADVISE_SET_PREFERRED_LOCATION: i32 = 3;
pub const HIP_MEM_ADVISE_SET_COARSE_GRAIN: i32 = 100;
