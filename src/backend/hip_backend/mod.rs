//! ROCm/HIP memory backend
//!
//! The FFI bindings and the backend itself are only compiled with the `rocm`
//! feature. [`HipError`] is always available so error handling does not
//! depend on the build flavor.

mod error;
#[cfg(feature = "rocm")]
mod ffi;
#[cfg(feature = "rocm")]
mod memory;

pub use error::{HipError, HipResult};
#[cfg(feature = "rocm")]
pub use memory::HipMemoryBackend;
