//! HIP error types

use thiserror::Error;

/// HIP error types
#[derive(Error, Debug, Clone)]
pub enum HipError {
    #[error("HIP initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Memory allocation failed: {0}")]
    MemoryAllocationFailed(String),
    #[error("Memory free failed: {0}")]
    MemoryFreeFailed(String),
    #[error("Memory query failed: {0}")]
    MemoryQueryFailed(String),
    #[error("Memory advise failed: {0}")]
    MemoryAdviseFailed(String),
    #[error("Device not found")]
    DeviceNotFound,
    #[error("Device error: {0}")]
    DeviceError(String),
}

/// HIP result type
pub type HipResult<T> = Result<T, HipError>;

impl HipError {
    /// Whether the driver refused to hand out memory
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, HipError::MemoryAllocationFailed(_))
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// An allocation failure may succeed after cached arena memory has been
    /// released. Missing devices and a broken runtime never recover.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HipError::MemoryAllocationFailed(_)
                | HipError::MemoryQueryFailed(_)
                | HipError::DeviceError(_)
        )
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}
