//! Unified error handling for arenaforge
//!
//! Every failure the arena layer can observe is an [`ArenaError`]. Errors are
//! categorized so callers can tell system exhaustion (fatal) apart from
//! misuse (a bug in the caller) and from broken run environments (I/O).
//!
//! Nothing is recoverable above the allocator boundary: [`Arena::alloc`]
//! routes every error through [`fatal`]. The fallible `try_*` forms exist for
//! code that wants to observe the failure before the rank goes down.
//!
//! [`Arena::alloc`]: crate::memory::Arena::alloc

use std::fmt;
use std::path::PathBuf;

use crate::backend::hip_backend::HipError;

/// Unified error type for arenaforge
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    // ========== System Exhaustion ==========
    /// The host allocator or GPU driver refused a request
    #[error("System allocation of {requested} bytes failed: {reason}")]
    SystemAllocationFailed { requested: usize, reason: String },

    /// A device or managed arena would exceed free device memory
    #[error("Out of gpu memory. Free: {free} Asked: {requested}")]
    OutOfDeviceMemory { free: usize, requested: usize },

    // ========== Misuse ==========
    /// Pointer was not handed out by this arena
    #[error("Pointer {0:#x} was not allocated by this arena")]
    InvalidPointer(usize),

    /// Pointer was already returned to this arena
    #[error("Pointer {0:#x} freed twice")]
    DoubleFree(usize),

    /// `register_for_profiling` called twice without deregistering
    #[error("Arena already registered for profiling as '{0}'")]
    ProfilingAlreadyRegistered(String),

    // ========== I/O ==========
    /// Could not open a per-rank usage file for appending
    #[error("Could not open {path} for appending: {source}")]
    UsageFileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Write failure while producing diagnostics
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Configuration ==========
    /// Parameter value could not be parsed or is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Backend ==========
    /// HIP runtime error
    #[error("HIP error: {0}")]
    Hip(#[from] HipError),

    // ========== Internal ==========
    /// Lock poisoned (a thread panicked while holding arena state)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ArenaError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ArenaError::SystemAllocationFailed { .. } => ErrorCategory::Exhaustion,
            ArenaError::OutOfDeviceMemory { .. } => ErrorCategory::NearExhaustion,
            ArenaError::InvalidPointer(_)
            | ArenaError::DoubleFree(_)
            | ArenaError::ProfilingAlreadyRegistered(_) => ErrorCategory::Misuse,
            ArenaError::UsageFileOpen { .. } | ArenaError::Io(_) => ErrorCategory::Io,
            ArenaError::InvalidConfiguration(_) => ErrorCategory::Configuration,
            ArenaError::Hip(e) if e.is_allocation_failure() => ErrorCategory::Exhaustion,
            ArenaError::Hip(_) | ArenaError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the run cannot continue after this error
    ///
    /// Misuse is the only category that is survivable, because the arena
    /// state is left untouched when a bad pointer is rejected.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Misuse)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Host `malloc` or the GPU allocator failed
    Exhaustion,
    /// Free device memory check failed before growing an arena
    NearExhaustion,
    /// Double free, foreign pointer, double profiling registration
    Misuse,
    /// Diagnostic dump could not be written
    Io,
    /// Bad parameter value
    Configuration,
    /// Indicates a bug or a broken driver
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Exhaustion => write!(f, "Exhaustion"),
            ErrorCategory::NearExhaustion => write!(f, "NearExhaustion"),
            ErrorCategory::Misuse => write!(f, "Misuse"),
            ErrorCategory::Io => write!(f, "Io"),
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ArenaError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ArenaError::LockPoisoned(err.to_string())
    }
}

/// Result alias used across the crate
pub type ArenaResult<T> = std::result::Result<T, ArenaError>;

/// Terminate the rank after an unrecoverable allocator failure.
///
/// The error is logged first so it reaches the configured subscriber even when
/// the release profile aborts instead of unwinding.
#[cold]
#[track_caller]
pub fn fatal(err: ArenaError) -> ! {
    tracing::error!(category = %err.category(), "arena failure: {}", err);
    panic!("arenaforge: {}", err)
}

/// Create a configuration error with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::ArenaError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ArenaError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}
