//! Arena configuration value object

use serde::{Deserialize, Serialize};

/// Kind of memory an arena hands out, plus its release threshold
///
/// Managed, device and pinned memory are mutually exclusive; the setters keep
/// the flags consistent. Host-accessible and device-accessible may both hold
/// (managed and pinned memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaInfo {
    /// Maximum cached bytes before memory is returned to the system
    pub release_threshold: usize,
    pub use_cpu_memory: bool,
    pub device_use_managed_memory: bool,
    pub device_set_readonly: bool,
    pub device_set_preferred: bool,
    pub device_use_hostalloc: bool,
}

impl Default for ArenaInfo {
    fn default() -> Self {
        ArenaInfo {
            release_threshold: usize::MAX,
            use_cpu_memory: false,
            device_use_managed_memory: true,
            device_set_readonly: false,
            device_set_preferred: false,
            device_use_hostalloc: false,
        }
    }
}

impl ArenaInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_release_threshold(mut self, release_threshold: usize) -> Self {
        self.release_threshold = release_threshold;
        self
    }

    /// Plain device memory (`hipMalloc`)
    pub fn set_device_memory(mut self) -> Self {
        self.device_use_managed_memory = false;
        self.device_use_hostalloc = false;
        self
    }

    /// Advise the driver that managed memory is mostly read
    pub fn set_read_only(mut self) -> Self {
        debug_assert!(
            self.device_use_managed_memory,
            "read-only advice requires managed memory"
        );
        self.device_set_readonly = true;
        self
    }

    /// Advise the driver to keep managed memory on the device
    pub fn set_preferred(mut self) -> Self {
        debug_assert!(
            self.device_use_managed_memory,
            "preferred-location advice requires managed memory"
        );
        self.device_set_preferred = true;
        self
    }

    /// Pinned host memory
    pub fn set_host_alloc(mut self) -> Self {
        self.device_use_hostalloc = true;
        self.device_use_managed_memory = false;
        self
    }

    /// Ordinary host memory
    pub fn set_cpu_memory(mut self) -> Self {
        self.use_cpu_memory = true;
        self.device_use_managed_memory = false;
        self.device_set_readonly = false;
        self.device_set_preferred = false;
        self.device_use_hostalloc = false;
        self
    }

    // The predicates below take `gpu`, the capability of the backend that
    // serves the arena. Without a GPU every arena is plain host memory.

    pub fn is_device_accessible(&self, gpu: bool) -> bool {
        gpu && !self.use_cpu_memory
    }

    pub fn is_host_accessible(&self, gpu: bool) -> bool {
        !gpu || self.use_cpu_memory || self.device_use_hostalloc || self.device_use_managed_memory
    }

    pub fn is_managed(&self, gpu: bool) -> bool {
        gpu && !self.use_cpu_memory
            && !self.device_use_hostalloc
            && self.device_use_managed_memory
    }

    pub fn is_device(&self, gpu: bool) -> bool {
        gpu && !self.use_cpu_memory
            && !self.device_use_hostalloc
            && !self.device_use_managed_memory
    }

    pub fn is_pinned(&self, gpu: bool) -> bool {
        gpu && !self.use_cpu_memory && self.device_use_hostalloc
    }
}
