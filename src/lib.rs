//! arenaforge - memory arenas for AMR simulation runtimes
//!
//! A polymorphic allocator layer that serves every dynamic allocation of a
//! simulation from one of several pools: ordinary host memory, page-locked
//! host memory, GPU device memory, GPU managed memory and a dedicated
//! communications pool. On AMD GPUs the `rocm` feature links the HIP runtime;
//! without it (or without a device) every pool is host memory.
//!
//! ```rust
//! use arenaforge::{ArenaConfig, Arena};
//!
//! arenaforge::initialize_with(ArenaConfig::default().with_verbose(0), true);
//! let arena = arenaforge::the_arena();
//! let p = arena.alloc(4096);
//! arena.free(p);
//! arenaforge::finalize();
//! ```

#![allow(clippy::missing_safety_doc)] // FFI bindings documented at module level

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;

pub use backend::{default_backend, BackendHandle, HostBackend, MemoryBackend};
pub use config::{ArenaConfig, EnvParams, LayeredParams, ParamSource, ParamTable};
pub use error::{ArenaError, ArenaResult, ErrorCategory};
pub use memory::registry::{
    finalize, initialize, initialize_with, is_initialized, print_usage, print_usage_to_files,
    registry, the_arena, the_async_arena, the_comms_arena, the_cpu_arena, the_device_arena,
    the_managed_arena, the_pinned_arena,
};
pub use memory::{
    Arena, ArenaHandle, ArenaInfo, ArenaKind, ArenaRegistry, ArenaSlot, ArenaUsage, BasicArena,
    CoalescingArena, NullArena, PoolArena, ProfileRegion, ALIGN_SIZE,
};
