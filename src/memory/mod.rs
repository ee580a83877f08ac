//! Memory arenas
//!
//! Every dynamic allocation in the runtime goes through an [`Arena`]. The
//! arenas differ in what they hand out (host, pinned, device or managed
//! memory) and in how they cache it:
//!
//! - [`CoalescingArena`]: best-fit over large system chunks, merging freed
//!   neighbours. The workhorse behind most slots.
//! - [`PoolArena`]: power-of-two size classes for short-lived buffers
//! - [`BasicArena`]: one system call per allocation, no caching
//! - [`NullArena`]: always returns null
//!
//! The [`registry`] module wires these into the named process-wide slots.

pub mod arena;
pub mod basic;
pub mod coalescing;
pub mod info;
pub mod null;
pub mod pool;
pub mod profiler;
pub mod registry;

pub use arena::{
    aligned_size, checked_aligned_size, is_aligned, same_arena, Arena, ArenaHandle, ArenaKind,
    ArenaUsage, ALIGN_SIZE,
};
pub use basic::{basic_arena, BasicArena};
pub use coalescing::{CoalescingArena, DEFAULT_HUNK_SIZE, MAX_HUNK_SIZE, MIN_SPLIT_SIZE};
pub use info::ArenaInfo;
pub use null::{null_arena, NullArena};
pub use pool::{size_class, PoolArena, MIN_CLASS_SIZE};
pub use profiler::{
    current_region, ArenaProfiler, MemStat, ProfileRegion, ProfilingObserver, TracingObserver,
    DEFAULT_REGION,
};
pub use registry::{ArenaRegistry, ArenaSlot, RegistryState};
