//! Pass-through arena over the host allocator

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use super::arena::{request_size, Arena, ArenaHandle, ArenaKind, ArenaUsage, ALIGN_SIZE};
use super::info::ArenaInfo;
use super::profiler::ArenaProfiler;
use crate::backend::{HostBackend, MemoryBackend};
use crate::error::{ArenaError, ArenaResult};

// Never dropped: objects that outlive finalize can still be freed through it
static BASIC_ARENA: Lazy<ArenaHandle> =
    Lazy::new(|| Arc::new(BasicArena::new(ArenaInfo::default().set_cpu_memory())));

/// The process-wide host arena
pub fn basic_arena() -> ArenaHandle {
    Arc::clone(&BASIC_ARENA)
}

#[derive(Debug, Default)]
struct BasicState {
    /// Live pointer -> requested size
    live: HashMap<usize, usize>,
    usage: ArenaUsage,
}

/// Every `alloc` is one host allocation and every `free` returns it
///
/// No caching. With a host-alloc [`ArenaInfo`] the pages are locked in RAM
/// and unlocked on free.
#[derive(Debug)]
pub struct BasicArena {
    info: ArenaInfo,
    backend: HostBackend,
    state: Mutex<BasicState>,
    profiler: ArenaProfiler,
}

impl BasicArena {
    pub fn new(info: ArenaInfo) -> Self {
        BasicArena {
            info,
            backend: HostBackend::new(),
            state: Mutex::new(BasicState::default()),
            profiler: ArenaProfiler::new(),
        }
    }
}

impl Default for BasicArena {
    fn default() -> Self {
        Self::new(ArenaInfo::default().set_cpu_memory())
    }
}

impl Arena for BasicArena {
    fn try_alloc(&self, nbytes: usize) -> ArenaResult<*mut u8> {
        let nbytes = request_size(nbytes)?;
        let p = self.backend.allocate(nbytes, &self.info)?;
        let addr = p.as_ptr() as usize;
        debug_assert_eq!(addr % ALIGN_SIZE, 0);

        {
            let mut state = self.state.lock()?;
            state.live.insert(addr, nbytes);
            let usage = &mut state.usage;
            usage.system_allocs += 1;
            usage.live_allocations += 1;
            usage.used_bytes += nbytes;
            usage.heap_bytes += nbytes;
            usage.peak_used_bytes = usage.peak_used_bytes.max(usage.used_bytes);
            usage.peak_heap_bytes = usage.peak_heap_bytes.max(usage.heap_bytes);
            self.profiler.profile_alloc(p.as_ptr(), nbytes);
        }
        Ok(p.as_ptr())
    }

    fn try_free(&self, p: *mut u8) -> ArenaResult<()> {
        let Some(nn) = NonNull::new(p) else {
            return Ok(());
        };
        let addr = p as usize;
        let nbytes = {
            let mut state = self.state.lock()?;
            let nbytes = state
                .live
                .remove(&addr)
                .ok_or(ArenaError::InvalidPointer(addr))?;
            let usage = &mut state.usage;
            usage.system_frees += 1;
            usage.live_allocations -= 1;
            usage.used_bytes -= nbytes;
            usage.heap_bytes -= nbytes;
            self.profiler.profile_free(p);
            nbytes
        };

        // Removed from the live map above, so this pointer came from allocate
        unsafe { self.backend.deallocate(nn, nbytes, &self.info) };
        Ok(())
    }

    fn arena_info(&self) -> &ArenaInfo {
        &self.info
    }

    fn kind(&self) -> ArenaKind {
        ArenaKind::Basic
    }

    fn profiler(&self) -> &ArenaProfiler {
        &self.profiler
    }

    fn usage(&self) -> Option<ArenaUsage> {
        self.state.lock().ok().map(|s| s.usage)
    }
}

impl Drop for BasicArena {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.live.is_empty() {
            tracing::warn!(
                "BasicArena dropped with {} live allocations; leaking them",
                state.live.len()
            );
        }
    }
}
