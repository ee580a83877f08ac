//! Size-class pool for short-lived asynchronous buffers
//!
//! Requests are rounded up to a power of two (at least [`MIN_CLASS_SIZE`]).
//! A freed block goes onto the stack of its class and is handed out again by
//! the next request of that class. There is no splitting and no coalescing, so
//! both `alloc` and `free` are O(1) amortized.
//!
//! On a device backend a class that does not fit in free device memory first
//! flushes the cache. If it still does not fit and the arena was built
//! [`with_oom_abort`](PoolArena::with_oom_abort), the request fails with
//! [`ArenaError::OutOfDeviceMemory`] instead of reaching the driver.

use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::arena::{too_large, Arena, ArenaKind, ArenaUsage};
use super::info::ArenaInfo;
use super::profiler::ArenaProfiler;
use crate::backend::{BackendHandle, HostBackend, MemoryBackend};
use crate::error::{ArenaError, ArenaResult};

/// Smallest size class
pub const MIN_CLASS_SIZE: usize = 256;

/// Size class serving a request of `nbytes`; `None` past the largest power of two
pub fn size_class(nbytes: usize) -> Option<usize> {
    nbytes.max(MIN_CLASS_SIZE).checked_next_power_of_two()
}

#[derive(Debug, Default)]
struct PoolState {
    /// Class size -> cached blocks, most recently freed last
    cached: BTreeMap<usize, Vec<usize>>,
    /// Live pointer -> class size
    live: HashMap<usize, usize>,
    usage: ArenaUsage,
}

/// Power-of-two pool arena
#[derive(Debug)]
pub struct PoolArena {
    info: ArenaInfo,
    backend: BackendHandle,
    state: Mutex<PoolState>,
    profiler: ArenaProfiler,
    abort_on_out_of_gpu_memory: bool,
}

impl PoolArena {
    /// Host-memory pool
    pub fn new(info: ArenaInfo) -> Self {
        Self::with_backend(info, Arc::new(HostBackend::new()))
    }

    pub fn with_backend(info: ArenaInfo, backend: BackendHandle) -> Self {
        PoolArena {
            info,
            backend,
            state: Mutex::new(PoolState::default()),
            profiler: ArenaProfiler::new(),
            abort_on_out_of_gpu_memory: false,
        }
    }

    /// Fail device requests larger than free device memory
    pub fn with_oom_abort(mut self, abort: bool) -> Self {
        self.abort_on_out_of_gpu_memory = abort;
        self
    }

    /// Number of cached blocks in `class`
    pub fn cached_blocks(&self, class: usize) -> usize {
        self.lock_state().cached.get(&class).map_or(0, Vec::len)
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_cached(&self, state: &mut PoolState) -> usize {
        let mut released = 0;
        for (class, blocks) in std::mem::take(&mut state.cached) {
            for addr in blocks {
                if let Some(p) = NonNull::new(addr as *mut u8) {
                    // Cached blocks came from allocate with their class size
                    unsafe { self.backend.deallocate(p, class, &self.info) };
                }
                state.usage.system_frees += 1;
                released += class;
            }
        }
        state.usage.heap_bytes -= released;
        state.usage.cached_bytes -= released;
        if released > 0 {
            tracing::debug!("PoolArena: released {} cached bytes", released);
        }
        released
    }
}

impl Default for PoolArena {
    fn default() -> Self {
        Self::new(ArenaInfo::default().set_cpu_memory())
    }
}

impl Arena for PoolArena {
    fn try_alloc(&self, nbytes: usize) -> ArenaResult<*mut u8> {
        let class = size_class(nbytes).ok_or_else(|| too_large(nbytes))?;
        let mut state = self.state.lock()?;

        let reused = state.cached.get_mut(&class).and_then(Vec::pop);
        let addr = match reused {
            Some(addr) => {
                state.usage.cached_bytes -= class;
                addr
            }
            None => {
                if self.is_device() {
                    let mut free = self.backend.free_mem_available();
                    if class >= free {
                        free = free.saturating_add(self.release_cached(&mut state));
                    }
                    if self.abort_on_out_of_gpu_memory && class >= free {
                        tracing::error!(
                            "PoolArena: out of device memory, free {} bytes, asked {} bytes",
                            free,
                            class
                        );
                        return Err(ArenaError::OutOfDeviceMemory {
                            free,
                            requested: class,
                        });
                    }
                }
                let p = self.backend.allocate(class, &self.info)?;
                state.usage.system_allocs += 1;
                state.usage.heap_bytes += class;
                state.usage.peak_heap_bytes = state.usage.peak_heap_bytes.max(state.usage.heap_bytes);
                p.as_ptr() as usize
            }
        };

        state.live.insert(addr, class);
        state.usage.used_bytes += class;
        state.usage.live_allocations += 1;
        state.usage.peak_used_bytes = state.usage.peak_used_bytes.max(state.usage.used_bytes);

        let p = addr as *mut u8;
        self.profiler.profile_alloc(p, class);
        Ok(p)
    }

    fn try_free(&self, p: *mut u8) -> ArenaResult<()> {
        if p.is_null() {
            return Ok(());
        }
        let addr = p as usize;
        {
            let mut state = self.state.lock()?;
            let class = state
                .live
                .remove(&addr)
                .ok_or(ArenaError::InvalidPointer(addr))?;
            state.usage.used_bytes -= class;
            state.usage.live_allocations -= 1;
            state.usage.cached_bytes += class;
            state.cached.entry(class).or_default().push(addr);
            self.profiler.profile_free(p);

            if state.usage.cached_bytes > self.info.release_threshold {
                self.release_cached(&mut state);
            }
        }
        Ok(())
    }

    fn arena_info(&self) -> &ArenaInfo {
        &self.info
    }

    fn kind(&self) -> ArenaKind {
        ArenaKind::Pool
    }

    fn profiler(&self) -> &ArenaProfiler {
        &self.profiler
    }

    fn gpu_backed(&self) -> bool {
        self.backend.has_gpu()
    }

    fn is_stream_ordered(&self) -> bool {
        self.gpu_backed()
    }

    fn free_unused(&self) -> usize {
        let mut state = self.lock_state();
        self.release_cached(&mut state)
    }

    fn usage(&self) -> Option<ArenaUsage> {
        Some(self.lock_state().usage)
    }
}

impl Drop for PoolArena {
    fn drop(&mut self) {
        let mut state = std::mem::take(self.state.get_mut().unwrap_or_else(PoisonError::into_inner));
        if !state.live.is_empty() {
            tracing::warn!("PoolArena dropped with {} live allocations", state.live.len());
        }
        self.release_cached(&mut state);
        for (addr, class) in state.live {
            if let Some(p) = NonNull::new(addr as *mut u8) {
                unsafe { self.backend.deallocate(p, class, &self.info) };
            }
        }
    }
}
