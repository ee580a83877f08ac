//! Best-fit coalescing arena
//!
//! Memory is obtained from the backend in large chunks ("hunks") and carved
//! into blocks. Free blocks live in two indices: by address, for merging with
//! neighbours, and by `(size, address)`, for best-fit lookup. Blocks never
//! merge across chunk boundaries, so a chunk whose single block is free can be
//! handed back to the system intact.
//!
//! # Example
//!
//! ```rust
//! use arenaforge::memory::{Arena, ArenaInfo, CoalescingArena};
//!
//! let arena = CoalescingArena::new(ArenaInfo::default().set_cpu_memory());
//! let a = arena.alloc(1024);
//! let b = arena.alloc(2048);
//! arena.free(a);
//! arena.free(b);
//! // a and b coalesced; no new chunk is needed
//! let c = arena.alloc(3072);
//! assert_eq!(arena.usage().unwrap().system_allocs, 1);
//! arena.free(c);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::arena::{reject, request_size, Arena, ArenaKind, ArenaUsage};
use super::info::ArenaInfo;
use super::profiler::ArenaProfiler;
use crate::backend::{BackendHandle, HostBackend, MemoryBackend};
use crate::error::{ArenaError, ArenaResult};

/// Smallest tail worth splitting off a block
pub const MIN_SPLIT_SIZE: usize = 64;

/// Default size of the first chunk requested from the system
pub const DEFAULT_HUNK_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound on geometric chunk growth
pub const MAX_HUNK_SIZE: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    size: usize,
    /// Base address of the owning chunk
    chunk: usize,
    free: bool,
}

#[derive(Debug)]
struct State {
    /// Every block, keyed by address
    blocks: BTreeMap<usize, Block>,
    /// Free blocks as (size, address)
    free_by_size: BTreeSet<(usize, usize)>,
    /// Chunk base -> chunk size
    chunks: BTreeMap<usize, usize>,
    hunk: usize,
    usage: ArenaUsage,
}

impl State {
    fn new(hunk: usize) -> Self {
        State {
            blocks: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            chunks: BTreeMap::new(),
            hunk,
            usage: ArenaUsage::default(),
        }
    }

    fn insert_free(&mut self, addr: usize, size: usize, chunk: usize) {
        self.blocks.insert(
            addr,
            Block {
                size,
                chunk,
                free: true,
            },
        );
        self.free_by_size.insert((size, addr));
    }

    /// Best fit; ties go to the lowest address
    fn take_best_fit(&mut self, nbytes: usize) -> Option<usize> {
        let &(size, addr) = self.free_by_size.range((nbytes, 0)..).next()?;
        self.free_by_size.remove(&(size, addr));

        let block = self.blocks.get_mut(&addr)?;
        block.free = false;
        let chunk = block.chunk;
        let mut taken = size;
        if size - nbytes >= MIN_SPLIT_SIZE {
            block.size = nbytes;
            taken = nbytes;
            self.insert_free(addr + nbytes, size - nbytes, chunk);
        }

        self.usage.used_bytes += taken;
        self.usage.cached_bytes -= taken;
        self.usage.live_allocations += 1;
        self.usage.peak_used_bytes = self.usage.peak_used_bytes.max(self.usage.used_bytes);
        Some(addr)
    }

    /// Mark the block at `addr` free and merge it with free neighbours
    fn release_block(&mut self, addr: usize) -> ArenaResult<usize> {
        let block = match self.blocks.get(&addr) {
            Some(b) if b.free => return Err(ArenaError::DoubleFree(addr)),
            Some(b) => *b,
            None => return Err(ArenaError::InvalidPointer(addr)),
        };

        self.usage.used_bytes -= block.size;
        self.usage.cached_bytes += block.size;
        self.usage.live_allocations -= 1;

        let mut start = addr;
        let mut size = block.size;

        let next_addr = addr + block.size;
        if let Some(next) = self.blocks.get(&next_addr).copied() {
            if next.free && next.chunk == block.chunk {
                self.free_by_size.remove(&(next.size, next_addr));
                self.blocks.remove(&next_addr);
                size += next.size;
            }
        }

        let prev = self
            .blocks
            .range(..addr)
            .next_back()
            .map(|(&a, &b)| (a, b));
        if let Some((prev_addr, prev)) = prev {
            if prev.free && prev.chunk == block.chunk && prev_addr + prev.size == addr {
                self.free_by_size.remove(&(prev.size, prev_addr));
                self.blocks.remove(&addr);
                start = prev_addr;
                size += prev.size;
            }
        }

        self.insert_free(start, size, block.chunk);
        Ok(block.size)
    }

    /// Chunks whose only block is free
    fn whole_free_chunks(&self) -> Vec<(usize, usize)> {
        self.chunks
            .iter()
            .filter(|&(base, size)| {
                self.blocks
                    .get(base)
                    .is_some_and(|b| b.free && b.size == *size)
            })
            .map(|(&base, &size)| (base, size))
            .collect()
    }
}

/// Best-fit allocator that caches and coalesces freed memory
#[derive(Debug)]
pub struct CoalescingArena {
    info: ArenaInfo,
    backend: BackendHandle,
    abort_on_out_of_gpu_memory: bool,
    state: Mutex<State>,
    profiler: ArenaProfiler,
}

impl CoalescingArena {
    /// Host-memory arena with the default hunk size
    pub fn new(info: ArenaInfo) -> Self {
        Self::with_backend(info, std::sync::Arc::new(HostBackend::new()))
    }

    pub fn with_backend(info: ArenaInfo, backend: BackendHandle) -> Self {
        CoalescingArena {
            info,
            backend,
            abort_on_out_of_gpu_memory: false,
            state: Mutex::new(State::new(DEFAULT_HUNK_SIZE)),
            profiler: ArenaProfiler::new(),
        }
    }

    /// Size of the first chunk; later chunks double up to [`MAX_HUNK_SIZE`]
    pub fn with_hunk_size(self, hunk: usize) -> Self {
        let hunk = self.align(hunk.clamp(1, MAX_HUNK_SIZE));
        {
            let mut state = self.lock_state();
            state.hunk = hunk;
        }
        self
    }

    /// Fail allocations that would exceed free device memory
    pub fn with_oom_abort(mut self, abort: bool) -> Self {
        self.abort_on_out_of_gpu_memory = abort;
        self
    }

    pub fn hunk_size(&self) -> usize {
        self.lock_state().hunk
    }

    /// Number of system chunks currently held
    pub fn chunk_count(&self) -> usize {
        self.lock_state().chunks.len()
    }

    /// Number of free blocks across all chunks
    pub fn free_block_count(&self) -> usize {
        self.lock_state().free_by_size.len()
    }

    /// Size of the largest free block
    pub fn largest_free_block(&self) -> usize {
        self.lock_state()
            .free_by_size
            .iter()
            .next_back()
            .map_or(0, |&(size, _)| size)
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device and managed arenas on a GPU must check free device memory
    fn checks_device_memory(&self) -> bool {
        let gpu = self.backend.has_gpu();
        self.info.is_device(gpu) || self.info.is_managed(gpu)
    }

    /// Request a new chunk big enough for `nbytes`
    fn grow(&self, state: &mut State, nbytes: usize) -> ArenaResult<()> {
        let mut chunk = nbytes.max(state.hunk);

        if self.checks_device_memory() {
            let mut free = self.backend.free_mem_available();
            if chunk >= free && chunk > nbytes {
                tracing::debug!(
                    "CoalescingArena: hunk of {} bytes exceeds free device memory {}, asking for {}",
                    chunk,
                    free,
                    nbytes
                );
                chunk = nbytes;
            }
            if chunk >= free {
                free = free.saturating_add(self.release_free_chunks(state));
                if self.abort_on_out_of_gpu_memory && chunk >= free {
                    tracing::error!(
                        "CoalescingArena: out of gpu memory. Free: {} Asked: {}",
                        free,
                        chunk
                    );
                    return Err(ArenaError::OutOfDeviceMemory {
                        free,
                        requested: chunk,
                    });
                }
            }
        }

        let p = self.backend.allocate(chunk, &self.info)?;
        let base = p.as_ptr() as usize;
        state.chunks.insert(base, chunk);
        state.insert_free(base, chunk, base);

        let usage = &mut state.usage;
        usage.system_allocs += 1;
        usage.heap_bytes += chunk;
        usage.cached_bytes += chunk;
        usage.peak_heap_bytes = usage.peak_heap_bytes.max(usage.heap_bytes);

        state.hunk = state.hunk.saturating_mul(2).min(MAX_HUNK_SIZE);
        tracing::debug!(
            "CoalescingArena: new chunk of {} bytes at {:#x} ({} chunks, next hunk {})",
            chunk,
            base,
            state.chunks.len(),
            state.hunk
        );
        Ok(())
    }

    /// Return every wholly free chunk to the system
    fn release_free_chunks(&self, state: &mut State) -> usize {
        let mut released = 0;
        for (base, size) in state.whole_free_chunks() {
            state.free_by_size.remove(&(size, base));
            state.blocks.remove(&base);
            state.chunks.remove(&base);
            if let Some(p) = NonNull::new(base as *mut u8) {
                // The chunk came from allocate with exactly this size
                unsafe { self.backend.deallocate(p, size, &self.info) };
            }
            state.usage.system_frees += 1;
            state.usage.heap_bytes -= size;
            state.usage.cached_bytes -= size;
            released += size;
        }
        if released > 0 {
            tracing::debug!("CoalescingArena: released {} bytes to the system", released);
        }
        released
    }

    fn try_alloc_in_place(
        &self,
        p: *mut u8,
        szmin: usize,
        szmax: usize,
    ) -> ArenaResult<Option<(*mut u8, usize)>> {
        let szmin = request_size(szmin)?;
        let szmax = request_size(szmax.max(szmin))?;
        let addr = p as usize;

        let mut state = self.state.lock()?;
        let block = match state.blocks.get(&addr) {
            Some(b) if !b.free => *b,
            Some(_) => return Err(ArenaError::DoubleFree(addr)),
            None => return Err(ArenaError::InvalidPointer(addr)),
        };
        if block.size >= szmax {
            return Ok(Some((p, block.size)));
        }

        let next_addr = addr + block.size;
        let next = state
            .blocks
            .get(&next_addr)
            .copied()
            .filter(|n| n.free && n.chunk == block.chunk);
        if let Some(next) = next {
            let total = block.size + next.size;
            if total >= szmin {
                let new_size = if total >= szmax { szmax } else { total };
                let grown = new_size - block.size;

                state.free_by_size.remove(&(next.size, next_addr));
                state.blocks.remove(&next_addr);
                let remainder = total - new_size;
                if remainder > 0 {
                    state.insert_free(addr + new_size, remainder, block.chunk);
                }
                if let Some(b) = state.blocks.get_mut(&addr) {
                    b.size = new_size;
                }

                state.usage.used_bytes += grown;
                state.usage.cached_bytes -= grown;
                state.usage.peak_used_bytes =
                    state.usage.peak_used_bytes.max(state.usage.used_bytes);
                self.profiler.profile_free(p);
                self.profiler.profile_alloc(p, new_size);
                drop(state);

                tracing::trace!(
                    "CoalescingArena: grew {:#x} in place from {} to {} bytes",
                    addr,
                    block.size,
                    new_size
                );
                return Ok(Some((p, new_size)));
            }
        }

        if block.size >= szmin {
            return Ok(Some((p, block.size)));
        }
        Ok(None)
    }

    fn try_shrink_in_place(&self, p: *mut u8, nbytes: usize) -> ArenaResult<*mut u8> {
        let nbytes = request_size(nbytes)?;
        let addr = p as usize;

        let mut state = self.state.lock()?;
        let block = match state.blocks.get(&addr) {
            Some(b) if !b.free => *b,
            Some(_) => return Err(ArenaError::DoubleFree(addr)),
            None => return Err(ArenaError::InvalidPointer(addr)),
        };
        if nbytes > block.size {
            tracing::error!(
                "CoalescingArena: cannot shrink a {}-byte block to {} bytes",
                block.size,
                nbytes
            );
            debug_assert!(false, "shrink_in_place to a larger size");
            return Ok(p);
        }
        if nbytes == block.size {
            return Ok(p);
        }

        let mut leftover = block.size - nbytes;
        let tail = addr + nbytes;
        let next_addr = addr + block.size;
        if let Some(next) = state.blocks.get(&next_addr).copied() {
            if next.free && next.chunk == block.chunk {
                state.free_by_size.remove(&(next.size, next_addr));
                state.blocks.remove(&next_addr);
                leftover += next.size;
            }
        }
        state.insert_free(tail, leftover, block.chunk);
        if let Some(b) = state.blocks.get_mut(&addr) {
            b.size = nbytes;
        }

        let shrunk = block.size - nbytes;
        state.usage.used_bytes -= shrunk;
        state.usage.cached_bytes += shrunk;
        self.profiler.profile_free(p);
        self.profiler.profile_alloc(p, nbytes);
        Ok(p)
    }
}

impl Default for CoalescingArena {
    fn default() -> Self {
        Self::new(ArenaInfo::default().set_cpu_memory())
    }
}

impl Arena for CoalescingArena {
    fn try_alloc(&self, nbytes: usize) -> ArenaResult<*mut u8> {
        let nbytes = request_size(nbytes)?;
        // Profiling stays under the arena lock so a recycled address cannot
        // be recorded before its previous owner's free
        let addr = {
            let mut state = self.state.lock()?;
            let addr = match state.take_best_fit(nbytes) {
                Some(addr) => addr,
                None => {
                    self.grow(&mut state, nbytes)?;
                    state.take_best_fit(nbytes).ok_or_else(|| {
                        ArenaError::SystemAllocationFailed {
                            requested: nbytes,
                            reason: "new chunk cannot hold the request".to_string(),
                        }
                    })?
                }
            };
            self.profiler.profile_alloc(addr as *const u8, nbytes);
            addr
        };

        let p = addr as *mut u8;
        tracing::trace!("CoalescingArena: {} bytes at {:#x}", nbytes, addr);
        Ok(p)
    }

    fn try_free(&self, p: *mut u8) -> ArenaResult<()> {
        if p.is_null() {
            return Ok(());
        }

        {
            let mut state = self.state.lock()?;
            state.release_block(p as usize)?;
            self.profiler.profile_free(p);
            if state.usage.cached_bytes > self.info.release_threshold {
                self.release_free_chunks(&mut state);
            }
        }
        Ok(())
    }

    fn arena_info(&self) -> &ArenaInfo {
        &self.info
    }

    fn kind(&self) -> ArenaKind {
        ArenaKind::Coalescing
    }

    fn profiler(&self) -> &ArenaProfiler {
        &self.profiler
    }

    fn gpu_backed(&self) -> bool {
        self.backend.has_gpu()
    }

    fn alloc_in_place(&self, p: *mut u8, szmin: usize, szmax: usize) -> (*mut u8, usize) {
        if p.is_null() {
            return (self.alloc(szmax), szmax);
        }
        match self.try_alloc_in_place(p, szmin, szmax) {
            Ok(Some(grown)) => grown,
            Ok(None) => (self.alloc(szmax), szmax),
            Err(e) => {
                reject(e);
                (self.alloc(szmax), szmax)
            }
        }
    }

    /// Shrinking to zero keeps one alignment unit, as `alloc(0)` does
    fn shrink_in_place(&self, p: *mut u8, nbytes: usize) -> *mut u8 {
        if p.is_null() {
            return std::ptr::null_mut();
        }
        match self.try_shrink_in_place(p, nbytes) {
            Ok(p) => p,
            Err(e) => {
                reject(e);
                std::ptr::null_mut()
            }
        }
    }

    fn free_unused(&self) -> usize {
        let mut state = self.lock_state();
        self.release_free_chunks(&mut state)
    }

    fn has_free_device_memory(&self, nbytes: usize) -> bool {
        if !self.checks_device_memory() {
            return true;
        }
        let mut state = self.lock_state();
        let mut free = self.backend.free_mem_available();
        if nbytes >= free {
            free = free.saturating_add(self.release_free_chunks(&mut state));
        }
        nbytes < free
    }

    fn usage(&self) -> Option<ArenaUsage> {
        Some(self.lock_state().usage)
    }
}

impl Drop for CoalescingArena {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.usage.live_allocations > 0 {
            tracing::warn!(
                "CoalescingArena dropped with {} live allocations ({} bytes)",
                state.usage.live_allocations,
                state.usage.used_bytes
            );
        }
        for (&base, &size) in &state.chunks {
            if let Some(p) = NonNull::new(base as *mut u8) {
                // Every chunk came from allocate with exactly this size
                unsafe { self.backend.deallocate(p, size, &self.info) };
            }
        }
        state.chunks.clear();
        state.blocks.clear();
        state.free_by_size.clear();
    }
}
