//! Per-arena allocation accounting
//!
//! Every arena embeds an [`ArenaProfiler`]. It does nothing until the arena
//! is registered under a memory name; from then on each allocation is charged
//! to the innermost [`ProfileRegion`] active on the allocating thread, and the
//! matching free is charged back to that same region no matter where or on
//! which thread it happens.
//!
//! External tools hook in through [`ProfilingObserver`].

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::{ArenaError, ArenaResult};

/// Region charged when no [`ProfileRegion`] is active
pub const DEFAULT_REGION: &str = "main";

thread_local! {
    static REGION_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Name of the innermost profiling region on this thread
pub fn current_region() -> String {
    REGION_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .cloned()
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    })
}

/// Scope guard naming the code region allocations are charged to
///
/// ```rust
/// use arenaforge::memory::ProfileRegion;
///
/// {
///     let _region = ProfileRegion::enter("FillBoundary");
///     // allocations here are charged to "FillBoundary"
/// }
/// ```
#[derive(Debug)]
pub struct ProfileRegion {
    name: String,
}

impl ProfileRegion {
    pub fn enter(name: impl Into<String>) -> Self {
        let name = name.into();
        REGION_STACK.with(|stack| stack.borrow_mut().push(name.clone()));
        ProfileRegion { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ProfileRegion {
    fn drop(&mut self) {
        REGION_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped.as_deref(), Some(self.name.as_str()));
        });
    }
}

/// Aggregate statistics for one region of one arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemStat {
    /// Number of allocations
    pub nalloc: u64,
    /// Number of frees
    pub nfree: u64,
    /// Bytes currently outstanding
    pub current_bytes: usize,
    /// High-water mark of `current_bytes`
    pub peak_bytes: usize,
    /// Bytes allocated over the lifetime of the registration
    pub total_bytes: u64,
}

impl MemStat {
    fn record_alloc(&mut self, nbytes: usize) {
        self.nalloc += 1;
        self.current_bytes += nbytes;
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
        self.total_bytes += nbytes as u64;
    }

    fn record_free(&mut self, nbytes: usize) {
        self.nfree += 1;
        self.current_bytes = self.current_bytes.saturating_sub(nbytes);
    }
}

/// Receives profiling events from registered arenas
///
/// Callbacks run while the profiler lock is held and must not call back into
/// the arena.
pub trait ProfilingObserver: Send + Sync {
    /// Return false to decline tracking for this arena
    fn register_arena(&self, _memory_name: &str) -> bool {
        true
    }

    fn deregister_arena(&self, _memory_name: &str) {}

    fn memory_alloc(&self, _memory_name: &str, _region: &str, _nbytes: usize) {}

    fn memory_free(&self, _memory_name: &str, _region: &str, _nbytes: usize) {}
}

/// Observer that emits every event at `trace` level
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ProfilingObserver for TracingObserver {
    fn memory_alloc(&self, memory_name: &str, region: &str, nbytes: usize) {
        tracing::trace!(arena = memory_name, region, nbytes, "profile alloc");
    }

    fn memory_free(&self, memory_name: &str, region: &str, nbytes: usize) {
        tracing::trace!(arena = memory_name, region, nbytes, "profile free");
    }
}

#[derive(Default)]
struct ProfilerState {
    memory_name: Option<String>,
    stats: BTreeMap<String, MemStat>,
    /// Live pointer -> (region, bytes)
    currently_allocated: HashMap<usize, (String, usize)>,
    observer: Option<Arc<dyn ProfilingObserver>>,
}

/// Mutex-guarded allocation accounting embedded in every arena
#[derive(Default)]
pub struct ArenaProfiler {
    do_profiling: AtomicBool,
    state: Mutex<ProfilerState>,
}

impl fmt::Debug for ArenaProfiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaProfiler")
            .field("do_profiling", &self.is_profiling())
            .field("memory_name", &self.memory_name())
            .finish()
    }
}

impl ArenaProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ProfilerState> {
        // Profiling state is plain data; a panic mid-update leaves it usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the observer notified on registration and on every event
    pub fn set_observer(&self, observer: Arc<dyn ProfilingObserver>) {
        self.state().observer = Some(observer);
    }

    pub fn is_profiling(&self) -> bool {
        self.do_profiling.load(Ordering::Acquire)
    }

    pub fn memory_name(&self) -> Option<String> {
        self.state().memory_name.clone()
    }

    /// Start tracking under `memory_name`
    pub fn register(&self, memory_name: &str) -> ArenaResult<()> {
        let mut state = self.state();
        if let Some(existing) = &state.memory_name {
            tracing::warn!(
                "Arena '{}' registered for profiling again as '{}'",
                existing,
                memory_name
            );
            return Err(ArenaError::ProfilingAlreadyRegistered(existing.clone()));
        }

        let accepted = state
            .observer
            .as_ref()
            .map_or(true, |obs| obs.register_arena(memory_name));
        if accepted {
            state.memory_name = Some(memory_name.to_string());
            self.do_profiling.store(true, Ordering::Release);
            tracing::debug!("Profiling enabled for '{}'", memory_name);
        }
        Ok(())
    }

    /// Stop tracking and drop all accumulated statistics
    pub fn deregister(&self) {
        let mut state = self.state();
        if let Some(name) = state.memory_name.take() {
            if let Some(obs) = &state.observer {
                obs.deregister_arena(&name);
            }
            tracing::debug!("Profiling disabled for '{}'", name);
        }
        state.stats.clear();
        state.currently_allocated.clear();
        self.do_profiling.store(false, Ordering::Release);
    }

    pub fn profile_alloc(&self, ptr: *const u8, nbytes: usize) {
        if !self.is_profiling() || ptr.is_null() {
            return;
        }
        let region = current_region();
        let mut state = self.state();
        let ProfilerState {
            memory_name,
            stats,
            currently_allocated,
            observer,
        } = &mut *state;
        let Some(name) = memory_name.as_deref() else {
            return;
        };

        stats.entry(region.clone()).or_default().record_alloc(nbytes);
        if let Some(obs) = observer {
            obs.memory_alloc(name, &region, nbytes);
        }
        currently_allocated.insert(ptr as usize, (region, nbytes));
    }

    pub fn profile_free(&self, ptr: *const u8) {
        if !self.is_profiling() || ptr.is_null() {
            return;
        }
        let mut state = self.state();
        let ProfilerState {
            memory_name,
            stats,
            currently_allocated,
            observer,
        } = &mut *state;

        // Pointers allocated before registration are not tracked
        let Some((region, nbytes)) = currently_allocated.remove(&(ptr as usize)) else {
            return;
        };
        if let Some(stat) = stats.get_mut(&region) {
            stat.record_free(nbytes);
        }
        if let (Some(name), Some(obs)) = (memory_name.as_deref(), observer) {
            obs.memory_free(name, &region, nbytes);
        }
    }

    /// Snapshot of per-region statistics
    pub fn stats(&self) -> BTreeMap<String, MemStat> {
        self.state().stats.clone()
    }

    pub fn region_stat(&self, region: &str) -> Option<MemStat> {
        self.state().stats.get(region).copied()
    }

    /// Number of tracked live pointers
    pub fn outstanding(&self) -> usize {
        self.state().currently_allocated.len()
    }
}

impl Drop for ArenaProfiler {
    fn drop(&mut self) {
        if self.is_profiling() {
            self.deregister();
        }
    }
}
