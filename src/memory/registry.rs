//! The seven process-wide arenas and their lifecycle
//!
//! [`ArenaRegistry`] owns the arenas behind the named slots (default, async,
//! device, managed, pinned, comms, cpu). Several slots may share one physical
//! arena; aliasing is always resolved by handle identity.
//!
//! Most code uses the process-wide registry through the free functions
//! [`initialize`], [`finalize`] and the `the_*_arena` accessors. Tests build
//! their own `ArenaRegistry` with an injected backend.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use serde::Serialize;

use super::arena::{same_arena, Arena, ArenaHandle, ArenaKind};
use super::basic::basic_arena;
use super::coalescing::CoalescingArena;
use super::info::ArenaInfo;
use super::null::null_arena;
use super::pool::PoolArena;
use super::profiler::ProfilingObserver;
use crate::backend::{default_backend, BackendHandle};
use crate::config::ArenaConfig;
use crate::error::{fatal, ArenaError, ArenaResult};

const MB: usize = 1024 * 1024;

/// Named logical arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArenaSlot {
    Default,
    Async,
    Device,
    Managed,
    Pinned,
    Comms,
    Cpu,
}

impl ArenaSlot {
    pub const ALL: [ArenaSlot; 7] = [
        ArenaSlot::Default,
        ArenaSlot::Async,
        ArenaSlot::Device,
        ArenaSlot::Managed,
        ArenaSlot::Pinned,
        ArenaSlot::Comms,
        ArenaSlot::Cpu,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Fixed-width label used in usage reports
    pub fn label(self) -> &'static str {
        match self {
            ArenaSlot::Default => "The         Arena",
            ArenaSlot::Async => "The   Async Arena",
            ArenaSlot::Device => "The  Device Arena",
            ArenaSlot::Managed => "The Managed Arena",
            ArenaSlot::Pinned => "The  Pinned Arena",
            ArenaSlot::Comms => "The   Comms Arena",
            ArenaSlot::Cpu => "The     Cpu Arena",
        }
    }
}

impl fmt::Display for ArenaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Registry lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegistryState {
    Uninitialized,
    Initialized,
    Finalized,
}

struct RegistryInner {
    state: RegistryState,
    slots: [Option<ArenaHandle>; 7],
    config: ArenaConfig,
    backend: Option<BackendHandle>,
}

impl RegistryInner {
    fn get(&self, slot: ArenaSlot) -> Option<&ArenaHandle> {
        self.slots[slot.index()].as_ref()
    }

    fn is(&self, a: ArenaSlot, b: ArenaSlot) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(x), Some(y)) => same_arena(x, y),
            _ => false,
        }
    }

    fn has_gpu(&self) -> bool {
        self.backend.as_ref().is_some_and(|b| b.has_gpu())
    }
}

/// Owner of the named arenas
pub struct ArenaRegistry {
    inner: Mutex<RegistryInner>,
    backend: Option<BackendHandle>,
    basic: ArenaHandle,
    observer: Option<Arc<dyn ProfilingObserver>>,
}

impl fmt::Debug for ArenaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaRegistry")
            .field("state", &self.state())
            .field("backend", &self.backend)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl Default for ArenaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaRegistry {
    /// Registry that detects its backend at initialization
    pub fn new() -> Self {
        ArenaRegistry {
            inner: Mutex::new(RegistryInner {
                state: RegistryState::Uninitialized,
                slots: Default::default(),
                config: ArenaConfig::default(),
                backend: None,
            }),
            backend: None,
            basic: basic_arena(),
            observer: None,
        }
    }

    /// Use `backend` instead of detecting one
    pub fn with_backend(mut self, backend: BackendHandle) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the process-wide BasicArena for the cpu and host-only slots
    pub fn with_basic_arena(mut self, basic: ArenaHandle) -> Self {
        self.basic = basic;
        self
    }

    /// Attach `observer` to every arena created by `initialize`
    pub fn with_observer(mut self, observer: Arc<dyn ProfilingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RegistryState {
        self.lock().state
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == RegistryState::Initialized
    }

    /// Configuration used by the last `initialize`
    pub fn config(&self) -> ArenaConfig {
        self.lock().config.clone()
    }

    /// Initialize from `ARENAFORGE_*` environment parameters
    pub fn initialize(&self, minimal: bool) -> ArenaResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.initialize_with(ArenaConfig::from_env()?, minimal)
    }

    /// Construct every slot; a no-op while already initialized
    pub fn initialize_with(&self, config: ArenaConfig, minimal: bool) -> ArenaResult<()> {
        let mut inner = self.lock();
        if inner.state == RegistryState::Initialized {
            tracing::debug!("Arena registry already initialized");
            return Ok(());
        }

        let backend = self.backend.clone().unwrap_or_else(default_backend);
        let gpu = backend.has_gpu();
        let device_total = gpu.then(|| backend.total_mem());
        tracing::info!(
            backend = backend.name(),
            gpu,
            minimal,
            "Initializing arena registry"
        );

        let mut slots: [Option<ArenaHandle>; 7] = Default::default();

        // Default
        let info = ArenaInfo::default().set_release_threshold(config.the_arena_release_threshold);
        let (info, name) = match (gpu, config.the_arena_is_managed) {
            (true, true) => (info.set_preferred(), "Managed Memory"),
            (true, false) => (info.set_device_memory(), "Device Memory"),
            (false, _) => (info.set_cpu_memory(), "Cpu Memory"),
        };
        let the_arena = self.coalescing(info, &backend, &config, name)?;
        let init = config.arena_init_size(device_total, minimal);
        pretouch(&the_arena, init)?;
        slots[ArenaSlot::Default.index()] = Some(Arc::clone(&the_arena));

        // Async
        let info = ArenaInfo::default().set_release_threshold(config.the_async_arena_release_threshold);
        let info = if gpu {
            info.set_device_memory()
        } else {
            info.set_cpu_memory()
        };
        let pool: ArenaHandle = Arc::new(
            PoolArena::with_backend(info, Arc::clone(&backend))
                .with_oom_abort(config.abort_on_out_of_gpu_memory),
        );
        self.register(&pool, "Async Memory")?;
        slots[ArenaSlot::Async.index()] = Some(pool);

        // Device
        let device = if !gpu {
            None
        } else if the_arena.is_device() {
            Some(Arc::clone(&the_arena))
        } else {
            let info = ArenaInfo::default()
                .set_device_memory()
                .set_release_threshold(config.the_device_arena_release_threshold);
            Some(self.coalescing(info, &backend, &config, "Device Memory")?)
        };
        slots[ArenaSlot::Device.index()] = device.clone();

        // Managed
        let managed = if !gpu {
            Arc::clone(&self.basic)
        } else if the_arena.is_managed() {
            Arc::clone(&the_arena)
        } else {
            let info = ArenaInfo::default()
                .set_release_threshold(config.the_managed_arena_release_threshold);
            self.coalescing(info, &backend, &config, "Managed Memory")?
        };
        slots[ArenaSlot::Managed.index()] = Some(Arc::clone(&managed));

        // Pinned
        let info = ArenaInfo::default()
            .set_host_alloc()
            .set_release_threshold(config.pinned_arena_release_threshold(device_total));
        let pinned = self.coalescing(info, &backend, &config, "Pinned Memory")?;
        slots[ArenaSlot::Pinned.index()] = Some(Arc::clone(&pinned));

        // Comms
        let comms = match (&device, gpu, config.use_gpu_aware_mpi) {
            (Some(device), true, true) if !the_arena.is_device() => Arc::clone(device),
            (_, true, true) => {
                let info = ArenaInfo::default()
                    .set_device_memory()
                    .set_release_threshold(config.the_comms_arena_release_threshold);
                self.coalescing(info, &backend, &config, "Comms Memory")?
            }
            (_, true, false) => Arc::clone(&pinned),
            (_, false, _) => Arc::clone(&self.basic),
        };
        slots[ArenaSlot::Comms.index()] = Some(Arc::clone(&comms));

        // Pre-touch the arenas that are not aliases of one already touched
        if let Some(device) = &device {
            if config.the_device_arena_init_size > 0 && !same_arena(device, &the_arena) {
                pretouch(device, config.the_device_arena_init_size)?;
            }
        }
        if config.the_managed_arena_init_size > 0
            && !same_arena(&managed, &the_arena)
            && managed.kind() != ArenaKind::Basic
        {
            pretouch(&managed, config.the_managed_arena_init_size)?;
        }
        pretouch(&pinned, config.pinned_arena_init_size(minimal))?;
        let comms_is_alias = same_arena(&comms, &the_arena)
            || device.as_ref().is_some_and(|d| same_arena(&comms, d))
            || same_arena(&comms, &pinned)
            || comms.kind() == ArenaKind::Basic;
        if config.the_comms_arena_init_size > 0 && !comms_is_alias {
            pretouch(&comms, config.the_comms_arena_init_size)?;
        }

        // Cpu
        slots[ArenaSlot::Cpu.index()] = Some(Arc::clone(&self.basic));
        if let Err(e) = self.basic.register_for_profiling("Cpu Memory") {
            tracing::debug!("BasicArena profiling registration kept: {}", e);
        }

        inner.slots = slots;
        inner.config = config;
        inner.backend = Some(backend);
        inner.state = RegistryState::Initialized;
        tracing::info!("Arena registry initialized");
        Ok(())
    }

    fn coalescing(
        &self,
        info: ArenaInfo,
        backend: &BackendHandle,
        config: &ArenaConfig,
        memory_name: &str,
    ) -> ArenaResult<ArenaHandle> {
        let arena: ArenaHandle = Arc::new(
            CoalescingArena::with_backend(info, Arc::clone(backend))
                .with_oom_abort(config.abort_on_out_of_gpu_memory),
        );
        self.register(&arena, memory_name)?;
        Ok(arena)
    }

    fn register(&self, arena: &ArenaHandle, memory_name: &str) -> ArenaResult<()> {
        if let Some(observer) = &self.observer {
            arena.profiler().set_observer(Arc::clone(observer));
        }
        arena.register_for_profiling(memory_name)
    }

    /// Release every arena not backed by the BasicArena
    pub fn finalize(&self) {
        let mut inner = self.lock();
        if inner.state != RegistryState::Initialized {
            return;
        }

        let threshold = if inner.has_gpu() { 0 } else { 1 };
        if inner.config.verbose > threshold {
            let mut out = io::stdout().lock();
            if let Err(e) = write_usage(&inner, &mut out, "") {
                tracing::warn!("Could not print arena usage: {}", e);
            }
        }

        let mut released: Vec<ArenaHandle> = Vec::new();
        for slot in ArenaSlot::ALL {
            let keep = inner
                .get(slot)
                .map_or(true, |h| h.kind() == ArenaKind::Basic);
            if keep {
                continue;
            }
            if let Some(handle) = inner.slots[slot.index()].take() {
                if !released.iter().any(|r| same_arena(r, &handle)) {
                    tracing::debug!("Releasing {} ({})", slot, handle.kind());
                    released.push(handle);
                }
            }
        }
        for handle in &released {
            if Arc::strong_count(handle) > 1 {
                tracing::debug!(
                    "{} still held by {} callers after finalize",
                    handle.kind(),
                    Arc::strong_count(handle) - 1
                );
            }
        }
        drop(released);

        self.basic.deregister_from_profiling();
        inner.state = RegistryState::Finalized;
        tracing::info!("Arena registry finalized");
    }

    /// Handle for `slot`; the NullArena when the slot is empty
    pub fn get(&self, slot: ArenaSlot) -> ArenaHandle {
        self.lock()
            .get(slot)
            .map(Arc::clone)
            .unwrap_or_else(null_arena)
    }

    pub fn the_arena(&self) -> ArenaHandle {
        self.get(ArenaSlot::Default)
    }

    pub fn the_async_arena(&self) -> ArenaHandle {
        self.get(ArenaSlot::Async)
    }

    pub fn the_device_arena(&self) -> ArenaHandle {
        self.get(ArenaSlot::Device)
    }

    pub fn the_managed_arena(&self) -> ArenaHandle {
        self.get(ArenaSlot::Managed)
    }

    pub fn the_pinned_arena(&self) -> ArenaHandle {
        self.get(ArenaSlot::Pinned)
    }

    pub fn the_comms_arena(&self) -> ArenaHandle {
        self.get(ArenaSlot::Comms)
    }

    pub fn the_cpu_arena(&self) -> ArenaHandle {
        self.get(ArenaSlot::Cpu)
    }

    /// Whether two slots hold the same physical arena
    pub fn is_alias(&self, a: ArenaSlot, b: ArenaSlot) -> bool {
        self.lock().is(a, b)
    }

    /// Write the usage report to stdout
    pub fn print_usage(&self) -> ArenaResult<()> {
        let inner = self.lock();
        let mut out = io::stdout().lock();
        write_usage(&inner, &mut out, "")?;
        Ok(())
    }

    /// Append `message` and the usage report to `<filename>.<rank>`
    pub fn print_usage_to_files(&self, filename: &str, message: &str) -> ArenaResult<()> {
        let inner = self.lock();
        let path = PathBuf::from(format!("{}.{}", filename, inner.config.rank));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ArenaError::UsageFileOpen {
                path: path.clone(),
                source,
            })?;

        writeln!(file, "{}", message)?;
        write_usage(&inner, &mut file, "    ")?;
        writeln!(file)?;
        tracing::debug!("Arena usage appended to {}", path.display());
        Ok(())
    }
}

impl Drop for ArenaRegistry {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.finalize();
        }
    }
}

fn pretouch(arena: &ArenaHandle, nbytes: usize) -> ArenaResult<()> {
    if nbytes == 0 {
        return Ok(());
    }
    let p = arena.try_alloc(nbytes)?;
    arena.try_free(p)?;
    tracing::debug!("Pre-touched {} with {} bytes", arena.kind(), nbytes);
    Ok(())
}

/// Slots listed in usage reports, skipping aliases
fn reported_slots(inner: &RegistryInner) -> Vec<ArenaSlot> {
    use ArenaSlot::*;
    let mut slots = vec![Default];
    if !inner.is(Device, Default) {
        slots.push(Device);
    }
    if !inner.is(Managed, Default) {
        slots.push(Managed);
    }
    slots.push(Pinned);
    if !inner.is(Comms, Device) && !inner.is(Comms, Pinned) {
        slots.push(Comms);
    }
    slots
}

fn write_usage(inner: &RegistryInner, out: &mut dyn Write, indent: &str) -> io::Result<()> {
    if let Some(backend) = inner.backend.as_ref().filter(|b| b.has_gpu()) {
        writeln!(
            out,
            "{}Total GPU global memory (MB): {}",
            indent,
            backend.total_mem() / MB
        )?;
        writeln!(
            out,
            "{}Free  GPU global memory (MB): {}",
            indent,
            backend.free_mem_available() / MB
        )?;
    }

    for slot in reported_slots(inner) {
        let Some(handle) = inner.get(slot) else {
            continue;
        };
        if handle.kind() != ArenaKind::Coalescing {
            continue;
        }
        let Some(usage) = handle.usage() else {
            continue;
        };
        let label = slot.label();
        writeln!(
            out,
            "{}[{}] space allocated (MB): {}",
            indent,
            label,
            usage.heap_bytes / MB
        )?;
        writeln!(
            out,
            "{}[{}] space used      (MB): {}",
            indent,
            label,
            usage.used_bytes / MB
        )?;
        writeln!(
            out,
            "{}[{}] max space allocated (MB): {}",
            indent,
            label,
            usage.peak_heap_bytes / MB
        )?;
        writeln!(
            out,
            "{}[{}] max space used      (MB): {}",
            indent,
            label,
            usage.peak_used_bytes / MB
        )?;
        writeln!(
            out,
            "{}[{}] live allocations: {}",
            indent, label, usage.live_allocations
        )?;
    }
    Ok(())
}

static REGISTRY: Lazy<ArenaRegistry> = Lazy::new(ArenaRegistry::new);

/// The process-wide registry
pub fn registry() -> &'static ArenaRegistry {
    &REGISTRY
}

/// Initialize the process-wide arenas; failure terminates the rank
pub fn initialize(minimal: bool) {
    if let Err(e) = REGISTRY.initialize(minimal) {
        fatal(e);
    }
}

/// Initialize the process-wide arenas with an explicit configuration
pub fn initialize_with(config: ArenaConfig, minimal: bool) {
    if let Err(e) = REGISTRY.initialize_with(config, minimal) {
        fatal(e);
    }
}

pub fn finalize() {
    REGISTRY.finalize();
}

pub fn is_initialized() -> bool {
    REGISTRY.is_initialized()
}

pub fn print_usage() {
    if let Err(e) = REGISTRY.print_usage() {
        fatal(e);
    }
}

/// Append usage to the per-rank file; an unopenable file terminates the rank
pub fn print_usage_to_files(filename: &str, message: &str) {
    if let Err(e) = REGISTRY.print_usage_to_files(filename, message) {
        fatal(e);
    }
}

pub fn the_arena() -> ArenaHandle {
    REGISTRY.the_arena()
}

pub fn the_async_arena() -> ArenaHandle {
    REGISTRY.the_async_arena()
}

pub fn the_device_arena() -> ArenaHandle {
    REGISTRY.the_device_arena()
}

pub fn the_managed_arena() -> ArenaHandle {
    REGISTRY.the_managed_arena()
}

pub fn the_pinned_arena() -> ArenaHandle {
    REGISTRY.the_pinned_arena()
}

pub fn the_comms_arena() -> ArenaHandle {
    REGISTRY.the_comms_arena()
}

pub fn the_cpu_arena() -> ArenaHandle {
    REGISTRY.the_cpu_arena()
}
