//! Registry layout, lifecycle and reporting tests
//!
//! Most tests build a private `ArenaRegistry` with an injected backend. Tests
//! touching the process-wide registry are `#[serial]`.

mod common;

use std::sync::{Arc, Mutex};

use arenaforge::memory::{
    same_arena, Arena, ArenaKind, ArenaRegistry, ArenaSlot, BasicArena, ProfileRegion,
    ProfilingObserver, RegistryState,
};
use arenaforge::{ArenaConfig, ArenaError, HostBackend};
use common::{
    create_temp_dir, read_usage_file, serial, usage_file_base, usage_file_for_rank,
    SimulatedGpuBackend, MB,
};

fn host_registry() -> ArenaRegistry {
    ArenaRegistry::new()
        .with_backend(Arc::new(HostBackend::new()))
        .with_basic_arena(Arc::new(BasicArena::default()))
}

fn gpu_registry(gpu: &Arc<SimulatedGpuBackend>) -> ArenaRegistry {
    ArenaRegistry::new()
        .with_backend(gpu.clone())
        .with_basic_arena(Arc::new(BasicArena::default()))
}

fn quiet() -> ArenaConfig {
    ArenaConfig::default().with_verbose(0)
}

#[derive(Default)]
struct RecordingObserver {
    registered: Mutex<Vec<String>>,
    deregistered: Mutex<Vec<String>>,
    regions: Mutex<Vec<(String, String, usize)>>,
}

impl ProfilingObserver for RecordingObserver {
    fn register_arena(&self, memory_name: &str) -> bool {
        self.registered.lock().unwrap().push(memory_name.to_string());
        true
    }

    fn deregister_arena(&self, memory_name: &str) {
        self.deregistered.lock().unwrap().push(memory_name.to_string());
    }

    fn memory_alloc(&self, memory_name: &str, region: &str, nbytes: usize) {
        self.regions
            .lock()
            .unwrap()
            .push((memory_name.to_string(), region.to_string(), nbytes));
    }
}

#[test]
fn test_pretouched_default_arena_serves_small_allocations() {
    let registry = host_registry();
    let config = quiet()
        .with_arena_init_size(1048576)
        .with_pinned_arena_init_size(0);
    registry.initialize_with(config, false).unwrap();

    let arena = registry.the_arena();
    assert_eq!(arena.kind(), ArenaKind::Coalescing);
    let before = arena.usage().unwrap().system_allocs;
    assert_eq!(before, 1);

    let ptrs: Vec<_> = [64, 1000, 4096, 100_000].iter().map(|&n| arena.alloc(n)).collect();
    assert_eq!(arena.usage().unwrap().system_allocs, before);
    for p in ptrs {
        arena.free(p);
    }
    assert_eq!(arena.usage().unwrap().live_allocations, 0);
}

#[test]
fn test_initialize_is_idempotent() {
    let registry = host_registry();
    registry.initialize_with(quiet().with_arena_init_size(MB), true).unwrap();
    let first = registry.the_arena();

    registry
        .initialize_with(quiet().with_arena_init_size(4 * MB), true)
        .unwrap();
    assert!(same_arena(&first, &registry.the_arena()));
    assert_eq!(registry.config().the_arena_init_size, Some(MB));
}

#[test]
fn test_minimal_run_skips_pinned_pretouch() {
    let registry = host_registry();
    registry.initialize_with(quiet().with_arena_init_size(MB), true).unwrap();
    let pinned = registry.the_pinned_arena();
    assert_eq!(pinned.usage().unwrap().system_allocs, 0);
    registry.finalize();

    let registry = host_registry();
    registry.initialize_with(quiet().with_arena_init_size(MB), false).unwrap();
    assert_eq!(registry.the_pinned_arena().usage().unwrap().system_allocs, 1);
}

#[test]
fn test_gpu_default_is_device_memory() {
    let gpu = SimulatedGpuBackend::with_total_mb(256);
    let registry = gpu_registry(&gpu);
    let config = quiet()
        .with_arena_init_size(MB)
        .with_managed_arena_init_size(0);
    registry.initialize_with(config, false).unwrap();

    let the_arena = registry.the_arena();
    assert!(the_arena.is_device());
    assert!(registry.is_alias(ArenaSlot::Device, ArenaSlot::Default));
    assert!(!registry.is_alias(ArenaSlot::Managed, ArenaSlot::Default));
    assert!(registry.the_managed_arena().is_managed());
    assert!(registry.the_pinned_arena().is_pinned());
    assert!(registry.the_async_arena().is_stream_ordered());
    assert!(registry.the_cpu_arena().is_host_accessible());

    // Without GPU-aware MPI comms buffers are pinned
    assert!(registry.is_alias(ArenaSlot::Comms, ArenaSlot::Pinned));
}

#[test]
fn test_gpu_managed_default() {
    let gpu = SimulatedGpuBackend::with_total_mb(256);
    let registry = gpu_registry(&gpu);
    let config = quiet()
        .with_arena_init_size(MB)
        .with_device_arena_init_size(2 * MB)
        .with_managed_default(true);
    registry.initialize_with(config, false).unwrap();

    assert!(registry.the_arena().is_managed());
    assert!(registry.is_alias(ArenaSlot::Managed, ArenaSlot::Default));
    let device = registry.the_device_arena();
    assert!(device.is_device());
    assert!(!registry.is_alias(ArenaSlot::Device, ArenaSlot::Default));
    assert_eq!(device.usage().unwrap().system_allocs, 1);
}

#[test]
fn test_gpu_aware_comms_layout() {
    let gpu = SimulatedGpuBackend::with_total_mb(256);

    // Managed default: comms reuses the device arena
    let registry = gpu_registry(&gpu);
    let config = quiet()
        .with_arena_init_size(MB)
        .with_managed_default(true)
        .with_gpu_aware_mpi(true);
    registry.initialize_with(config, false).unwrap();
    assert!(registry.is_alias(ArenaSlot::Comms, ArenaSlot::Device));
    registry.finalize();

    // Device default: comms gets its own device arena
    let registry = gpu_registry(&gpu);
    let config = quiet()
        .with_arena_init_size(MB)
        .with_comms_arena_init_size(MB)
        .with_gpu_aware_mpi(true);
    registry.initialize_with(config, false).unwrap();
    let comms = registry.the_comms_arena();
    assert!(comms.is_device());
    assert!(!registry.is_alias(ArenaSlot::Comms, ArenaSlot::Device));
    assert!(!registry.is_alias(ArenaSlot::Comms, ArenaSlot::Pinned));
    assert_eq!(comms.usage().unwrap().system_allocs, 1);
}

#[test]
fn test_gpu_defaults_follow_device_memory() {
    let gpu = SimulatedGpuBackend::with_total_mb(64);
    let registry = gpu_registry(&gpu);
    registry
        .initialize_with(quiet().with_managed_arena_init_size(0), false)
        .unwrap();

    let the_arena = registry.the_arena();
    assert_eq!(the_arena.usage().unwrap().heap_bytes, 48 * MB);
    assert_eq!(
        registry.the_pinned_arena().arena_info().release_threshold,
        32 * MB
    );
}

#[test]
fn test_gpu_oom_abort_fails_initialize() {
    let gpu = SimulatedGpuBackend::with_total_mb(16);
    let registry = gpu_registry(&gpu);
    let config = quiet().with_arena_init_size(32 * MB).with_oom_abort(true);

    let err = registry.initialize_with(config, false).unwrap_err();
    assert!(matches!(err, ArenaError::OutOfDeviceMemory { .. }));
    assert_eq!(registry.state(), RegistryState::Uninitialized);
}

#[test]
fn test_gpu_oom_abort_applies_to_async_arena() {
    let gpu = SimulatedGpuBackend::with_total_mb(64);
    let registry = gpu_registry(&gpu);
    let config = quiet()
        .with_arena_init_size(MB)
        .with_managed_arena_init_size(0)
        .with_oom_abort(true);
    registry.initialize_with(config, false).unwrap();

    let err = registry.the_async_arena().try_alloc(100 * MB).unwrap_err();
    match err {
        ArenaError::OutOfDeviceMemory { requested, .. } => assert_eq!(requested, 128 * MB),
        other => panic!("unexpected error {:?}", other),
    }
    registry.finalize();
}

#[test]
fn test_finalize_releases_device_memory() {
    let gpu = SimulatedGpuBackend::with_total_mb(128);
    let registry = gpu_registry(&gpu);
    registry
        .initialize_with(quiet().with_arena_init_size(4 * MB), false)
        .unwrap();
    assert!(gpu.in_use() > 0);

    registry.finalize();
    assert_eq!(gpu.in_use(), 0);
    assert_eq!(registry.state(), RegistryState::Finalized);
    assert_eq!(registry.the_arena().kind(), ArenaKind::Null);
    assert_eq!(registry.the_cpu_arena().kind(), ArenaKind::Basic);
}

#[test]
fn test_usage_files_are_appended_per_rank() -> anyhow::Result<()> {
    let dir = create_temp_dir()?;
    let base = usage_file_base(dir.path(), "arena_usage");

    let registry = host_registry();
    let config = quiet().with_arena_init_size(MB).with_rank(3);
    registry.initialize_with(config, false)?;

    let arena = registry.the_arena();
    let p = arena.alloc(2 * MB);
    registry.print_usage_to_files(&base, "step 1")?;
    arena.free(p);
    registry.print_usage_to_files(&base, "step 2")?;

    let text = read_usage_file(&usage_file_for_rank(&base, 3))?;
    let step1 = text.find("step 1").expect("first report");
    let step2 = text.find("step 2").expect("second report");
    assert!(step1 < step2);
    assert!(text.contains("    [The         Arena] space allocated (MB): 8"));
    assert!(text.contains("    [The         Arena] space used      (MB): 2"));
    assert!(text.contains("    [The         Arena] space used      (MB): 0"));
    assert!(text.contains("[The  Pinned Arena] live allocations: 0"));
    assert!(!text.contains("Managed Arena"));
    assert!(!text.contains("GPU global memory"));
    assert!(!usage_file_for_rank(&base, 0).exists());
    Ok(())
}

#[test]
fn test_gpu_usage_report_lists_device_memory() -> anyhow::Result<()> {
    let dir = create_temp_dir()?;
    let base = usage_file_base(dir.path(), "gpu_usage");
    let gpu = SimulatedGpuBackend::with_total_mb(256);
    let registry = gpu_registry(&gpu);
    registry.initialize_with(quiet().with_arena_init_size(MB), false)?;
    registry.print_usage_to_files(&base, "gpu")?;

    let text = read_usage_file(&usage_file_for_rank(&base, 0))?;
    assert!(text.contains("Total GPU global memory (MB): 256"));
    assert!(text.contains("[The Managed Arena]"));
    // Device aliases the default arena and is reported once
    assert!(!text.contains("[The  Device Arena]"));
    Ok(())
}

#[test]
fn test_usage_file_open_failure() {
    let registry = host_registry();
    registry.initialize_with(quiet().with_arena_init_size(MB), true).unwrap();

    let err = registry
        .print_usage_to_files("/nonexistent-dir/for/usage", "msg")
        .unwrap_err();
    assert!(matches!(err, ArenaError::UsageFileOpen { .. }));
    assert!(err.to_string().contains("/nonexistent-dir/for/usage.0"));
}

#[test]
fn test_observer_sees_every_created_arena() {
    let observer = Arc::new(RecordingObserver::default());
    let gpu = SimulatedGpuBackend::with_total_mb(256);
    let registry = gpu_registry(&gpu).with_observer(observer.clone());
    registry
        .initialize_with(quiet().with_arena_init_size(MB), false)
        .unwrap();

    let registered = observer.registered.lock().unwrap().clone();
    assert_eq!(
        registered,
        vec![
            "Device Memory".to_string(),
            "Async Memory".to_string(),
            "Managed Memory".to_string(),
            "Pinned Memory".to_string(),
        ]
    );

    {
        let _region = ProfileRegion::enter("advance");
        let arena = registry.the_managed_arena();
        let p = arena.alloc(1000);
        arena.free(p);
    }
    let regions = observer.regions.lock().unwrap().clone();
    assert!(regions
        .iter()
        .any(|(name, region, _)| name == "Managed Memory" && region == "advance"));

    registry.finalize();
    let mut deregistered = observer.deregistered.lock().unwrap().clone();
    deregistered.sort();
    assert_eq!(
        deregistered,
        vec!["Async Memory", "Device Memory", "Managed Memory", "Pinned Memory"]
    );
}

#[test]
fn test_cross_thread_free_is_attributed_to_allocating_region() {
    let registry = host_registry();
    registry
        .initialize_with(quiet().with_arena_init_size(MB), true)
        .unwrap();
    let arena = registry.the_arena();

    let addr = {
        let _region = ProfileRegion::enter("setup");
        arena.alloc(4096) as usize
    };
    let worker = Arc::clone(&arena);
    std::thread::spawn(move || {
        let _region = ProfileRegion::enter("teardown");
        worker.free(addr as *mut u8);
    })
    .join()
    .unwrap();

    let setup = arena.profiler().region_stat("setup").unwrap();
    assert_eq!(setup.nalloc, 1);
    assert_eq!(setup.nfree, 1);
    assert_eq!(setup.current_bytes, 0);
    assert!(arena.profiler().region_stat("teardown").is_none());
}

#[test]
#[serial]
#[cfg(not(feature = "rocm"))]
fn test_global_device_arena_is_null_without_gpu() {
    arenaforge::initialize_with(quiet().with_arena_init_size(MB), true);
    assert!(arenaforge::is_initialized());

    let device = arenaforge::the_device_arena();
    assert_eq!(device.kind(), ArenaKind::Null);
    assert!(device.alloc(1 << 30).is_null());

    let p = arenaforge::the_arena().alloc(256);
    assert!(!p.is_null());
    arenaforge::the_arena().free(p);

    arenaforge::finalize();
    assert!(!arenaforge::is_initialized());
}

#[test]
#[serial]
fn test_global_cpu_arena_survives_finalize() {
    arenaforge::initialize_with(quiet().with_arena_init_size(MB), true);
    let cpu = arenaforge::the_cpu_arena();
    assert_eq!(cpu.kind(), ArenaKind::Basic);
    arenaforge::finalize();

    assert!(same_arena(&cpu, &arenaforge::the_cpu_arena()));
    let p = cpu.alloc(64);
    assert!(!p.is_null());
    cpu.free(p);
    assert_eq!(arenaforge::registry().state(), RegistryState::Finalized);
}
