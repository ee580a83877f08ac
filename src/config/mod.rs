//! Run-time parameters for the arena registry
//!
//! Parameters are plain `key = value` strings looked up through a
//! [`ParamSource`]. Two sources ship with the crate: [`ParamTable`], an
//! in-memory table that can also parse `inputs`-style text, and
//! [`EnvParams`], which reads `ARENAFORGE_<KEY>` environment variables.
//! [`ArenaConfig`] can also be deserialized from JSON.
//!
//! Byte sizes accept `k`, `m` and `g` suffixes (binary multiples). Booleans
//! accept `true/false`, `1/0` and `yes/no`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::error::ArenaResult;

/// Default size of every arena's first pre-touch
pub const DEFAULT_INIT_SIZE: usize = 8 * 1024 * 1024;

/// Prefix stripped from keys in `inputs` files
const INPUTS_NAMESPACE: &str = "amrex.";

/// Default prefix of environment parameters
pub const ENV_PREFIX: &str = "ARENAFORGE_";

/// Launcher variables consulted for the rank when `ARENAFORGE_RANK` is unset
const RANK_FALLBACK_ENV: [&str; 2] = ["OMPI_COMM_WORLD_RANK", "PMI_RANK"];

/// Key/value lookup used to build an [`ArenaConfig`]
pub trait ParamSource {
    /// Raw value for `key` (without namespace), if present
    fn query(&self, key: &str) -> Option<String>;
}

/// In-memory parameter table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamTable {
    entries: HashMap<String, String>,
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter
    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let key = key.strip_prefix(INPUTS_NAMESPACE).unwrap_or(&key).to_string();
        self.entries.insert(key, value.to_string());
    }

    /// Parse `inputs`-style text
    ///
    /// One `amrex.key = value` per line; `#` starts a comment. Later lines
    /// override earlier ones.
    pub fn from_inputs(text: &str) -> ArenaResult<Self> {
        let mut table = ParamTable::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                config_error!("line {}: expected 'key = value', got '{}'", lineno + 1, line)
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(config_error!("line {}: empty key", lineno + 1));
            }
            table.insert(key, value.trim());
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ParamSource for ParamTable {
    fn query(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

/// Parameters from the process environment
#[derive(Debug, Clone)]
pub struct EnvParams {
    prefix: String,
}

impl EnvParams {
    pub fn new() -> Self {
        Self::with_prefix(ENV_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        EnvParams {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase())
    }
}

impl Default for EnvParams {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamSource for EnvParams {
    fn query(&self, key: &str) -> Option<String> {
        if let Ok(value) = std::env::var(self.var_name(key)) {
            return Some(value);
        }
        if key == "rank" {
            return RANK_FALLBACK_ENV
                .iter()
                .find_map(|name| std::env::var(name).ok());
        }
        None
    }
}

/// First source that knows a key wins
#[derive(Default)]
pub struct LayeredParams {
    layers: Vec<Box<dyn ParamSource>>,
}

impl LayeredParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, source: impl ParamSource + 'static) -> Self {
        self.layers.push(Box::new(source));
        self
    }
}

impl fmt::Debug for LayeredParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredParams")
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl ParamSource for LayeredParams {
    fn query(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.query(key))
    }
}

/// Parse a byte count with an optional `k`/`m`/`g` suffix
pub fn parse_bytes(value: &str) -> ArenaResult<usize> {
    let v = value.trim();
    let (digits, shift) = match v.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&v[..v.len() - 1], 10),
        Some('m') => (&v[..v.len() - 1], 20),
        Some('g') => (&v[..v.len() - 1], 30),
        _ => (v, 0),
    };
    let n: usize = digits
        .trim()
        .parse()
        .map_err(|_| config_error!("'{}' is not a byte size", value))?;
    n.checked_mul(1usize << shift)
        .ok_or_else(|| config_error!("byte size '{}' overflows", value))
}

/// Parse a boolean parameter
pub fn parse_bool(value: &str) -> ArenaResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(config_error!("'{}' is not a boolean", value)),
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> ArenaResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| config_error!("{} = '{}' is not an integer", key, value))
}

/// Arena registry parameters
///
/// `None` means "use the run-dependent default": the default arena's init
/// size and the pinned arena's release threshold depend on device memory,
/// and the pinned init size depends on minimal initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub the_arena_init_size: Option<usize>,
    pub the_device_arena_init_size: usize,
    pub the_managed_arena_init_size: usize,
    pub the_pinned_arena_init_size: Option<usize>,
    pub the_comms_arena_init_size: usize,

    pub the_arena_release_threshold: usize,
    pub the_device_arena_release_threshold: usize,
    pub the_managed_arena_release_threshold: usize,
    pub the_pinned_arena_release_threshold: Option<usize>,
    pub the_comms_arena_release_threshold: usize,
    pub the_async_arena_release_threshold: usize,

    /// Use managed memory for the default arena
    pub the_arena_is_managed: bool,
    /// Fail instead of over-subscribing device memory
    pub abort_on_out_of_gpu_memory: bool,
    /// MPI can read device memory directly
    pub use_gpu_aware_mpi: bool,

    pub verbose: i32,
    /// Rank used to name per-rank usage files
    pub rank: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            the_arena_init_size: None,
            the_device_arena_init_size: DEFAULT_INIT_SIZE,
            the_managed_arena_init_size: DEFAULT_INIT_SIZE,
            the_pinned_arena_init_size: None,
            the_comms_arena_init_size: DEFAULT_INIT_SIZE,
            the_arena_release_threshold: usize::MAX,
            the_device_arena_release_threshold: usize::MAX,
            the_managed_arena_release_threshold: usize::MAX,
            the_pinned_arena_release_threshold: None,
            the_comms_arena_release_threshold: usize::MAX,
            the_async_arena_release_threshold: usize::MAX,
            the_arena_is_managed: false,
            abort_on_out_of_gpu_memory: false,
            use_gpu_aware_mpi: false,
            verbose: 1,
            rank: 0,
        }
    }
}

impl ArenaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by every key `source` knows
    pub fn from_source(source: &dyn ParamSource) -> ArenaResult<Self> {
        let mut config = ArenaConfig::default();
        config.apply(source)?;
        Ok(config)
    }

    /// Defaults overridden by `ARENAFORGE_*` environment variables
    pub fn from_env() -> ArenaResult<Self> {
        Self::from_source(&EnvParams::new())
    }

    /// Parse an `inputs`-style parameter file body
    pub fn from_inputs(text: &str) -> ArenaResult<Self> {
        Self::from_source(&ParamTable::from_inputs(text)?)
    }

    pub fn from_json(json: &str) -> ArenaResult<Self> {
        serde_json::from_str(json).map_err(|e| config_error!("invalid arena config JSON: {}", e))
    }

    pub fn to_json(&self) -> ArenaResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| config_error!("cannot serialize arena config: {}", e))
    }

    /// Override fields with the keys present in `source`
    pub fn apply(&mut self, source: &dyn ParamSource) -> ArenaResult<()> {
        let bytes = |key: &str| -> ArenaResult<Option<usize>> {
            source
                .query(key)
                .map(|v| {
                    parse_bytes(&v)
                        .map_err(|_| config_error!("{} = '{}' is not a byte size", key, v))
                })
                .transpose()
        };
        let boolean = |key: &str| -> ArenaResult<Option<bool>> {
            source
                .query(key)
                .map(|v| {
                    parse_bool(&v).map_err(|_| config_error!("{} = '{}' is not a boolean", key, v))
                })
                .transpose()
        };

        if let Some(v) = bytes("the_arena_init_size")? {
            self.the_arena_init_size = Some(v);
        }
        if let Some(v) = bytes("the_device_arena_init_size")? {
            self.the_device_arena_init_size = v;
        }
        if let Some(v) = bytes("the_managed_arena_init_size")? {
            self.the_managed_arena_init_size = v;
        }
        if let Some(v) = bytes("the_pinned_arena_init_size")? {
            self.the_pinned_arena_init_size = Some(v);
        }
        if let Some(v) = bytes("the_comms_arena_init_size")? {
            self.the_comms_arena_init_size = v;
        }
        if let Some(v) = bytes("the_arena_release_threshold")? {
            self.the_arena_release_threshold = v;
        }
        if let Some(v) = bytes("the_device_arena_release_threshold")? {
            self.the_device_arena_release_threshold = v;
        }
        if let Some(v) = bytes("the_managed_arena_release_threshold")? {
            self.the_managed_arena_release_threshold = v;
        }
        if let Some(v) = bytes("the_pinned_arena_release_threshold")? {
            self.the_pinned_arena_release_threshold = Some(v);
        }
        if let Some(v) = bytes("the_comms_arena_release_threshold")? {
            self.the_comms_arena_release_threshold = v;
        }
        if let Some(v) = bytes("the_async_arena_release_threshold")? {
            self.the_async_arena_release_threshold = v;
        }
        if let Some(v) = boolean("the_arena_is_managed")? {
            self.the_arena_is_managed = v;
        }
        if let Some(v) = boolean("abort_on_out_of_gpu_memory")? {
            self.abort_on_out_of_gpu_memory = v;
        }
        if let Some(v) = boolean("use_gpu_aware_mpi")? {
            self.use_gpu_aware_mpi = v;
        }
        if let Some(v) = source.query("verbose") {
            self.verbose = parse_int("verbose", &v)?;
        }
        if let Some(v) = source.query("rank") {
            self.rank = parse_int("rank", &v)?;
        }
        Ok(())
    }

    pub fn with_arena_init_size(mut self, nbytes: usize) -> Self {
        self.the_arena_init_size = Some(nbytes);
        self
    }

    pub fn with_device_arena_init_size(mut self, nbytes: usize) -> Self {
        self.the_device_arena_init_size = nbytes;
        self
    }

    pub fn with_managed_arena_init_size(mut self, nbytes: usize) -> Self {
        self.the_managed_arena_init_size = nbytes;
        self
    }

    pub fn with_pinned_arena_init_size(mut self, nbytes: usize) -> Self {
        self.the_pinned_arena_init_size = Some(nbytes);
        self
    }

    pub fn with_comms_arena_init_size(mut self, nbytes: usize) -> Self {
        self.the_comms_arena_init_size = nbytes;
        self
    }

    pub fn with_arena_release_threshold(mut self, nbytes: usize) -> Self {
        self.the_arena_release_threshold = nbytes;
        self
    }

    pub fn with_device_arena_release_threshold(mut self, nbytes: usize) -> Self {
        self.the_device_arena_release_threshold = nbytes;
        self
    }

    pub fn with_managed_arena_release_threshold(mut self, nbytes: usize) -> Self {
        self.the_managed_arena_release_threshold = nbytes;
        self
    }

    pub fn with_pinned_arena_release_threshold(mut self, nbytes: usize) -> Self {
        self.the_pinned_arena_release_threshold = Some(nbytes);
        self
    }

    pub fn with_comms_arena_release_threshold(mut self, nbytes: usize) -> Self {
        self.the_comms_arena_release_threshold = nbytes;
        self
    }

    pub fn with_async_arena_release_threshold(mut self, nbytes: usize) -> Self {
        self.the_async_arena_release_threshold = nbytes;
        self
    }

    pub fn with_managed_default(mut self, managed: bool) -> Self {
        self.the_arena_is_managed = managed;
        self
    }

    pub fn with_oom_abort(mut self, abort: bool) -> Self {
        self.abort_on_out_of_gpu_memory = abort;
        self
    }

    pub fn with_gpu_aware_mpi(mut self, enabled: bool) -> Self {
        self.use_gpu_aware_mpi = enabled;
        self
    }

    pub fn with_verbose(mut self, verbose: i32) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    /// Pre-touch size of the default arena
    ///
    /// `device_total_mem` is `Some` on GPU runs. Non-minimal GPU runs reserve
    /// three quarters of device memory up front unless configured otherwise.
    pub fn arena_init_size(&self, device_total_mem: Option<usize>, minimal: bool) -> usize {
        match (self.the_arena_init_size, device_total_mem) {
            (Some(n), _) => n,
            (None, Some(total)) if !minimal => total / 4 * 3,
            (None, _) => DEFAULT_INIT_SIZE,
        }
    }

    /// Pre-touch size of the pinned arena; zero for minimal runs by default
    pub fn pinned_arena_init_size(&self, minimal: bool) -> usize {
        match self.the_pinned_arena_init_size {
            Some(n) => n,
            None if minimal => 0,
            None => DEFAULT_INIT_SIZE,
        }
    }

    /// Release threshold of the pinned arena; half of device memory on GPU runs
    pub fn pinned_arena_release_threshold(&self, device_total_mem: Option<usize>) -> usize {
        match (self.the_pinned_arena_release_threshold, device_total_mem) {
            (Some(n), _) => n,
            (None, Some(total)) => total / 2,
            (None, None) => usize::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ArenaConfig::default();
        assert_eq!(config.the_device_arena_init_size, DEFAULT_INIT_SIZE);
        assert_eq!(config.the_arena_release_threshold, usize::MAX);
        assert!(!config.the_arena_is_managed);
        assert_eq!(config.verbose, 1);
        assert_eq!(config.rank, 0);
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("1048576").unwrap(), 1048576);
        assert_eq!(parse_bytes("8k").unwrap(), 8 * 1024);
        assert_eq!(parse_bytes("8M").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_bytes(" 2g ").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_bytes("-1").is_err());
        assert!(parse_bytes("lots").is_err());
        assert!(parse_bytes("").is_err());
    }

    #[test]
    fn test_parse_bool() {
        for v in ["true", "1", "yes", "TRUE"] {
            assert!(parse_bool(v).unwrap());
        }
        for v in ["false", "0", "no"] {
            assert!(!parse_bool(v).unwrap());
        }
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_inputs_text() {
        let text = "\
# arena settings
amrex.the_arena_init_size = 1048576
amrex.the_arena_is_managed = 1   # use managed memory
amrex.verbose = 2

the_pinned_arena_release_threshold = 64m
";
        let config = ArenaConfig::from_inputs(text).unwrap();
        assert_eq!(config.the_arena_init_size, Some(1048576));
        assert!(config.the_arena_is_managed);
        assert_eq!(config.verbose, 2);
        assert_eq!(config.the_pinned_arena_release_threshold, Some(64 << 20));
    }

    #[test]
    fn test_inputs_rejects_garbage() {
        assert!(ParamTable::from_inputs("amrex.verbose 2").is_err());
        assert!(ParamTable::from_inputs(" = 2").is_err());
        let err = ArenaConfig::from_inputs("amrex.the_arena_init_size = huge").unwrap_err();
        assert!(err.to_string().contains("the_arena_init_size"));
    }

    #[test]
    fn test_layered_sources_first_wins() {
        let layered = LayeredParams::new()
            .with_layer(ParamTable::new().set("verbose", 3))
            .with_layer(ParamTable::new().set("verbose", 0).set("rank", 7));
        let config = ArenaConfig::from_source(&layered).unwrap();
        assert_eq!(config.verbose, 3);
        assert_eq!(config.rank, 7);
    }

    #[test]
    fn test_json_missing_keys_take_defaults() {
        let config = ArenaConfig::from_json(r#"{"the_arena_is_managed": true, "rank": 3}"#).unwrap();
        assert!(config.the_arena_is_managed);
        assert_eq!(config.rank, 3);
        assert_eq!(config.the_comms_arena_init_size, DEFAULT_INIT_SIZE);

        let back = ArenaConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
        assert!(ArenaConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_run_dependent_defaults() {
        let config = ArenaConfig::default();
        let gpu = Some(16usize << 30);

        assert_eq!(config.arena_init_size(None, false), DEFAULT_INIT_SIZE);
        assert_eq!(config.arena_init_size(gpu, false), 12usize << 30);
        assert_eq!(config.arena_init_size(gpu, true), DEFAULT_INIT_SIZE);

        assert_eq!(config.pinned_arena_init_size(false), DEFAULT_INIT_SIZE);
        assert_eq!(config.pinned_arena_init_size(true), 0);

        assert_eq!(config.pinned_arena_release_threshold(None), usize::MAX);
        assert_eq!(config.pinned_arena_release_threshold(gpu), 8usize << 30);

        let explicit = config
            .with_arena_init_size(1024)
            .with_pinned_arena_init_size(2048)
            .with_pinned_arena_release_threshold(4096);
        assert_eq!(explicit.arena_init_size(gpu, false), 1024);
        assert_eq!(explicit.pinned_arena_init_size(true), 2048);
        assert_eq!(explicit.pinned_arena_release_threshold(gpu), 4096);
    }
}
