//! Helper functions for tempfile/tempdir usage in tests

use anyhow::Context;
use std::path::{Path, PathBuf};

/// Create a temp directory with a helpful error message.
pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Base name for per-rank usage files inside `dir`
///
/// The registry appends `.<rank>` to this path.
pub fn usage_file_base(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}

/// Path of the usage file written for `rank`
pub fn usage_file_for_rank(base: &str, rank: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", base, rank))
}

/// Read a usage file with context on failure
pub fn read_usage_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read usage file {}", path.display()))
}

#[allow(dead_code)]
pub use tempfile::TempDir;
