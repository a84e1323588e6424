#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::patch::log::LOG_BLOCK_HEADER_LEN;
use crate::patch::PATCH_HEADER_LEN;
use crate::store::IoPriority;
use crate::types::{PatchworkError, Result};

/// Bounds of the adaptive patch-vs-full-write ratio.
pub const MIN_PATCH_RATIO: u32 = 1;
/// Largest patch ratio; see [`MIN_PATCH_RATIO`].
pub const MAX_PATCH_RATIO: u32 = 64;

/// Configuration options for the write-back coordinator.
///
/// These options control admission limits, sync triggers, pipelining, and
/// the size of the patch log. They can be loaded from TOML; missing keys
/// keep their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WritebackOptions {
    /// Size of every block in bytes.
    pub block_size: usize,
    /// Admission limit on dirty blocks plus in-flight writes plus expected changes.
    pub max_dirty_blocks: usize,
    /// Dirty count above which a committing transaction starts a sync.
    pub flush_dirty_size: usize,
    /// Interval of the flush timer; `None` disables timer-driven syncs.
    pub flush_interval_ms: Option<u64>,
    /// Number of queued patient syncs that forces a cycle to start.
    pub flush_waiting_threshold: usize,
    /// Maximum number of flush cycles in flight at once.
    pub max_concurrent_flushes: usize,
    /// Number of log blocks in the patch log region.
    pub patch_log_blocks: u32,
    /// Priority passed to the store with every write batch.
    pub io_priority: IoPriority,
    /// Starting value of the patch-vs-full-write ratio.
    pub initial_patch_ratio: u32,
}

impl Default for WritebackOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_dirty_blocks: 1024,
            flush_dirty_size: 256,
            flush_interval_ms: Some(1000),
            flush_waiting_threshold: 8,
            max_concurrent_flushes: 2,
            patch_log_blocks: 64,
            io_priority: IoPriority::Normal,
            initial_patch_ratio: 4,
        }
    }
}

impl WritebackOptions {
    /// Parses and validates options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(text).map_err(|err| PatchworkError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads and validates options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            PatchworkError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Configured flush timer interval.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_ms.map(Duration::from_millis)
    }

    /// Rejects combinations the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let min_block = LOG_BLOCK_HEADER_LEN + PATCH_HEADER_LEN + 64;
        if self.block_size < min_block || self.block_size > u16::MAX as usize + 1 {
            return Err(PatchworkError::Config(format!(
                "block_size must be between {min_block} and 65536, got {}",
                self.block_size
            )));
        }
        if self.max_dirty_blocks == 0 {
            return Err(PatchworkError::Config(
                "max_dirty_blocks must be at least 1".into(),
            ));
        }
        if self.max_concurrent_flushes == 0 {
            return Err(PatchworkError::Config(
                "max_concurrent_flushes must be at least 1".into(),
            ));
        }
        if self.patch_log_blocks == 0 {
            return Err(PatchworkError::Config(
                "patch_log_blocks must be at least 1".into(),
            ));
        }
        if self.flush_interval_ms == Some(0) {
            return Err(PatchworkError::Config(
                "flush_interval_ms must be positive".into(),
            ));
        }
        if !(MIN_PATCH_RATIO..=MAX_PATCH_RATIO).contains(&self.initial_patch_ratio) {
            return Err(PatchworkError::Config(format!(
                "initial_patch_ratio must be in {MIN_PATCH_RATIO}..={MAX_PATCH_RATIO}"
            )));
        }
        Ok(())
    }
}
