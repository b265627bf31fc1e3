//! # Runtime Configuration
//!
//! Pool sizing and worker counts, loaded once at startup from TOML.
//!
//! ```toml
//! chunk_capacity = 128
//! graveyard_chunk_capacity = 16
//! reserved_empty_chunks = 2
//! worker_threads = 7
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{RuntimeError, RuntimeResult};

/// Storage and scheduling configuration.
///
/// Every field has a default, so a partial (or empty) TOML file is valid.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Records per chunk in live pools.
    pub chunk_capacity: usize,
    /// Records per chunk in graveyard pools.
    pub graveyard_chunk_capacity: usize,
    /// Empty chunks a pool keeps around instead of freeing them.
    pub reserved_empty_chunks: usize,
    /// Hard limit on chunks per pool. `None` means unbounded.
    pub max_chunks_per_pool: Option<usize>,
    /// Hard limit on out-of-line buffer stores.
    pub max_buffer_stores: usize,
    /// Worker threads used by `Scheduler::run_frame` (the caller is the main thread).
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map_or(1, |n| n.get().saturating_sub(1))
            .max(1);
        Self {
            chunk_capacity: 64,
            graveyard_chunk_capacity: 16,
            reserved_empty_chunks: 1,
            max_chunks_per_pool: None,
            max_buffer_stores: 1 << 20,
            worker_threads: workers,
        }
    }
}

impl RuntimeConfig {
    /// Parses a configuration from TOML text and validates it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on a parse failure or an invalid value.
    pub fn from_toml_str(text: &str) -> RuntimeResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| RuntimeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.chunk_capacity == 0 {
            return Err(RuntimeError::InvalidConfig("chunk_capacity must be > 0".into()));
        }
        if self.graveyard_chunk_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "graveyard_chunk_capacity must be > 0".into(),
            ));
        }
        if self.max_chunks_per_pool == Some(0) {
            return Err(RuntimeError::InvalidConfig(
                "max_chunks_per_pool must be > 0 when set".into(),
            ));
        }
        if self.max_buffer_stores == 0 {
            return Err(RuntimeError::InvalidConfig("max_buffer_stores must be > 0".into()));
        }
        Ok(())
    }
}
