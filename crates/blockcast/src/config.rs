//! Engine configuration loading and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffer::SECTOR_SIZE;
use crate::error::{EngineError, Result};
use crate::hash::HashAlgorithm;

/// Default block size: 16 KiB, four sectors.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * SECTOR_SIZE;

/// Default pool capacity.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Configuration for a transfer coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed transfer unit in bytes. Must be a positive multiple of the
    /// sector size (4096).
    pub block_size: usize,

    /// Number of preallocated blocks in the pool.
    pub pool_capacity: usize,

    /// Whether to run two-pass hash verification after the transfer.
    pub verify_hash: bool,

    /// Algorithm used when verification runs with the cryptographic hasher.
    pub hash_algorithm: HashAlgorithm,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            verify_hash: false,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the pool capacity.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Enable or disable hash verification.
    pub fn with_verify_hash(mut self, enabled: bool) -> Self {
        self.verify_hash = enabled;
        self
    }

    /// Set the cryptographic hash algorithm.
    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    /// Load configuration from a YAML or JSON file, detected by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        match extension.as_deref() {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::config(format!("failed to parse YAML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("failed to parse JSON config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % SECTOR_SIZE != 0 {
            return Err(EngineError::config(format!(
                "block_size must be a positive multiple of {SECTOR_SIZE}, got {}",
                self.block_size
            )));
        }
        if self.pool_capacity == 0 {
            return Err(EngineError::config("pool_capacity must be at least 1"));
        }
        Ok(())
    }
}
