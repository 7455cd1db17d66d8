//! Cache configuration
//!
//! Defaults come from the platform cache directory; environment variables and an optional
//! JSON file override them.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default minimum free space kept on the cache volume: 512 MB
pub const DEFAULT_RESERVED_FREE_SPACE: u64 = 512 * 1024 * 1024;

/// Environment variable overriding the cache root
pub const ENV_CACHE_DIR: &str = "CLOUDMOUNT_CACHE_DIR";

/// Environment variable overriding the reserved free space (bytes)
pub const ENV_RESERVED_BYTES: &str = "CLOUDMOUNT_CACHE_RESERVED_BYTES";

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Directory holding the versioned cache tree
    pub root: PathBuf,
    /// Bytes that must stay free on the volume after any cache write
    pub reserved_free_space: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("cloudmount"),
            reserved_free_space: DEFAULT_RESERVED_FREE_SPACE,
        }
    }
}

impl CacheConfig {
    /// Create a config rooted at `root` with the default reserve
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `CLOUDMOUNT_CACHE_DIR` / `CLOUDMOUNT_CACHE_RESERVED_BYTES`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a JSON file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache config: {:?}", path))?;
        let mut config: CacheConfig = serde_json::from_str(&content)
            .with_context(|| format!("Invalid cache config: {:?}", path))?;
        config.apply_env()?;
        debug!(path = %path.display(), root = %config.root.display(), "Loaded cache config");
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = env::var(ENV_CACHE_DIR) {
            self.root = PathBuf::from(dir);
        }
        if let Ok(bytes) = env::var(ENV_RESERVED_BYTES) {
            self.reserved_free_space = bytes
                .trim()
                .parse()
                .with_context(|| format!("{} must be a byte count, got {:?}", ENV_RESERVED_BYTES, bytes))?;
        }
        Ok(())
    }
}
