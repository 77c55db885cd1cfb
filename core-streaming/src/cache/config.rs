use crate::error::{Result, StreamingError};
use core_runtime::config::CoreConfig;
use std::path::{Component, PathBuf};

/// Default cache capacity (1 GiB).
pub const DEFAULT_MAX_CACHE_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

/// Default directory name under the host cache directory.
pub const DEFAULT_CACHE_DIRECTORY: &str = "track-cache";

/// Track cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound on the sum of stored blob sizes.
    pub max_cache_size_bytes: u64,
    /// Relative directory under the host cache directory.
    pub cache_directory: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: DEFAULT_MAX_CACHE_SIZE_BYTES,
            cache_directory: PathBuf::from(DEFAULT_CACHE_DIRECTORY),
        }
    }
}

impl CacheConfig {
    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_size_bytes = bytes;
        self
    }

    pub fn with_cache_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.cache_directory = directory.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_cache_size_bytes == 0 {
            return Err(StreamingError::Config(
                "max_cache_size_bytes must be greater than 0".to_string(),
            ));
        }

        let valid = self.cache_directory.components().next().is_some()
            && self
                .cache_directory
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StreamingError::Config(format!(
                "cache_directory must be a non-empty relative path without '..', got {}",
                self.cache_directory.display()
            )));
        }

        Ok(())
    }
}

impl From<&CoreConfig> for CacheConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            max_cache_size_bytes: config.cache_size_bytes(),
            cache_directory: config.cache_dir.clone(),
        }
    }
}
