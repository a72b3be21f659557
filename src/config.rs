use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default memory-tier budget (30 MB).
pub const DEFAULT_MEMORY_CAPACITY_BYTES: usize = 30 * 1024 * 1024;

/// Default per-request transport timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Folder created under the system temp dir when no cache dir is configured.
pub const CACHE_FOLDER_NAME: &str = "ma.image.cache";

/// Suffix for in-progress disk writes; renamed into place once complete.
pub const DISK_TEMP_SUFFIX: &str = ".tmp";

/// Top-level configuration for the image service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Maximum total bytes held by the memory tier.
    pub memory_capacity_bytes: usize,
    /// Directory used for on-disk cache files. Empty means the system temp dir.
    pub cache_dir: String,
    /// Whole-request timeout handed to the HTTP client.
    pub request_timeout_secs: u64,
}

impl ServiceConfig {
    /// Resolve the disk cache folder.
    pub fn cache_path(&self) -> PathBuf {
        if self.cache_dir.trim().is_empty() {
            std::env::temp_dir().join(CACHE_FOLDER_NAME)
        } else {
            PathBuf::from(&self.cache_dir)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            memory_capacity_bytes: DEFAULT_MEMORY_CAPACITY_BYTES,
            cache_dir: String::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}
