//! # Core Configuration Module
//!
//! Provides configuration management for the streaming core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds the host bridges and the tunable constants of the
//! track cache and download coordinator. It enforces fail-fast validation so
//! a missing capability is reported at startup rather than on first playback.
//!
//! ## Required Dependencies
//!
//! - `HttpClient` - Media downloads (desktop default: reqwest)
//! - `FileSystemAccess` - Cache blob storage (desktop default: tokio fs)
//!
//! ## Optional Dependencies
//!
//! - `NetworkMonitor` - Connectivity detection (desktop default: TCP probe).
//!   Without one the core assumes it is online.
//! - `Clock` - Timestamp source (default: system clock)
//! - `EventBus` - Receives cache, download and network events
//!
//! When the `desktop-shims` feature is enabled, `bridge-desktop` defaults are
//! injected for any bridge that was not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::time::Duration;
//!
//! let config = CoreConfig::builder()
//!     .cache_dir("track-cache")
//!     .cache_size_mb(512)
//!     .max_concurrent_downloads(3)
//!     .download_timeout(Duration::from_secs(20))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! Without `desktop-shims`, omitting a required bridge fails with
//! [`Error::CapabilityMissing`] naming the capability and how to provide it.

use crate::error::{Error, Result};
use crate::events::EventBus;
use bridge_traits::{Clock, FileSystemAccess, HttpClient, NetworkMonitor, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default cache subdirectory, relative to the host cache directory.
pub const DEFAULT_CACHE_DIR: &str = "track-cache";
/// Default cache capacity (1 GB).
pub const DEFAULT_CACHE_SIZE_MB: usize = 1024;
/// Default download pool size.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;
/// Default bound on a single download attempt.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// One initial attempt plus one retry.
pub const DEFAULT_MAX_DOWNLOAD_ATTEMPTS: u32 = 2;
/// Delay before the retry attempt.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

const MAX_CACHE_SIZE_MB: usize = 100_000;
const MAX_CONCURRENT_DOWNLOADS: usize = 8;

/// Core configuration for the streaming core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Cache directory, relative to `FileSystemAccess::get_cache_directory`
    pub cache_dir: PathBuf,

    /// Maximum cache size in megabytes
    pub cache_size_mb: usize,

    /// Upper bound on concurrently running downloads
    pub max_concurrent_downloads: usize,

    /// Bound on one download attempt
    pub download_timeout: Duration,

    /// Total attempts per download, retry included (1 or 2)
    pub max_download_attempts: u32,

    /// Delay before retrying a failed attempt
    pub retry_backoff: Duration,

    /// HTTP client for media downloads
    pub http_client: Arc<dyn HttpClient>,

    /// File system access abstraction
    pub file_system: Arc<dyn FileSystemAccess>,

    /// Network connectivity monitor (optional)
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Timestamp source for cache entries
    pub clock: Arc<dyn Clock>,

    /// Event bus shared with the host (optional)
    pub event_bus: Option<EventBus>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("cache_dir", &self.cache_dir)
            .field("cache_size_mb", &self.cache_size_mb)
            .field("max_concurrent_downloads", &self.max_concurrent_downloads)
            .field("download_timeout", &self.download_timeout)
            .field("max_download_attempts", &self.max_download_attempts)
            .field("retry_backoff", &self.retry_backoff)
            .field("http_client", &"HttpClient { ... }")
            .field("file_system", &"FileSystemAccess { ... }")
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field("clock", &"Clock { ... }")
            .field("event_bus", &self.event_bus)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Cache capacity in bytes.
    pub fn cache_size_bytes(&self) -> u64 {
        self.cache_size_mb as u64 * 1024 * 1024
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Cache directory is a non-empty relative path
    /// - Cache size is reasonable (> 0 and <= 100GB)
    /// - Download concurrency is between 1 and 8
    /// - Download timeout is non-zero
    /// - At most one retry is configured
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::Config("Cache directory cannot be empty".to_string()));
        }

        if self.cache_dir.is_absolute() {
            return Err(Error::Config(
                "Cache directory must be relative to the host cache directory".to_string(),
            ));
        }

        if self.cache_size_mb == 0 {
            return Err(Error::Config(
                "Cache size must be greater than 0 MB".to_string(),
            ));
        }

        if self.cache_size_mb > MAX_CACHE_SIZE_MB {
            return Err(Error::Config(
                "Cache size exceeds maximum of 100GB (100,000 MB)".to_string(),
            ));
        }

        if self.max_concurrent_downloads == 0 || self.max_concurrent_downloads > MAX_CONCURRENT_DOWNLOADS
        {
            return Err(Error::Config(format!(
                "max_concurrent_downloads must be between 1 and {}",
                MAX_CONCURRENT_DOWNLOADS
            )));
        }

        if self.download_timeout.is_zero() {
            return Err(Error::Config(
                "Download timeout must be greater than zero".to_string(),
            ));
        }

        if !(1..=2).contains(&self.max_download_attempts) {
            return Err(Error::Config(
                "max_download_attempts must be 1 or 2 (a single retry at most)".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required for media downloads. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default ReqwestHttpClient. \
                 Mobile: inject a client backed by URLSession/OkHttp."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn file_system_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "FileSystemAccess implementation is required for the track cache. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default TokioFileSystem. \
                 Mobile: inject sandboxed cache directory access."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::new()
        .map_err(|e| Error::Internal(format!("Failed to create default HttpClient: {}", e)))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    Ok(Arc::new(TokioFileSystem::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    Err(file_system_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
    use bridge_desktop::DesktopNetworkMonitor;

    Some(Arc::new(DesktopNetworkMonitor::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
    None
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Call [`build()`](CoreConfigBuilder::build) to create the final config.
#[derive(Default)]
pub struct CoreConfigBuilder {
    cache_dir: Option<PathBuf>,
    cache_size_mb: Option<usize>,
    max_concurrent_downloads: Option<usize>,
    download_timeout: Option<Duration>,
    max_download_attempts: Option<u32>,
    retry_backoff: Option<Duration>,
    http_client: Option<Arc<dyn HttpClient>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    event_bus: Option<EventBus>,
}

impl CoreConfigBuilder {
    /// Sets the cache subdirectory (relative to the host cache directory).
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder().cache_dir("offline-tracks");
    /// ```
    pub fn cache_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Sets the maximum cache size in megabytes. Defaults to 1024 (1 GB).
    pub fn cache_size_mb(mut self, size_mb: usize) -> Self {
        self.cache_size_mb = Some(size_mb);
        self
    }

    /// Sets the download pool size. Defaults to 2.
    pub fn max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = Some(max);
        self
    }

    /// Sets the per-attempt download timeout. Defaults to 30 seconds.
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = Some(timeout);
        self
    }

    /// Sets the total number of attempts per download (1 or 2).
    pub fn max_download_attempts(mut self, attempts: u32) -> Self {
        self.max_download_attempts = Some(attempts);
        self
    }

    /// Sets the delay before the retry attempt.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    /// Sets the HTTP client implementation.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the file system access implementation.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the network monitor implementation (optional).
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Sets the clock used for cache timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Attaches an event bus.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// Missing bridges are filled from `bridge-desktop` when the
    /// `desktop-shims` feature is enabled.
    ///
    /// # Errors
    ///
    /// - [`Error::CapabilityMissing`] when a required bridge is absent
    /// - [`Error::Config`] when a value is out of range
    pub fn build(self) -> Result<CoreConfig> {
        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system()?,
        };

        let network_monitor = self
            .network_monitor
            .or_else(provide_default_network_monitor);

        let config = CoreConfig {
            cache_dir: self
                .cache_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
            cache_size_mb: self.cache_size_mb.unwrap_or(DEFAULT_CACHE_SIZE_MB),
            max_concurrent_downloads: self
                .max_concurrent_downloads
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            download_timeout: self.download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT),
            max_download_attempts: self
                .max_download_attempts
                .unwrap_or(DEFAULT_MAX_DOWNLOAD_ATTEMPTS),
            retry_backoff: self.retry_backoff.unwrap_or(DEFAULT_RETRY_BACKOFF),
            http_client,
            file_system,
            network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_bus: self.event_bus,
        };

        config.validate()?;

        Ok(config)
    }
}
