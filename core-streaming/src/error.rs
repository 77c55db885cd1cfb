//! # Streaming Error Types
//!
//! Errors surfaced by the cache store, download coordinator and streaming
//! façade. `StreamingError` is `Clone` because a single download outcome is
//! fanned out to every waiter attached to the task.

use crate::quality::QualityTier;
use bridge_traits::BridgeError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while resolving, downloading or caching a stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamingError {
    // ========================================================================
    // Resolution Errors
    // ========================================================================
    /// The requested tier is not offered and fallback is disabled.
    #[error(
        "Quality {requested} unavailable for track {track_id} (available: {})",
        format_tiers(.available)
    )]
    QualityUnavailable {
        track_id: String,
        requested: QualityTier,
        available: Vec<QualityTier>,
    },

    /// No tier at all is available for the track.
    #[error("No stream available for track {track_id}")]
    NoStreamAvailable { track_id: String },

    // ========================================================================
    // Cache Errors
    // ========================================================================
    /// Eviction could not free enough space for a blob.
    #[error("Cache storage full: {required} bytes required, capacity is {capacity} bytes")]
    StorageFull { required: u64, capacity: u64 },

    /// Persistent storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // Download Errors
    // ========================================================================
    /// The download failed after the permitted attempts.
    #[error("Download failed for {track_id} ({quality}): {cause}")]
    DownloadFailed {
        track_id: String,
        quality: QualityTier,
        cause: String,
    },

    /// A download attempt exceeded its time bound.
    #[error("Download of {track_id} ({quality}) timed out after {timeout:?}")]
    DownloadTimeout {
        track_id: String,
        quality: QualityTier,
        timeout: Duration,
    },

    /// The download was cancelled before completion.
    #[error("Download of {track_id} ({quality}) was cancelled")]
    Cancelled {
        track_id: String,
        quality: QualityTier,
    },

    /// A network fetch was required while offline.
    #[error("Offline: track {track_id} is not cached")]
    Offline { track_id: String },

    // ========================================================================
    // Setup Errors
    // ========================================================================
    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required collaborator was not provided.
    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },
}

impl StreamingError {
    /// Returns `true` if retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamingError::DownloadFailed { .. }
                | StreamingError::DownloadTimeout { .. }
                | StreamingError::Offline { .. }
        )
    }

    /// Returns `true` if this error is due to network issues.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            StreamingError::DownloadFailed { .. }
                | StreamingError::DownloadTimeout { .. }
                | StreamingError::Offline { .. }
        )
    }

    /// Returns `true` for cancellation, which callers usually ignore.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamingError::Cancelled { .. })
    }
}

impl From<BridgeError> for StreamingError {
    fn from(err: BridgeError) -> Self {
        StreamingError::Storage(err.to_string())
    }
}

impl From<core_runtime::Error> for StreamingError {
    fn from(err: core_runtime::Error) -> Self {
        match err {
            core_runtime::Error::CapabilityMissing {
                capability,
                message,
            } => StreamingError::CapabilityMissing {
                capability,
                message,
            },
            other => StreamingError::Config(other.to_string()),
        }
    }
}

fn format_tiers(tiers: &[QualityTier]) -> String {
    if tiers.is_empty() {
        return "none".to_string();
    }
    tiers
        .iter()
        .map(QualityTier::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for streaming operations.
pub type Result<T> = std::result::Result<T, StreamingError>;
