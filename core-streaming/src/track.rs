//! Track descriptors, stream handles and per-track lifecycle state.

use crate::cache::CacheEntry;
use crate::quality::QualityTier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// A playable song as described by the catalog: one URL per offered tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongDescriptor {
    pub id: String,
    pub quality_urls: BTreeMap<QualityTier, String>,
    pub duration: Duration,
}

impl SongDescriptor {
    pub fn new(id: impl Into<String>, duration: Duration) -> Self {
        Self {
            id: id.into(),
            quality_urls: BTreeMap::new(),
            duration,
        }
    }

    pub fn with_url(mut self, quality: QualityTier, url: impl Into<String>) -> Self {
        self.quality_urls.insert(quality, url.into());
        self
    }

    pub fn available_qualities(&self) -> BTreeSet<QualityTier> {
        self.quality_urls.keys().copied().collect()
    }

    pub fn url_for(&self, quality: QualityTier) -> Option<&str> {
        self.quality_urls.get(&quality).map(String::as_str)
    }
}

/// Where a [`StreamHandle`] points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Cache,
    Network,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSource::Cache => "cache",
            StreamSource::Network => "network",
        }
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the player is given: a local file path or a remote URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandle {
    pub track_id: String,
    pub quality: QualityTier,
    pub source: StreamSource,
    pub location: String,
}

impl StreamHandle {
    pub fn cached(entry: &CacheEntry) -> Self {
        Self {
            track_id: entry.track_id.clone(),
            quality: entry.quality,
            source: StreamSource::Cache,
            location: entry.local_path.to_string_lossy().into_owned(),
        }
    }

    pub fn network(track_id: impl Into<String>, quality: QualityTier, url: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            quality,
            source: StreamSource::Network,
            location: url.into(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.source == StreamSource::Cache
    }
}

/// Lifecycle of the most recent stream request for a track.
///
/// ```text
/// Idle -> Resolving -> CacheHit -> Ready
///                   -> CacheMiss -> Downloading -> Ready | Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Resolving,
    CacheHit,
    CacheMiss,
    Downloading,
    Ready,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Ready | StreamState::Failed | StreamState::Cancelled
        )
    }
}
