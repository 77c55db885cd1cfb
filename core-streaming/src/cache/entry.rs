use crate::quality::{QualityTier, TrackIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for one stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub track_id: String,
    pub quality: QualityTier,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn identity(&self) -> TrackIdentity {
        TrackIdentity::new(self.track_id.clone(), self.quality)
    }
}
