//! Streaming configuration and atomic snapshot updates.

use crate::quality::QualityTier;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

/// User-facing streaming preferences.
///
/// Readers always take a fresh [`Arc`] snapshot per request, so a concurrent
/// update never produces a half-applied view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub preferred_quality: QualityTier,
    pub enable_caching: bool,
    pub preload_next_track: bool,
    pub fallback_enabled: bool,
    /// Upper bound applied while on a cellular connection.
    #[serde(default)]
    pub cellular_max_quality: Option<QualityTier>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            preferred_quality: QualityTier::Kbps320,
            enable_caching: true,
            preload_next_track: true,
            fallback_enabled: true,
            cellular_max_quality: None,
        }
    }
}

impl StreamingConfig {
    /// Returns a copy with every field set in `update` applied.
    pub fn merged(&self, update: &StreamingConfigUpdate) -> Self {
        Self {
            preferred_quality: update.preferred_quality.unwrap_or(self.preferred_quality),
            enable_caching: update.enable_caching.unwrap_or(self.enable_caching),
            preload_next_track: update.preload_next_track.unwrap_or(self.preload_next_track),
            fallback_enabled: update.fallback_enabled.unwrap_or(self.fallback_enabled),
            cellular_max_quality: update
                .cellular_max_quality
                .unwrap_or(self.cellular_max_quality),
        }
    }
}

/// Partial configuration update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfigUpdate {
    pub preferred_quality: Option<QualityTier>,
    pub enable_caching: Option<bool>,
    pub preload_next_track: Option<bool>,
    pub fallback_enabled: Option<bool>,
    /// `Some(None)` removes the cap. On the wire, an explicit `null` clears
    /// it and an absent field leaves it alone.
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub cellular_max_quality: Option<Option<QualityTier>>,
}

/// Any value that reaches the deserializer, `null` included, marks the field
/// as present. Absent fields fall back to `default`.
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl StreamingConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preferred_quality(mut self, quality: QualityTier) -> Self {
        self.preferred_quality = Some(quality);
        self
    }

    pub fn enable_caching(mut self, enabled: bool) -> Self {
        self.enable_caching = Some(enabled);
        self
    }

    pub fn preload_next_track(mut self, enabled: bool) -> Self {
        self.preload_next_track = Some(enabled);
        self
    }

    pub fn fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = Some(enabled);
        self
    }

    pub fn cellular_max_quality(mut self, cap: Option<QualityTier>) -> Self {
        self.cellular_max_quality = Some(cap);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Shared holder of the current configuration snapshot.
#[derive(Debug, Default)]
pub(crate) struct ConfigCell {
    current: RwLock<Arc<StreamingConfig>>,
}

impl ConfigCell {
    pub(crate) fn new(config: StreamingConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<StreamingConfig> {
        self.current.read().clone()
    }

    /// Merge and swap under the write lock so concurrent updates compose.
    pub(crate) fn update(&self, update: &StreamingConfigUpdate) -> Arc<StreamingConfig> {
        let mut current = self.current.write();
        let next = Arc::new(current.merged(update));
        *current = next.clone();
        next
    }
}
