use bridge_traits::NetworkType;
use serde::{Deserialize, Serialize};

/// Raw store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    /// Bytes promised to in-flight writes.
    pub reserved_bytes: u64,
    pub capacity_bytes: u64,
}

/// Cache and connectivity summary for settings screens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_cached_tracks: usize,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
    pub active_downloads: usize,
    pub network_connected: bool,
    pub network_type: Option<NetworkType>,
}

impl CacheStats {
    /// Percentage of capacity in use (0.0 to 100.0).
    pub fn usage_percentage(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        (self.total_bytes as f64 / self.capacity_bytes as f64) * 100.0
    }

    /// Above 90% usage.
    pub fn is_near_capacity(&self) -> bool {
        self.usage_percentage() > 90.0
    }

    pub fn is_full(&self) -> bool {
        self.total_bytes >= self.capacity_bytes
    }

    pub fn average_track_size(&self) -> u64 {
        if self.total_cached_tracks == 0 {
            return 0;
        }
        self.total_bytes / self.total_cached_tracks as u64
    }
}
