//! # Streaming Manager
//!
//! The façade the player talks to. It owns the configuration snapshot, the
//! track cache, the download coordinator and the network observer, and turns a
//! song plus a requested tier into something playable.
//!
//! ## Workflow
//!
//! ```text
//! get_stream_handle(song, requested)
//!   -> resolve tier against remote tiers (online) or cached tiers (offline)
//!   -> cache hit:  local path
//!   -> cache miss: caching off -> remote URL
//!                  caching on  -> immediate download, then local path
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let manager = StreamingManager::from_core_config(&core_config, StreamingConfig::default()).await?;
//! let handle = manager.get_stream_handle(&song, QualityTier::Kbps320).await?;
//! player.play(&handle.location);
//! manager.on_playback_started(next_song.as_ref());
//! ```

use crate::cache::{CacheConfig, CacheStats, TrackCacheStore};
use crate::config::{ConfigCell, StreamingConfig, StreamingConfigUpdate};
use crate::download::{DownloadCoordinator, DownloadPriority, DownloadSettings};
use crate::error::{Result, StreamingError};
use crate::network::{NetworkObserver, NetworkState};
use crate::quality::{resolve, QualityTier, TrackIdentity};
use crate::track::{SongDescriptor, StreamHandle, StreamState};
use bridge_traits::HttpClient;
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, StreamingEvent};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Tracks whose lifecycle state is remembered.
const TRACKED_STATES: usize = 256;

/// Entry point for stream resolution, preloading and cache management.
pub struct StreamingManager {
    config: ConfigCell,
    store: Arc<TrackCacheStore>,
    coordinator: DownloadCoordinator,
    network: NetworkObserver,
    states: Mutex<LruCache<String, StreamState>>,
    event_bus: Option<EventBus>,
    shutdown: CancellationToken,
}

impl StreamingManager {
    pub fn builder() -> StreamingManagerBuilder {
        StreamingManagerBuilder::default()
    }

    /// Wire a manager from the runtime configuration: open the cache, probe the
    /// network once and start watching connectivity changes.
    #[instrument(skip_all)]
    pub async fn from_core_config(
        core_config: &CoreConfig,
        streaming_config: StreamingConfig,
    ) -> Result<Self> {
        core_config.validate()?;

        let mut store = TrackCacheStore::open(
            core_config.file_system.clone(),
            core_config.clock.clone(),
            CacheConfig::from(core_config),
        )
        .await?;

        let mut network = NetworkObserver::new(core_config.network_monitor.clone());
        if let Some(bus) = &core_config.event_bus {
            store = store.with_event_bus(bus.clone());
            network = network.with_event_bus(bus.clone());
        }
        network.refresh().await;

        let mut builder = Self::builder()
            .config(streaming_config)
            .store(Arc::new(store))
            .http_client(core_config.http_client.clone())
            .network(network)
            .download_settings(DownloadSettings::from(core_config));
        if let Some(bus) = &core_config.event_bus {
            builder = builder.event_bus(bus.clone());
        }

        let manager = builder.build()?;
        manager.start_network_watcher();
        Ok(manager)
    }

    /// Start consuming the network monitor's change stream. Returns `false`
    /// when no monitor is configured.
    pub fn start_network_watcher(&self) -> bool {
        self.network
            .spawn_watcher(self.shutdown.child_token())
            .is_some()
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn config(&self) -> Arc<StreamingConfig> {
        self.config.snapshot()
    }

    /// Apply a partial update atomically and return the new snapshot.
    pub fn update_config(&self, update: StreamingConfigUpdate) -> Arc<StreamingConfig> {
        let next = self.config.update(&update);
        info!(
            preferred_quality = %next.preferred_quality,
            enable_caching = next.enable_caching,
            preload_next_track = next.preload_next_track,
            fallback_enabled = next.fallback_enabled,
            "Streaming configuration updated"
        );
        self.emit(StreamingEvent::ConfigUpdated {
            preferred_quality: next.preferred_quality.as_str().to_string(),
            enable_caching: next.enable_caching,
            preload_next_track: next.preload_next_track,
            fallback_enabled: next.fallback_enabled,
        });
        next
    }

    // ------------------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------------------

    /// Produce a playable handle for `track`.
    ///
    /// Concurrent calls for the same track and tier share one download.
    #[instrument(skip(self, track), fields(track_id = %track.id, requested = %requested))]
    pub async fn get_stream_handle(
        &self,
        track: &SongDescriptor,
        requested: QualityTier,
    ) -> Result<StreamHandle> {
        self.set_state(&track.id, StreamState::Resolving);

        let result = self.resolve_handle(track, requested).await;
        match &result {
            Ok(handle) => {
                self.set_state(&track.id, StreamState::Ready);
                debug!(quality = %handle.quality, source = %handle.source, "Stream handle ready");
                self.emit(StreamingEvent::HandleResolved {
                    track_id: track.id.clone(),
                    quality: handle.quality.as_str().to_string(),
                    source: handle.source.as_str().to_string(),
                });
            }
            Err(e) if e.is_cancelled() => {
                self.set_state(&track.id, StreamState::Cancelled);
                debug!("Stream request cancelled");
            }
            Err(e) => {
                self.set_state(&track.id, StreamState::Failed);
                warn!(error = %e, "Failed to resolve stream");
                self.emit(StreamingEvent::ResolveFailed {
                    track_id: track.id.clone(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn resolve_handle(
        &self,
        track: &SongDescriptor,
        requested: QualityTier,
    ) -> Result<StreamHandle> {
        let config = self.config.snapshot();
        let network = self.network.latest();

        let available = if network.connected {
            track.available_qualities()
        } else {
            self.store.cached_qualities(&track.id)
        };
        let quality = resolve(requested, &available, &network, &config)
            .map_err(|e| e.for_track(&track.id))?;
        let identity = TrackIdentity::new(track.id.clone(), quality);

        if let Some(entry) = self.store.get(&identity) {
            self.set_state(&track.id, StreamState::CacheHit);
            return Ok(StreamHandle::cached(&entry));
        }
        self.set_state(&track.id, StreamState::CacheMiss);

        if !network.connected {
            return Err(StreamingError::Offline {
                track_id: track.id.clone(),
            });
        }
        let url = track
            .url_for(quality)
            .ok_or_else(|| StreamingError::NoStreamAvailable {
                track_id: track.id.clone(),
            })?;

        if !config.enable_caching {
            return Ok(StreamHandle::network(track.id.clone(), quality, url));
        }

        self.set_state(&track.id, StreamState::Downloading);
        let entry = self
            .coordinator
            .request(identity, url, DownloadPriority::Immediate)?
            .wait()
            .await?;
        Ok(StreamHandle::cached(&entry))
    }

    /// Warm the cache for `next` at the preferred tier. Returns `true` when a
    /// download was scheduled or joined. Failures are logged only.
    #[instrument(skip(self, next), fields(track_id = %next.id))]
    pub fn preload(&self, next: &SongDescriptor) -> bool {
        let config = self.config.snapshot();
        if !config.preload_next_track || !config.enable_caching {
            debug!("Preloading disabled");
            return false;
        }

        let network = self.network.latest();
        if !network.connected {
            debug!("Offline; skipping preload");
            return false;
        }

        let quality = match resolve(
            config.preferred_quality,
            &next.available_qualities(),
            &network,
            &config,
        ) {
            Ok(quality) => quality,
            Err(e) => {
                debug!(error = %e, "No tier to preload");
                return false;
            }
        };

        let identity = TrackIdentity::new(next.id.clone(), quality);
        if self.store.contains(&identity) {
            debug!(quality = %quality, "Already cached");
            return false;
        }
        let Some(url) = next.url_for(quality) else {
            return false;
        };

        // Players may call this from their own threads.
        let Some(runtime) = self.coordinator.runtime() else {
            warn!("No async runtime available; skipping preload");
            return false;
        };

        let handle = match self
            .coordinator
            .request(identity, url, DownloadPriority::Preload)
        {
            Ok(handle) => handle,
            Err(e) => {
                debug!(error = %e, "Preload not scheduled");
                return false;
            }
        };

        self.emit(StreamingEvent::PreloadScheduled {
            track_id: next.id.clone(),
            quality: quality.as_str().to_string(),
        });

        let track_id = next.id.clone();
        runtime.spawn(async move {
            match handle.wait().await {
                Ok(entry) => debug!(track_id = %track_id, size = entry.size_bytes, "Preload finished"),
                Err(e) if e.is_cancelled() => debug!(track_id = %track_id, "Preload cancelled"),
                Err(e) => warn!(track_id = %track_id, error = %e, "Preload failed"),
            }
        });
        true
    }

    /// Hook for the player: the current track started, `next` may follow.
    pub fn on_playback_started(&self, next: Option<&SongDescriptor>) -> bool {
        match next {
            Some(next) => self.preload(next),
            None => false,
        }
    }

    /// Cancel in-flight downloads for a skipped track.
    pub fn cancel_track(&self, track_id: &str) -> usize {
        let cancelled = self.coordinator.cancel_track(track_id);
        if cancelled > 0 {
            info!(track_id, cancelled, "Cancelled downloads for skipped track");
        }
        cancelled
    }

    // ------------------------------------------------------------------------
    // Cache management
    // ------------------------------------------------------------------------

    /// Cancel pending preloads, then remove every cached blob.
    #[instrument(skip(self))]
    pub async fn clear_cache(&self) -> Result<usize> {
        let cancelled = self.coordinator.cancel_preloads();
        let removed = self.store.clear().await;
        self.states.lock().clear();
        info!(removed, cancelled_preloads = cancelled, "Cleared track cache");
        Ok(removed)
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let store = self.store.stats();
        let network = self.network.latest();
        CacheStats {
            total_cached_tracks: store.entry_count,
            total_bytes: store.total_bytes,
            capacity_bytes: store.capacity_bytes,
            active_downloads: self.coordinator.active_count(),
            network_connected: network.connected,
            network_type: network.network_type,
        }
    }

    /// Lifecycle state of the latest request for `track_id`.
    pub fn stream_state(&self, track_id: &str) -> StreamState {
        self.states
            .lock()
            .peek(track_id)
            .copied()
            .unwrap_or(StreamState::Idle)
    }

    pub fn network(&self) -> &NetworkObserver {
        &self.network
    }

    /// Push a connectivity change from the host.
    pub fn set_network_state(&self, state: NetworkState) -> bool {
        self.network.update(state)
    }

    pub fn store(&self) -> &Arc<TrackCacheStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.coordinator
    }

    /// Stop the watcher, cancel downloads and flush access times.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.coordinator.shutdown();
        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "Failed to flush cache manifest on shutdown");
        }
    }

    fn set_state(&self, track_id: &str, state: StreamState) {
        self.states.lock().put(track_id.to_string(), state);
    }

    fn emit(&self, event: StreamingEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Streaming(event)).ok();
        }
    }
}

impl Drop for StreamingManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for StreamingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingManager")
            .field("config", &self.config.snapshot())
            .field("network", &self.network.latest())
            .field("store", &self.store.stats())
            .finish()
    }
}

/// Builder for [`StreamingManager`]. The cache store and HTTP client are
/// required; the network defaults to an observer that assumes connectivity.
#[derive(Default)]
pub struct StreamingManagerBuilder {
    config: Option<StreamingConfig>,
    store: Option<Arc<TrackCacheStore>>,
    http_client: Option<Arc<dyn HttpClient>>,
    network: Option<NetworkObserver>,
    download_settings: Option<DownloadSettings>,
    event_bus: Option<EventBus>,
    runtime: Option<Handle>,
}

impl StreamingManagerBuilder {
    pub fn config(mut self, config: StreamingConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<TrackCacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn network(mut self, network: NetworkObserver) -> Self {
        self.network = Some(network);
        self
    }

    pub fn download_settings(mut self, settings: DownloadSettings) -> Self {
        self.download_settings = Some(settings);
        self
    }

    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Runtime for download tasks. Defaults to the one current at `build`.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<StreamingManager> {
        let store = self.store.ok_or_else(|| StreamingError::CapabilityMissing {
            capability: "TrackCacheStore".to_string(),
            message: "Open a TrackCacheStore and pass it with .store(...)".to_string(),
        })?;
        let http_client = self
            .http_client
            .ok_or_else(|| StreamingError::CapabilityMissing {
                capability: "HttpClient".to_string(),
                message: "Provide an HttpClient implementation for media downloads"
                    .to_string(),
            })?;

        let settings = self.download_settings.unwrap_or_default();
        settings.validate()?;

        let network = self
            .network
            .unwrap_or_else(|| NetworkObserver::fixed(NetworkState::unknown()));
        let mut coordinator = DownloadCoordinator::new(
            store.clone(),
            http_client,
            network.clone(),
            settings,
            self.event_bus.clone(),
        );
        if let Some(handle) = self.runtime {
            coordinator = coordinator.with_runtime(handle);
        }

        let capacity = NonZeroUsize::new(TRACKED_STATES).unwrap_or(NonZeroUsize::MIN);
        Ok(StreamingManager {
            config: ConfigCell::new(self.config.unwrap_or_default()),
            store,
            coordinator,
            network,
            states: Mutex::new(LruCache::new(capacity)),
            event_bus: self.event_bus,
            shutdown: CancellationToken::new(),
        })
    }
}
