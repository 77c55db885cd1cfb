//! # Track Cache Store
//!
//! ## Concurrency
//!
//! - Index state (LRU order, byte counters) lives behind a `parking_lot`
//!   mutex held only for short, non-async sections.
//! - Writes for one identity are serialized by a keyed async mutex; writes
//!   for different identities run concurrently.
//! - Capacity is enforced under a single async eviction lock. A write first
//!   reserves its size, so `total + reserved <= capacity` holds at all times,
//!   even while blobs are still being written.
//! - Manifest writes are serialized and always persist the newest snapshot.

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::manifest::{Manifest, MANIFEST_FILE};
use super::stats::StoreStats;
use crate::error::{Result, StreamingError};
use crate::quality::{QualityTier, TrackIdentity};
use bridge_traits::{Clock, FileSystemAccess};
use bytes::Bytes;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use core_runtime::logging::strip_path;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const MEDIA_DIR: &str = "media";
const BLOB_EXTENSION: &str = "audio";

struct CacheIndex {
    /// Most recently used first.
    entries: LruCache<TrackIdentity, CacheEntry>,
    total_bytes: u64,
    reserved_bytes: u64,
    /// Access times changed since the last manifest write.
    dirty: bool,
}

impl CacheIndex {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
            reserved_bytes: 0,
            dirty: false,
        }
    }

    fn free_bytes(&self, capacity: u64) -> u64 {
        capacity.saturating_sub(self.total_bytes + self.reserved_bytes)
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.total_bytes += entry.size_bytes;
        if let Some((_, replaced)) = self.entries.push(entry.identity(), entry) {
            self.total_bytes -= replaced.size_bytes;
        }
        self.dirty = true;
    }

    fn detach(&mut self, identity: &TrackIdentity) -> Option<CacheEntry> {
        let entry = self.entries.pop(identity)?;
        self.total_bytes -= entry.size_bytes;
        self.dirty = true;
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, entry) = self.entries.pop_lru()?;
        self.total_bytes -= entry.size_bytes;
        self.dirty = true;
        Some(entry)
    }

    /// Least recently used first, the order the manifest is written in.
    fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.iter().rev().map(|(_, e)| e.clone()).collect()
    }
}

/// Keyed async mutex. Map entries are dropped once no one holds or awaits them.
#[derive(Default)]
struct IdentityLocks {
    locks: Mutex<HashMap<TrackIdentity, Arc<AsyncMutex<()>>>>,
}

impl IdentityLocks {
    async fn lock(&self, identity: &TrackIdentity) -> IdentityGuard<'_> {
        let lock = self.locks.lock().entry(identity.clone()).or_default().clone();
        let guard = lock.clone().lock_owned().await;
        IdentityGuard {
            locks: self,
            identity: identity.clone(),
            lock,
            guard: Some(guard),
        }
    }
}

struct IdentityGuard<'a> {
    locks: &'a IdentityLocks,
    identity: TrackIdentity,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.identity);
        }
    }
}

/// Bytes promised to an in-flight write. Released on drop unless committed.
struct Reservation<'a> {
    index: &'a Mutex<CacheIndex>,
    bytes: u64,
    active: bool,
}

impl Reservation<'_> {
    fn commit(mut self, entry: CacheEntry) {
        let mut index = self.index.lock();
        index.reserved_bytes -= self.bytes;
        index.insert(entry);
        self.active = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.index.lock().reserved_bytes -= self.bytes;
        }
    }
}

/// Capacity-bounded LRU store of audio blobs.
pub struct TrackCacheStore {
    fs: Arc<dyn FileSystemAccess>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    root: PathBuf,
    media_dir: PathBuf,
    index: Mutex<CacheIndex>,
    identity_locks: IdentityLocks,
    capacity_lock: AsyncMutex<()>,
    manifest_lock: AsyncMutex<()>,
    event_bus: Option<EventBus>,
}

impl TrackCacheStore {
    /// Open the store under `<host cache dir>/<cache_directory>` and reconcile
    /// the manifest with the blobs on disk.
    #[instrument(skip(fs, clock, config), fields(capacity = config.max_cache_size_bytes))]
    pub async fn open(
        fs: Arc<dyn FileSystemAccess>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Result<Self> {
        config.validate()?;

        let root = fs.get_cache_directory().await?.join(&config.cache_directory);
        let media_dir = root.join(MEDIA_DIR);
        fs.create_dir_all(&media_dir).await?;

        let store = Self {
            fs,
            clock,
            config,
            root,
            media_dir,
            index: Mutex::new(CacheIndex::new()),
            identity_locks: IdentityLocks::default(),
            capacity_lock: AsyncMutex::new(()),
            manifest_lock: AsyncMutex::new(()),
            event_bus: None,
        };
        store.reconcile().await?;
        Ok(store)
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.config.max_cache_size_bytes
    }

    /// Store `data` for `identity`, replacing any existing blob.
    #[instrument(skip(self, identity, data), fields(identity = %identity, size = data.len()))]
    pub async fn put(&self, identity: &TrackIdentity, data: Bytes) -> Result<CacheEntry> {
        let size = data.len() as u64;
        let capacity = self.capacity_bytes();
        if size > capacity {
            return Err(StreamingError::StorageFull {
                required: size,
                capacity,
            });
        }

        let _identity_guard = self.identity_locks.lock(identity).await;

        // The old entry stays counted and evictable until space is secured,
        // so a refused replacement leaves it intact.
        let reservation = self.reserve(size).await?;

        let previous = self.index.lock().detach(identity);
        if let Some(previous) = previous {
            debug!(file = %display_name(&previous.local_path), "Replacing cached blob");
            self.delete_blob(&previous.local_path).await;
        }

        let path = self.media_dir.join(blob_file_name(identity));
        if let Err(e) = self.fs.write_file(&path, data).await {
            warn!(error = %e, file = %display_name(&path), "Failed to write blob");
            self.delete_blob(&path).await;
            return Err(e.into());
        }

        let now = self.clock.now();
        let entry = CacheEntry {
            track_id: identity.track_id.clone(),
            quality: identity.quality,
            local_path: path,
            size_bytes: size,
            created_at: now,
            last_accessed_at: now,
        };
        reservation.commit(entry.clone());
        self.persist_or_log().await;

        debug!("Stored blob");
        self.emit(CacheEvent::EntryStored {
            track_id: entry.track_id.clone(),
            quality: entry.quality.as_str().to_string(),
            size_bytes: size,
        });
        Ok(entry)
    }

    /// Look up an entry and mark it most recently used. Performs no I/O; the
    /// new access time reaches disk with the next manifest write.
    pub fn get(&self, identity: &TrackIdentity) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut index = self.index.lock();
        let entry = index.entries.get_mut(identity)?;
        entry.last_accessed_at = now;
        let entry = entry.clone();
        index.dirty = true;
        Some(entry)
    }

    /// Membership check that does not touch LRU order.
    pub fn contains(&self, identity: &TrackIdentity) -> bool {
        self.index.lock().entries.contains(identity)
    }

    pub fn cached_qualities(&self, track_id: &str) -> BTreeSet<QualityTier> {
        self.index
            .lock()
            .entries
            .iter()
            .filter(|(identity, _)| identity.track_id == track_id)
            .map(|(identity, _)| identity.quality)
            .collect()
    }

    /// Remove an entry and its blob. Returns `false` if nothing was cached.
    #[instrument(skip(self, identity), fields(identity = %identity))]
    pub async fn remove(&self, identity: &TrackIdentity) -> Result<bool> {
        self.remove_matching(identity, None).await
    }

    /// Remove `entry` only if it is still the stored blob for its identity.
    pub async fn remove_entry(&self, entry: &CacheEntry) -> Result<bool> {
        self.remove_matching(&entry.identity(), Some(&entry.local_path))
            .await
    }

    async fn remove_matching(
        &self,
        identity: &TrackIdentity,
        expected_path: Option<&Path>,
    ) -> Result<bool> {
        let _identity_guard = self.identity_locks.lock(identity).await;

        let removed = {
            let mut index = self.index.lock();
            let matches = match (index.entries.peek(identity), expected_path) {
                (Some(current), Some(expected)) => current.local_path.as_path() == expected,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if matches {
                index.detach(identity)
            } else {
                None
            }
        };

        let Some(entry) = removed else {
            return Ok(false);
        };

        self.persist_or_log().await;
        match self.fs.delete_file(&entry.local_path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        debug!("Removed cached blob");
        self.emit(CacheEvent::EntryRemoved {
            track_id: entry.track_id,
            quality: entry.quality.as_str().to_string(),
        });
        Ok(true)
    }

    /// Remove every entry. Returns the number of entries removed.
    ///
    /// The empty manifest is written before any blob is deleted, so an
    /// interrupted clear leaves only orphans for the next `open` to sweep.
    /// Per-file failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> usize {
        let _capacity_guard = self.capacity_lock.lock().await;

        let drained = {
            let mut index = self.index.lock();
            let mut drained = Vec::with_capacity(index.entries.len());
            while let Some(entry) = index.pop_lru() {
                drained.push(entry);
            }
            drained
        };

        self.persist_or_log().await;
        for entry in &drained {
            self.delete_blob(&entry.local_path).await;
        }

        info!(removed = drained.len(), "Cache cleared");
        self.emit(CacheEvent::Cleared {
            removed: drained.len(),
        });
        drained.len()
    }

    /// Evict least recently used entries until `required` bytes are free.
    /// Returns the number of entries evicted.
    pub async fn evict_to_fit(&self, required: u64) -> usize {
        let _capacity_guard = self.capacity_lock.lock().await;
        let evicted = self.evict_locked(required).await;
        if evicted > 0 {
            self.persist_or_log().await;
        }
        evicted
    }

    pub fn stats(&self) -> StoreStats {
        let index = self.index.lock();
        StoreStats {
            entry_count: index.entries.len(),
            total_bytes: index.total_bytes,
            reserved_bytes: index.reserved_bytes,
            capacity_bytes: self.capacity_bytes(),
        }
    }

    /// Persist the manifest if access times changed since the last write.
    pub async fn flush(&self) -> Result<()> {
        if self.index.lock().dirty {
            self.persist().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn reserve(&self, size: u64) -> Result<Reservation<'_>> {
        let _capacity_guard = self.capacity_lock.lock().await;
        let capacity = self.capacity_bytes();

        let reserved = self.index.lock().reserved_bytes;
        if capacity.saturating_sub(reserved) < size {
            return Err(StreamingError::StorageFull {
                required: size,
                capacity,
            });
        }

        self.evict_locked(size).await;

        // Space only grows outside the eviction lock, so this check holds
        // until the reservation is released.
        let mut index = self.index.lock();
        if index.free_bytes(capacity) < size {
            return Err(StreamingError::StorageFull {
                required: size,
                capacity,
            });
        }
        index.reserved_bytes += size;
        Ok(Reservation {
            index: &self.index,
            bytes: size,
            active: true,
        })
    }

    /// Caller holds `capacity_lock`.
    async fn evict_locked(&self, required: u64) -> usize {
        let capacity = self.capacity_bytes();
        let evicted = {
            let mut index = self.index.lock();
            let mut evicted = Vec::new();
            while index.free_bytes(capacity) < required {
                match index.pop_lru() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
            evicted
        };

        for entry in &evicted {
            debug!(
                identity = %entry.identity(),
                size = entry.size_bytes,
                "Evicting cached blob"
            );
            self.delete_blob(&entry.local_path).await;
            self.emit(CacheEvent::EntryEvicted {
                track_id: entry.track_id.clone(),
                quality: entry.quality.as_str().to_string(),
                size_bytes: entry.size_bytes,
            });
        }
        evicted.len()
    }

    async fn reconcile(&self) -> Result<()> {
        let manifest_path = self.manifest_path();
        let loaded = match self.fs.read_file(&manifest_path).await {
            Ok(data) => match Manifest::from_slice(&data) {
                Ok(manifest) => manifest.entries,
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable cache manifest");
                    Vec::new()
                }
            },
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let loaded_count = loaded.len();

        let mut kept = Vec::with_capacity(loaded_count);
        for mut entry in loaded {
            let Some(file_name) = entry.local_path.file_name().map(OsString::from) else {
                continue;
            };
            // The host cache directory may move between launches.
            let path = self.media_dir.join(file_name);
            match self.fs.metadata(&path).await {
                Ok(meta) if !meta.is_directory && meta.size == entry.size_bytes => {
                    entry.local_path = path;
                    kept.push(entry);
                }
                Ok(_) => debug!(file = %display_name(&path), "Dropping entry with mismatched blob"),
                Err(e) if e.is_not_found() => {
                    debug!(file = %display_name(&path), "Dropping entry with missing blob")
                }
                Err(e) => return Err(e.into()),
            }
        }

        kept.sort_by(|a, b| {
            (a.last_accessed_at, a.created_at).cmp(&(b.last_accessed_at, b.created_at))
        });

        let capacity = self.capacity_bytes();
        let (referenced, over_capacity) = {
            let mut index = self.index.lock();
            for entry in kept {
                index.insert(entry);
            }
            let mut over_capacity = 0usize;
            while index.total_bytes > capacity {
                if index.pop_lru().is_none() {
                    break;
                }
                over_capacity += 1;
            }
            let referenced: HashSet<OsString> = index
                .entries
                .iter()
                .filter_map(|(_, e)| e.local_path.file_name().map(OsString::from))
                .collect();
            index.dirty = true;
            (referenced, over_capacity)
        };

        let orphans = self.sweep_orphans(&referenced).await?;
        self.persist().await?;

        let stats = self.stats();
        info!(
            loaded = loaded_count,
            entries = stats.entry_count,
            total_bytes = stats.total_bytes,
            over_capacity,
            orphans,
            "Track cache opened"
        );
        Ok(())
    }

    /// Delete media files not referenced by the index and stale temp files.
    async fn sweep_orphans(&self, referenced: &HashSet<OsString>) -> Result<usize> {
        let mut removed = 0;

        for path in self.fs.list_directory(&self.media_dir).await? {
            let keep = path
                .file_name()
                .map(|name| referenced.contains(name))
                .unwrap_or(false);
            if !keep && self.delete_blob(&path).await {
                removed += 1;
            }
        }

        for path in self.fs.list_directory(&self.root).await? {
            let is_temp = path.extension().map(|ext| ext == "tmp").unwrap_or(false);
            if is_temp && self.delete_blob(&path).await {
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn persist(&self) -> Result<()> {
        let _manifest_guard = self.manifest_lock.lock().await;

        let manifest = {
            let mut index = self.index.lock();
            index.dirty = false;
            Manifest::new(index.snapshot())
        };

        let written = match manifest.to_vec() {
            Ok(data) => self
                .fs
                .write_file_atomic(&self.manifest_path(), Bytes::from(data))
                .await
                .map_err(StreamingError::from),
            Err(e) => Err(e),
        };
        if written.is_err() {
            self.index.lock().dirty = true;
        }
        written
    }

    async fn persist_or_log(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist cache manifest");
        }
    }

    /// Best-effort delete. Returns `true` if a file was removed.
    async fn delete_blob(&self, path: &Path) -> bool {
        match self.fs.delete_file(path).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                warn!(error = %e, file = %display_name(path), "Failed to delete cached file");
                false
            }
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Cache(event)).ok();
        }
    }
}

impl std::fmt::Debug for TrackCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackCacheStore")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// `<sha256(track_id)[..16]>-<quality>-<uuid>.audio`. The random suffix keeps
/// a replacement from ever overwriting a blob a reader may still hold.
fn blob_file_name(identity: &TrackIdentity) -> String {
    let digest = hex::encode(Sha256::digest(identity.track_id.as_bytes()));
    format!(
        "{}-{}-{}.{}",
        &digest[..16],
        identity.quality.as_str(),
        Uuid::new_v4().simple(),
        BLOB_EXTENSION
    )
}

fn display_name(path: &Path) -> String {
    strip_path(&path.to_string_lossy()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(track_id: &str, size: u64) -> CacheEntry {
        let now = chrono::Utc::now();
        CacheEntry {
            track_id: track_id.to_string(),
            quality: QualityTier::Kbps128,
            local_path: PathBuf::from(format!("/cache/media/{track_id}.audio")),
            size_bytes: size,
            created_at: now,
            last_accessed_at: now,
        }
    }

    #[test]
    fn test_blob_file_name_shape() {
        let identity = TrackIdentity::new("track-1", QualityTier::Kbps48);
        let name = blob_file_name(&identity);
        let parts: Vec<&str> = name.splitn(3, '-').collect();

        assert_eq!(parts[0].len(), 16);
        assert_eq!(parts[1], "48kbps");
        assert!(name.ends_with(".audio"));
        assert_ne!(name, blob_file_name(&identity));
    }

    #[test]
    fn test_index_accounting() {
        let mut index = CacheIndex::new();
        index.insert(entry("a", 10));
        index.insert(entry("b", 20));
        assert_eq!(index.total_bytes, 30);

        // Same identity replaces.
        index.insert(entry("a", 5));
        assert_eq!(index.total_bytes, 25);
        assert_eq!(index.entries.len(), 2);

        let lru = index.pop_lru().unwrap();
        assert_eq!(lru.track_id, "b");
        assert_eq!(index.total_bytes, 5);
        assert_eq!(index.free_bytes(4), 0);
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let index = Mutex::new(CacheIndex::new());
        index.lock().reserved_bytes = 10;
        {
            let _reservation = Reservation {
                index: &index,
                bytes: 10,
                active: true,
            };
        }
        assert_eq!(index.lock().reserved_bytes, 0);

        index.lock().reserved_bytes = 7;
        let reservation = Reservation {
            index: &index,
            bytes: 7,
            active: true,
        };
        reservation.commit(entry("c", 7));
        let index = index.lock();
        assert_eq!(index.reserved_bytes, 0);
        assert_eq!(index.total_bytes, 7);
    }

    #[tokio::test]
    async fn test_identity_locks_are_released() {
        let locks = IdentityLocks::default();
        let identity = TrackIdentity::new("t", QualityTier::Kbps12);
        {
            let _guard = locks.lock(&identity).await;
            assert_eq!(locks.locks.lock().len(), 1);
        }
        assert!(locks.locks.lock().is_empty());
    }
}
