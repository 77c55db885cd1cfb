//! Shared in-memory fakes for the streaming integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result};
use bridge_traits::{
    ByteStream, Clock, FileMetadata, FileSystemAccess, HttpClient, HttpRequest, HttpResponse,
    NetworkChangeStream, NetworkInfo, NetworkMonitor,
};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use core_streaming::{CacheConfig, QualityTier, SongDescriptor, TrackCacheStore};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// File system
// ============================================================================

/// Flat map of paths to contents rooted at `/cache`.
pub struct MemoryFileSystem {
    base: PathBuf,
    files: Mutex<HashMap<PathBuf, Bytes>>,
    dirs: Mutex<HashSet<PathBuf>>,
    fail_blob_writes: AtomicBool,
    /// Blob writes wait while this is `false`.
    blob_gate: watch::Sender<bool>,
    writes: AtomicUsize,
}

impl MemoryFileSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: PathBuf::from("/cache"),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashSet::new()),
            fail_blob_writes: AtomicBool::new(false),
            blob_gate: watch::channel(true).0,
            writes: AtomicUsize::new(0),
        })
    }

    pub fn hold_blob_writes(&self) {
        self.blob_gate.send_replace(false);
    }

    pub fn release_blob_writes(&self) {
        self.blob_gate.send_replace(true);
    }

    pub fn fail_blob_writes(&self, fail: bool) {
        self.fail_blob_writes.store(fail, Ordering::SeqCst);
    }

    pub fn insert_file(&self, path: impl Into<PathBuf>, data: &[u8]) {
        self.files
            .lock()
            .insert(path.into(), Bytes::copy_from_slice(data));
    }

    pub fn read(&self, path: &Path) -> Option<Bytes> {
        self.files.lock().get(path).cloned()
    }

    pub fn has_file(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    /// Files directly inside `dir`.
    pub fn files_in(&self, dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<_> = self
            .files
            .lock()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect();
        files.sort();
        files
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileSystemAccess for MemoryFileSystem {
    async fn get_cache_directory(&self) -> Result<PathBuf> {
        Ok(self.base.clone())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.files.lock().contains_key(path) || self.dirs.lock().contains(path))
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        if let Some(data) = self.files.lock().get(path) {
            return Ok(FileMetadata {
                size: data.len() as u64,
                modified_at: None,
                is_directory: false,
            });
        }
        if self.dirs.lock().contains(path) {
            return Ok(FileMetadata {
                size: 0,
                modified_at: None,
                is_directory: true,
            });
        }
        Err(BridgeError::NotFound(path.display().to_string()))
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut dirs = self.dirs.lock();
        for ancestor in path.ancestors() {
            dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(path.display().to_string()))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        let is_blob = path.extension().map(|e| e == "audio").unwrap_or(false);
        if is_blob {
            let mut gate = self.blob_gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
            if self.fail_blob_writes.load(Ordering::SeqCst) {
                return Err(BridgeError::OperationFailed("disk full".to_string()));
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.files.lock().insert(path.to_path_buf(), data);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(from)
            .ok_or_else(|| BridgeError::NotFound(from.display().to_string()))?;
        files.insert(to.to_path_buf(), data);
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| BridgeError::NotFound(path.display().to_string()))
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries: Vec<PathBuf> = self
            .files
            .lock()
            .keys()
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        entries.extend(
            self.dirs
                .lock()
                .iter()
                .filter(|p| p.parent() == Some(path))
                .cloned(),
        );
        Ok(entries)
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Network
// ============================================================================

pub struct FakeNetworkMonitor {
    info: watch::Sender<NetworkInfo>,
}

impl FakeNetworkMonitor {
    pub fn new(initial: NetworkInfo) -> Arc<Self> {
        let (info, _) = watch::channel(initial);
        Arc::new(Self { info })
    }

    pub fn set(&self, info: NetworkInfo) {
        self.info.send_replace(info);
    }
}

struct FakeChangeStream {
    rx: watch::Receiver<NetworkInfo>,
}

#[async_trait]
impl NetworkChangeStream for FakeChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[async_trait]
impl NetworkMonitor for FakeNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        Ok(self.info.borrow().clone())
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(FakeChangeStream {
            rx: self.info.subscribe(),
        }))
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Serves registered bodies in two chunks. While the gate is closed, chunks
/// are held back, which keeps downloads in flight for as long as a test needs.
pub struct GatedHttpClient {
    bodies: Mutex<HashMap<String, Bytes>>,
    statuses: Mutex<HashMap<String, u16>>,
    requests: Mutex<Vec<String>>,
    gate: watch::Sender<bool>,
}

impl GatedHttpClient {
    pub fn new() -> Arc<Self> {
        Self::with_gate(true)
    }

    pub fn closed() -> Arc<Self> {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> Arc<Self> {
        let (gate, _) = watch::channel(open);
        Arc::new(Self {
            bodies: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            gate,
        })
    }

    pub fn serve(&self, url: impl Into<String>, body: &[u8]) {
        self.bodies
            .lock()
            .insert(url.into(), Bytes::copy_from_slice(body));
    }

    pub fn fail_with(&self, url: impl Into<String>, status: u16) {
        self.statuses.lock().insert(url.into(), status);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|u| *u == url).count()
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpClient for GatedHttpClient {
    async fn download_stream(&self, request: HttpRequest) -> Result<(HttpResponse, ByteStream)> {
        self.requests.lock().push(request.url.clone());

        if let Some(status) = self.statuses.lock().get(&request.url).copied() {
            return Err(BridgeError::HttpStatus {
                status,
                url: request.url,
            });
        }
        let body = self.bodies.lock().get(&request.url).cloned().ok_or_else(|| {
            BridgeError::HttpStatus {
                status: 404,
                url: request.url.clone(),
            }
        })?;

        let split = body.len() / 2;
        let chunks = vec![body.slice(..split), body.slice(split..)];
        let gate = self.gate.subscribe();
        let stream = futures::stream::iter(chunks)
            .then(move |chunk| {
                let mut gate = gate.clone();
                async move {
                    let _ = gate.wait_for(|open| *open).await;
                    Ok::<_, BridgeError>(chunk)
                }
            })
            .boxed();

        let response = HttpResponse {
            status: 200,
            headers: HashMap::new(),
            content_length: Some(body.len() as u64),
        };
        Ok((response, stream))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn url(track_id: &str, quality: QualityTier) -> String {
    format!("https://cdn.test/{track_id}/{quality}?sig=secret")
}

pub fn song(track_id: &str, qualities: &[QualityTier]) -> SongDescriptor {
    qualities.iter().fold(
        SongDescriptor::new(track_id, Duration::from_secs(180)),
        |song, q| song.with_url(*q, url(track_id, *q)),
    )
}

/// Register a body of `size` bytes for every URL of `song`.
pub fn serve_song(http: &GatedHttpClient, song: &SongDescriptor, size: usize) {
    for url in song.quality_urls.values() {
        http.serve(url.clone(), &vec![7u8; size]);
    }
}

pub async fn open_store(
    fs: &Arc<MemoryFileSystem>,
    clock: &Arc<ManualClock>,
    capacity: u64,
) -> Arc<TrackCacheStore> {
    let store = TrackCacheStore::open(
        fs.clone(),
        clock.clone(),
        CacheConfig::default().with_max_size_bytes(capacity),
    )
    .await
    .expect("store should open");
    Arc::new(store)
}

pub fn media_dir() -> PathBuf {
    PathBuf::from("/cache/track-cache/media")
}

pub fn manifest_path() -> PathBuf {
    PathBuf::from("/cache/track-cache/manifest.json")
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
