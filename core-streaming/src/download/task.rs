use crate::cache::CacheEntry;
use crate::error::{Result, StreamingError};
use crate::quality::TrackIdentity;
use core_runtime::config::CoreConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Scheduling class. `Immediate` outranks `Preload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPriority {
    Preload,
    Immediate,
}

impl DownloadPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadPriority::Preload => "preload",
            DownloadPriority::Immediate => "immediate",
        }
    }
}

impl fmt::Display for DownloadPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Succeeded | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

/// Snapshot of a live task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTaskInfo {
    pub identity: TrackIdentity,
    pub priority: DownloadPriority,
    pub state: DownloadState,
    pub bytes_downloaded: u64,
    /// From `Content-Length`, when the server sent one.
    pub total_bytes: Option<u64>,
    /// 1-based; 0 while queued.
    pub attempt: u32,
}

impl DownloadTaskInfo {
    pub fn progress_percentage(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) | None => None,
            Some(total) => Some((self.bytes_downloaded as f64 / total as f64) * 100.0),
        }
    }
}

pub(crate) type Outcome = Option<Result<CacheEntry>>;

/// Waiter side of a download. Every handle attached to the same task observes
/// the same outcome.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    identity: TrackIdentity,
    outcome: watch::Receiver<Outcome>,
}

impl DownloadHandle {
    pub(crate) fn new(identity: TrackIdentity, outcome: watch::Receiver<Outcome>) -> Self {
        Self { identity, outcome }
    }

    /// Handle that is already resolved to `entry`.
    pub(crate) fn ready(identity: TrackIdentity, entry: CacheEntry) -> Self {
        let (_, outcome) = watch::channel(Some(Ok(entry)));
        Self { identity, outcome }
    }

    pub fn identity(&self) -> &TrackIdentity {
        &self.identity
    }

    /// Outcome if the task already finished.
    pub fn try_result(&self) -> Option<Result<CacheEntry>> {
        self.outcome.borrow().clone()
    }

    /// Wait for the task to finish.
    pub async fn wait(mut self) -> Result<CacheEntry> {
        let resolved = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        // A dropped sender without an outcome means the coordinator went away.
        resolved.unwrap_or_else(|| {
            Err(StreamingError::Cancelled {
                track_id: self.identity.track_id.clone(),
                quality: self.identity.quality,
            })
        })
    }
}

/// Tuning for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub max_concurrent_downloads: usize,
    /// Bound on one attempt, headers through last chunk.
    pub download_timeout: Duration,
    /// Total attempts, retry included.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 2,
            download_timeout: Duration::from_secs(30),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl DownloadSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(StreamingError::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.download_timeout.is_zero() {
            return Err(StreamingError::Config(
                "download_timeout must be greater than 0".to_string(),
            ));
        }
        if !(1..=2).contains(&self.max_attempts) {
            return Err(StreamingError::Config(format!(
                "max_attempts must be 1 or 2, got {}",
                self.max_attempts
            )));
        }
        Ok(())
    }

    /// Slots preloads may occupy. One is kept free for immediate requests.
    pub(crate) fn preload_slots(&self) -> usize {
        if self.max_concurrent_downloads > 1 {
            self.max_concurrent_downloads - 1
        } else {
            self.max_concurrent_downloads
        }
    }
}

impl From<&CoreConfig> for DownloadSettings {
    fn from(config: &CoreConfig) -> Self {
        Self {
            max_concurrent_downloads: config.max_concurrent_downloads,
            download_timeout: config.download_timeout,
            max_attempts: config.max_download_attempts,
            retry_backoff: config.retry_backoff,
        }
    }
}

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Progress counters written by the running task and read by snapshots.
#[derive(Debug)]
pub(crate) struct TaskProgress {
    bytes: AtomicU64,
    total: AtomicU64,
    attempt: AtomicU32,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            total: AtomicU64::new(UNKNOWN_TOTAL),
            attempt: AtomicU32::new(0),
        }
    }
}

impl TaskProgress {
    pub(crate) fn begin_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.total.store(UNKNOWN_TOTAL, Ordering::Relaxed);
    }

    pub(crate) fn set_total(&self, total: Option<u64>) {
        self.total
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Relaxed);
    }

    pub(crate) fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::Relaxed) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }
}
