use super::task::{
    DownloadHandle, DownloadPriority, DownloadSettings, DownloadState, DownloadTaskInfo, Outcome,
    TaskProgress,
};
use crate::cache::{CacheEntry, TrackCacheStore};
use crate::error::{Result, StreamingError};
use crate::network::NetworkObserver;
use crate::quality::TrackIdentity;
use bridge_traits::{BridgeError, HttpClient, HttpRequest};
use bytes::{Bytes, BytesMut};
use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
use core_runtime::logging::redact_url;
use futures::StreamExt;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Live task bookkeeping. Removed from the map when the task finishes or is
/// cancelled; waiters keep the outcome channel.
struct TaskSlot {
    task_id: u64,
    source_url: String,
    priority: DownloadPriority,
    state: DownloadState,
    cancel: CancellationToken,
    outcome: watch::Sender<Outcome>,
    progress: Arc<TaskProgress>,
}

/// Heap item. Items whose slot no longer matches are skipped when popped.
#[derive(Debug, PartialEq, Eq)]
struct QueuedTask {
    priority: DownloadPriority,
    seq: u64,
    task_id: u64,
    identity: TrackIdentity,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TrackIdentity, TaskSlot>,
    queue: BinaryHeap<QueuedTask>,
    /// Running task ids and the class they count against.
    running: HashMap<u64, DownloadPriority>,
    next_task_id: u64,
    next_seq: u64,
    shutdown: bool,
}

impl SchedulerState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Join an existing task, upgrading its priority if needed.
    fn attach(
        &mut self,
        identity: &TrackIdentity,
        priority: DownloadPriority,
    ) -> Option<DownloadHandle> {
        let seq = self.next_seq + 1;
        let slot = self.tasks.get_mut(identity)?;

        if priority > slot.priority {
            slot.priority = priority;
            match slot.state {
                DownloadState::Queued => {
                    self.next_seq = seq;
                    self.queue.push(QueuedTask {
                        priority,
                        seq,
                        task_id: slot.task_id,
                        identity: identity.clone(),
                    });
                }
                DownloadState::Running => {
                    self.running.insert(slot.task_id, priority);
                }
                _ => {}
            }
            debug!(identity = %identity, priority = priority.as_str(), "Upgraded download priority");
        }

        Some(DownloadHandle::new(
            identity.clone(),
            slot.outcome.subscribe(),
        ))
    }

    fn enqueue(
        &mut self,
        identity: TrackIdentity,
        source_url: &str,
        priority: DownloadPriority,
    ) -> DownloadHandle {
        self.next_task_id += 1;
        let task_id = self.next_task_id;
        let seq = self.next_seq();
        let (outcome, receiver) = watch::channel(None);

        self.queue.push(QueuedTask {
            priority,
            seq,
            task_id,
            identity: identity.clone(),
        });
        self.tasks.insert(
            identity.clone(),
            TaskSlot {
                task_id,
                source_url: source_url.to_string(),
                priority,
                state: DownloadState::Queued,
                cancel: CancellationToken::new(),
                outcome,
                progress: Arc::new(TaskProgress::default()),
            },
        );
        DownloadHandle::new(identity, receiver)
    }

    fn is_live(&self, item: &QueuedTask) -> bool {
        self.tasks.get(&item.identity).is_some_and(|slot| {
            slot.task_id == item.task_id
                && slot.state == DownloadState::Queued
                && slot.priority == item.priority
        })
    }

    fn running_preloads(&self) -> usize {
        self.running
            .values()
            .filter(|p| **p == DownloadPriority::Preload)
            .count()
    }
}

/// Everything a spawned task needs, captured at launch.
struct TaskLaunch {
    identity: TrackIdentity,
    task_id: u64,
    source_url: String,
    cancel: CancellationToken,
    progress: Arc<TaskProgress>,
}

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    Cancelled,
    TimedOut,
    /// Body larger than the whole cache.
    TooLarge(u64),
    Transient(String),
    Permanent(String),
}

impl AttemptError {
    fn from_bridge(err: BridgeError) -> Self {
        match &err {
            BridgeError::HttpStatus { status, .. }
                if (400..500).contains(status) && *status != 408 && *status != 429 =>
            {
                AttemptError::Permanent(err.to_string())
            }
            BridgeError::NotFound(_) => AttemptError::Permanent(err.to_string()),
            _ => AttemptError::Transient(err.to_string()),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::TimedOut | AttemptError::Transient(_))
    }

    fn into_streaming_error(
        self,
        identity: &TrackIdentity,
        settings: &DownloadSettings,
        capacity: u64,
    ) -> StreamingError {
        let track_id = identity.track_id.clone();
        let quality = identity.quality;
        match self {
            AttemptError::Cancelled => StreamingError::Cancelled { track_id, quality },
            AttemptError::TimedOut => StreamingError::DownloadTimeout {
                track_id,
                quality,
                timeout: settings.download_timeout,
            },
            AttemptError::TooLarge(required) => StreamingError::DownloadFailed {
                track_id,
                quality,
                cause: StreamingError::StorageFull { required, capacity }.to_string(),
            },
            AttemptError::Transient(cause) | AttemptError::Permanent(cause) => {
                StreamingError::DownloadFailed {
                    track_id,
                    quality,
                    cause,
                }
            }
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Cancelled => f.write_str("cancelled"),
            AttemptError::TimedOut => f.write_str("timed out"),
            AttemptError::TooLarge(size) => write!(f, "body of {size} bytes exceeds cache capacity"),
            AttemptError::Transient(cause) | AttemptError::Permanent(cause) => f.write_str(cause),
        }
    }
}

struct CoordinatorInner {
    store: Arc<TrackCacheStore>,
    http_client: Arc<dyn HttpClient>,
    network: NetworkObserver,
    settings: DownloadSettings,
    state: Mutex<SchedulerState>,
    event_bus: Option<EventBus>,
    /// Runtime that drives download tasks. Captured at construction when
    /// one is current, otherwise adopted from the first caller inside one.
    runtime: Mutex<Option<Handle>>,
}

/// Schedules and runs downloads into a [`TrackCacheStore`].
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DownloadCoordinator {
    pub fn new(
        store: Arc<TrackCacheStore>,
        http_client: Arc<dyn HttpClient>,
        network: NetworkObserver,
        settings: DownloadSettings,
        event_bus: Option<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                http_client,
                network,
                settings,
                state: Mutex::new(SchedulerState::default()),
                event_bus,
                runtime: Mutex::new(Handle::try_current().ok()),
            }),
        }
    }

    /// Run download tasks on `handle` regardless of the caller's context.
    pub fn with_runtime(self, handle: Handle) -> Self {
        *self.inner.runtime.lock() = Some(handle);
        self
    }

    /// Runtime used to spawn work, if one is known.
    pub fn runtime(&self) -> Option<Handle> {
        let mut runtime = self.inner.runtime.lock();
        if runtime.is_none() {
            *runtime = Handle::try_current().ok();
        }
        runtime.clone()
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.inner.settings
    }

    /// Request `identity` from `source_url`.
    ///
    /// Attaches to a live task for the same identity, resolves at once from
    /// the cache, or enqueues a new task. Refuses new fetches while offline.
    #[instrument(skip(self, identity, source_url, priority), fields(identity = %identity, priority = priority.as_str()))]
    pub fn request(
        &self,
        identity: TrackIdentity,
        source_url: &str,
        priority: DownloadPriority,
    ) -> Result<DownloadHandle> {
        let handle = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(StreamingError::Cancelled {
                    track_id: identity.track_id,
                    quality: identity.quality,
                });
            }

            if let Some(handle) = state.attach(&identity, priority) {
                drop(state);
                debug!("Attached to in-flight download");
                // An upgraded item may now fit a free slot.
                self.dispatch();
                return Ok(handle);
            }

            if let Some(entry) = self.inner.store.get(&identity) {
                return Ok(DownloadHandle::ready(identity, entry));
            }

            if !self.inner.network.latest().connected {
                return Err(StreamingError::Offline {
                    track_id: identity.track_id,
                });
            }

            state.enqueue(identity.clone(), source_url, priority)
        };

        debug!(url = redact_url(source_url), "Download queued");
        self.emit(DownloadEvent::Queued {
            track_id: identity.track_id.clone(),
            quality: identity.quality.as_str().to_string(),
            priority: priority.as_str().to_string(),
        });
        self.dispatch();
        Ok(handle)
    }

    /// Cancel the live task for `identity`. Waiters resolve with `Cancelled`.
    pub fn cancel(&self, identity: &TrackIdentity) -> bool {
        let slot = self.inner.state.lock().tasks.remove(identity);
        match slot {
            Some(slot) => {
                self.abort_slot(identity, slot);
                true
            }
            None => false,
        }
    }

    /// Cancel every quality of `track_id`. Returns the number cancelled.
    pub fn cancel_track(&self, track_id: &str) -> usize {
        self.cancel_where(|identity, _| identity.track_id == track_id)
    }

    /// Cancel all preload-class tasks. Returns the number cancelled.
    pub fn cancel_preloads(&self) -> usize {
        self.cancel_where(|_, slot| slot.priority == DownloadPriority::Preload)
    }

    /// Cancel everything and refuse new requests.
    pub fn shutdown(&self) {
        let slots: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.queue.clear();
            state.tasks.drain().collect()
        };
        let count = slots.len();
        for (identity, slot) in slots {
            self.abort_slot(&identity, slot);
        }
        info!(cancelled = count, "Download coordinator shut down");
    }

    /// Snapshot of queued and running tasks, oldest first.
    pub fn active_tasks(&self) -> Vec<DownloadTaskInfo> {
        let state = self.inner.state.lock();
        let mut tasks: Vec<_> = state
            .tasks
            .iter()
            .map(|(identity, slot)| {
                (
                    slot.task_id,
                    DownloadTaskInfo {
                        identity: identity.clone(),
                        priority: slot.priority,
                        state: slot.state,
                        bytes_downloaded: slot.progress.bytes(),
                        total_bytes: slot.progress.total(),
                        attempt: slot.progress.attempt(),
                    },
                )
            })
            .collect();
        tasks.sort_by_key(|(task_id, _)| *task_id);
        tasks.into_iter().map(|(_, info)| info).collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running.len()
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    fn cancel_where(&self, predicate: impl Fn(&TrackIdentity, &TaskSlot) -> bool) -> usize {
        let slots: Vec<_> = {
            let mut state = self.inner.state.lock();
            let doomed: Vec<_> = state
                .tasks
                .iter()
                .filter(|(identity, slot)| predicate(*identity, *slot))
                .map(|(identity, _)| identity.clone())
                .collect();
            doomed
                .into_iter()
                .filter_map(|identity| state.tasks.remove_entry(&identity))
                .collect()
        };
        let count = slots.len();
        for (identity, slot) in slots {
            self.abort_slot(&identity, slot);
        }
        count
    }

    fn abort_slot(&self, identity: &TrackIdentity, slot: TaskSlot) {
        slot.cancel.cancel();
        slot.outcome.send_replace(Some(Err(StreamingError::Cancelled {
            track_id: identity.track_id.clone(),
            quality: identity.quality,
        })));
        info!(identity = %identity, state = ?slot.state, "Download cancelled");
        self.emit(DownloadEvent::Cancelled {
            track_id: identity.track_id.clone(),
            quality: identity.quality.as_str().to_string(),
        });
    }

    /// Start queued tasks while slots are free.
    ///
    /// Without a runtime nothing leaves the queue; the next call made from
    /// inside one picks the work up.
    fn dispatch(&self) {
        let Some(runtime) = self.runtime() else {
            warn!("No async runtime available; downloads stay queued");
            return;
        };
        let max = self.inner.settings.max_concurrent_downloads;
        let preload_slots = self.inner.settings.preload_slots();

        let launches = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let mut launches = Vec::new();
            if state.shutdown {
                return;
            }

            while state.running.len() < max {
                let Some(top) = state.queue.peek() else {
                    break;
                };
                if !state.is_live(top) {
                    state.queue.pop();
                    continue;
                }
                // Immediate items always sort first, so nothing runnable is
                // left behind a blocked preload.
                if top.priority == DownloadPriority::Preload
                    && state.running_preloads() >= preload_slots
                {
                    break;
                }

                let Some(item) = state.queue.pop() else {
                    break;
                };
                let Some(slot) = state.tasks.get_mut(&item.identity) else {
                    continue;
                };
                slot.state = DownloadState::Running;
                state.running.insert(item.task_id, item.priority);
                launches.push(TaskLaunch {
                    identity: item.identity,
                    task_id: item.task_id,
                    source_url: slot.source_url.clone(),
                    cancel: slot.cancel.clone(),
                    progress: slot.progress.clone(),
                });
            }
            launches
        };

        for launch in launches {
            self.emit(DownloadEvent::Started {
                track_id: launch.identity.track_id.clone(),
                quality: launch.identity.quality.as_str().to_string(),
            });
            let coordinator = self.clone();
            runtime.spawn(async move {
                let outcome = coordinator.execute(&launch).await;
                coordinator.finish(&launch, outcome);
            });
        }
    }

    fn finish(&self, launch: &TaskLaunch, outcome: Result<CacheEntry>) {
        let slot = {
            let mut state = self.inner.state.lock();
            state.running.remove(&launch.task_id);
            let owns = state
                .tasks
                .get(&launch.identity)
                .is_some_and(|slot| slot.task_id == launch.task_id);
            if owns {
                state.tasks.remove(&launch.identity)
            } else {
                None
            }
        };

        // A missing slot means `cancel` already resolved the waiters.
        if let Some(slot) = slot {
            let identity = &launch.identity;
            match &outcome {
                Ok(entry) => {
                    info!(identity = %identity, size = entry.size_bytes, "Download completed");
                    self.emit(DownloadEvent::Completed {
                        track_id: identity.track_id.clone(),
                        quality: identity.quality.as_str().to_string(),
                        size_bytes: entry.size_bytes,
                    });
                }
                Err(e) if e.is_cancelled() => {
                    self.emit(DownloadEvent::Cancelled {
                        track_id: identity.track_id.clone(),
                        quality: identity.quality.as_str().to_string(),
                    });
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Download failed");
                    self.emit(DownloadEvent::Failed {
                        track_id: identity.track_id.clone(),
                        quality: identity.quality.as_str().to_string(),
                        message: e.to_string(),
                    });
                }
            }
            slot.outcome.send_replace(Some(outcome));
        }

        self.dispatch();
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    #[instrument(skip(self, launch), fields(identity = %launch.identity))]
    async fn execute(&self, launch: &TaskLaunch) -> Result<CacheEntry> {
        let settings = &self.inner.settings;
        let capacity = self.inner.store.capacity_bytes();
        let cancelled = || StreamingError::Cancelled {
            track_id: launch.identity.track_id.clone(),
            quality: launch.identity.quality,
        };

        let mut attempt = 0;
        let data = loop {
            attempt += 1;
            launch.progress.begin_attempt(attempt);

            let result = tokio::select! {
                _ = launch.cancel.cancelled() => Err(AttemptError::Cancelled),
                timed = tokio::time::timeout(settings.download_timeout, self.fetch(launch)) => {
                    timed.unwrap_or(Err(AttemptError::TimedOut))
                }
            };

            match result {
                Ok(data) => break data,
                Err(AttemptError::Cancelled) => return Err(cancelled()),
                Err(err) if err.is_retryable() && attempt < settings.max_attempts => {
                    warn!(attempt, error = %err, "Download attempt failed; retrying");
                    self.emit(DownloadEvent::Retrying {
                        track_id: launch.identity.track_id.clone(),
                        quality: launch.identity.quality.as_str().to_string(),
                        attempt,
                        message: err.to_string(),
                    });
                    tokio::select! {
                        _ = launch.cancel.cancelled() => return Err(cancelled()),
                        _ = tokio::time::sleep(settings.retry_backoff) => {}
                    }
                }
                Err(err) => {
                    return Err(err.into_streaming_error(&launch.identity, settings, capacity));
                }
            }
        };

        if launch.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let entry = self
            .inner
            .store
            .put(&launch.identity, data)
            .await
            .map_err(|e| StreamingError::DownloadFailed {
                track_id: launch.identity.track_id.clone(),
                quality: launch.identity.quality,
                cause: e.to_string(),
            })?;

        // Cancelled while the blob was being written.
        if launch.cancel.is_cancelled() {
            if let Err(e) = self.inner.store.remove_entry(&entry).await {
                warn!(error = %e, "Failed to discard blob of cancelled download");
            }
            return Err(cancelled());
        }

        Ok(entry)
    }

    /// One attempt: headers, then chunks until the body ends.
    async fn fetch(&self, launch: &TaskLaunch) -> std::result::Result<Bytes, AttemptError> {
        let capacity = self.inner.store.capacity_bytes();
        let request = HttpRequest::get(launch.source_url.as_str());

        let (response, mut body) = self
            .inner
            .http_client
            .download_stream(request)
            .await
            .map_err(AttemptError::from_bridge)?;

        if let Some(length) = response.content_length {
            if length > capacity {
                return Err(AttemptError::TooLarge(length));
            }
        }
        launch.progress.set_total(response.content_length);

        let initial = response.content_length.unwrap_or(0) as usize;
        let mut buffer = BytesMut::with_capacity(initial);
        loop {
            let chunk = tokio::select! {
                _ = launch.cancel.cancelled() => return Err(AttemptError::Cancelled),
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    launch.progress.add(bytes.len() as u64);
                    if buffer.len() as u64 > capacity {
                        return Err(AttemptError::TooLarge(buffer.len() as u64));
                    }
                }
                Some(Err(e)) => return Err(AttemptError::from_bridge(e)),
                None => break,
            }
        }

        debug!(bytes = buffer.len(), "Body received");
        Ok(buffer.freeze())
    }

    fn emit(&self, event: DownloadEvent) {
        if let Some(bus) = &self.inner.event_bus {
            bus.emit(CoreEvent::Download(event)).ok();
        }
    }
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("settings", &self.inner.settings)
            .field("active", &self.active_count())
            .finish()
    }
}
