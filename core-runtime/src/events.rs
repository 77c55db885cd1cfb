//! # Event Bus System
//!
//! Provides an event-driven architecture for the streaming core using `tokio::sync::broadcast`.
//! Host UIs (settings screen, player chrome) observe cache and download
//! activity without polling the façade.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for different domains
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  emit   ┌───────────┐
//! │ TrackCacheStore  ├────────>│           │
//! └──────────────────┘         │           │
//!                              │ EventBus  │  subscribe  ┌────────────┐
//! ┌──────────────────┐  emit   │ (broadcast├────────────>│ Subscriber │
//! │ Coordinator      ├────────>│  channel) │             └────────────┘
//! └──────────────────┘         │           │
//! ┌──────────────────┐  emit   │           │
//! │ StreamingManager ├────────>│           │
//! └──────────────────┘         └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Cache(CacheEvent::Cleared { removed: 3 }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert!(matches!(event, CoreEvent::Cache(_)));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emitters ignore `SendError` (no subscribers is a normal state).

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
///
/// Quality tiers travel in their display form (`"320kbps"`) so this crate
/// does not depend on the streaming crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Façade-level stream resolution events
    Streaming(StreamingEvent),
    /// Download coordinator events
    Download(DownloadEvent),
    /// Track cache store events
    Cache(CacheEvent),
    /// Connectivity changes
    Network(NetworkEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Streaming(e) => e.description(),
            CoreEvent::Download(e) => e.description(),
            CoreEvent::Cache(e) => e.description(),
            CoreEvent::Network(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Streaming(StreamingEvent::ResolveFailed { .. }) => EventSeverity::Error,
            CoreEvent::Download(DownloadEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Download(DownloadEvent::Retrying { .. }) => EventSeverity::Warning,
            CoreEvent::Cache(CacheEvent::EntryEvicted { .. }) => EventSeverity::Info,
            CoreEvent::Cache(CacheEvent::Cleared { .. }) => EventSeverity::Info,
            CoreEvent::Network(_) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Events emitted by the streaming façade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum StreamingEvent {
    /// A playable handle was produced.
    HandleResolved {
        track_id: String,
        quality: String,
        /// `"cache"` or `"network"`.
        source: String,
    },
    /// Resolution or download failed and the error was returned to the caller.
    ResolveFailed { track_id: String, message: String },
    /// A preload was accepted for the next track.
    PreloadScheduled { track_id: String, quality: String },
    /// The configuration snapshot was replaced.
    ConfigUpdated {
        preferred_quality: String,
        enable_caching: bool,
        preload_next_track: bool,
        fallback_enabled: bool,
    },
}

impl StreamingEvent {
    fn description(&self) -> &str {
        match self {
            StreamingEvent::HandleResolved { .. } => "Stream handle resolved",
            StreamingEvent::ResolveFailed { .. } => "Stream resolution failed",
            StreamingEvent::PreloadScheduled { .. } => "Preload scheduled",
            StreamingEvent::ConfigUpdated { .. } => "Streaming configuration updated",
        }
    }
}

// ============================================================================
// Download Events
// ============================================================================

/// Events related to media downloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    /// A new task entered the queue.
    Queued {
        track_id: String,
        quality: String,
        /// `"immediate"` or `"preload"`.
        priority: String,
    },
    /// A task acquired a download slot.
    Started { track_id: String, quality: String },
    /// An attempt failed and a retry is scheduled.
    Retrying {
        track_id: String,
        quality: String,
        attempt: u32,
        message: String,
    },
    /// The blob was downloaded and stored.
    Completed {
        track_id: String,
        quality: String,
        size_bytes: u64,
    },
    /// The task failed permanently.
    Failed {
        track_id: String,
        quality: String,
        message: String,
    },
    /// The task was cancelled before completion.
    Cancelled { track_id: String, quality: String },
}

impl DownloadEvent {
    fn description(&self) -> &str {
        match self {
            DownloadEvent::Queued { .. } => "Download queued",
            DownloadEvent::Started { .. } => "Download started",
            DownloadEvent::Retrying { .. } => "Download retrying",
            DownloadEvent::Completed { .. } => "Download completed",
            DownloadEvent::Failed { .. } => "Download failed",
            DownloadEvent::Cancelled { .. } => "Download cancelled",
        }
    }
}

// ============================================================================
// Cache Events
// ============================================================================

/// Events related to the on-device track cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum CacheEvent {
    /// A blob was written and indexed.
    EntryStored {
        track_id: String,
        quality: String,
        size_bytes: u64,
    },
    /// An entry was evicted to make room.
    EntryEvicted {
        track_id: String,
        quality: String,
        size_bytes: u64,
    },
    /// An entry was removed explicitly.
    EntryRemoved { track_id: String, quality: String },
    /// The whole cache was cleared.
    Cleared { removed: usize },
}

impl CacheEvent {
    fn description(&self) -> &str {
        match self {
            CacheEvent::EntryStored { .. } => "Cache entry stored",
            CacheEvent::EntryEvicted { .. } => "Cache entry evicted",
            CacheEvent::EntryRemoved { .. } => "Cache entry removed",
            CacheEvent::Cleared { .. } => "Cache cleared",
        }
    }
}

// ============================================================================
// Network Events
// ============================================================================

/// Connectivity changes observed by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum NetworkEvent {
    StatusChanged {
        connected: bool,
        /// `"wifi"`, `"cellular"`, `"ethernet"`, `"other"` or absent.
        network_type: Option<String>,
    },
}

impl NetworkEvent {
    fn description(&self) -> &str {
        match self {
            NetworkEvent::StatusChanged { .. } => "Network status changed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// When a subscriber falls behind by more than `capacity` events it
    /// receives `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with additional filtering capabilities.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let cache_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Cache(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events that match `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
