//! # Track Cache
//!
//! Capacity-bounded, LRU-evicted store of downloaded audio blobs keyed by
//! [`TrackIdentity`](crate::quality::TrackIdentity).
//!
//! ## Layout
//!
//! ```text
//! <host cache dir>/<cache_directory>/
//!     manifest.json
//!     media/<sha256(track_id)[..16]>-<quality>-<uuid>.audio
//! ```
//!
//! The manifest is the source of truth across restarts. [`TrackCacheStore::open`]
//! reconciles it with the media directory: entries without a blob are dropped
//! and blobs without an entry are deleted.

mod config;
mod entry;
mod manifest;
mod stats;
mod store;

pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use stats::{CacheStats, StoreStats};
pub use store::TrackCacheStore;
