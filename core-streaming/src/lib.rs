//! # Streaming Core
//!
//! Turns a song and a requested audio tier into a playable stream handle,
//! backed by an on-device, capacity-bounded track cache.
//!
//! ## Overview
//!
//! This crate handles:
//! - Quality resolution with fallback and an optional cellular cap
//! - A persistent LRU track cache with a reconciled on-disk manifest
//! - Single-flight, priority-scheduled downloads with timeout and retry
//! - Preloading of the next track
//! - Connectivity tracking through the host's `NetworkMonitor`
//!
//! All host capabilities (HTTP, file system, network, clock) come from
//! `bridge-traits`, so the core runs unchanged on every platform.

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod manager;
pub mod network;
pub mod quality;
pub mod track;

pub use cache::{CacheConfig, CacheEntry, CacheStats, StoreStats, TrackCacheStore};
pub use config::{StreamingConfig, StreamingConfigUpdate};
pub use download::{
    DownloadCoordinator, DownloadHandle, DownloadPriority, DownloadSettings, DownloadState,
    DownloadTaskInfo,
};
pub use error::{Result, StreamingError};
pub use manager::{StreamingManager, StreamingManagerBuilder};
pub use network::{NetworkObserver, NetworkState};
pub use quality::{resolve, QualityTier, ResolveError, TrackIdentity};
pub use track::{SongDescriptor, StreamHandle, StreamSource, StreamState};
