//! Workspace umbrella crate.
//!
//! Host applications can depend on `streaming-workspace` and enable the
//! `desktop-shims` feature to get the streaming core wired to the desktop
//! bridge adapters without listing each workspace crate individually.

#[cfg(feature = "desktop-shims")]
pub use core_runtime as runtime;

#[cfg(feature = "desktop-shims")]
pub use core_streaming as streaming;

#[cfg(feature = "desktop-shims")]
pub use core_streaming::{
    QualityTier, SongDescriptor, StreamHandle, StreamingConfig, StreamingError, StreamingManager,
};
