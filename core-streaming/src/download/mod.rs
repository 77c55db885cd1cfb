//! # Download Coordinator
//!
//! Single-flight, priority-ordered downloads into the track cache.
//!
//! - One non-terminal task per [`TrackIdentity`](crate::quality::TrackIdentity);
//!   later requests attach to it and share its outcome.
//! - Immediate requests run before preloads; a queued or running preload is
//!   reclassified when an immediate request for the same identity arrives.
//! - When more than one slot exists, preloads never occupy the last one.
//! - Bodies are buffered in memory and handed to the store only when
//!   complete, so a cancelled download never leaves a partial file.

mod coordinator;
mod task;

pub use coordinator::DownloadCoordinator;
pub use task::{
    DownloadHandle, DownloadPriority, DownloadSettings, DownloadState, DownloadTaskInfo,
};
