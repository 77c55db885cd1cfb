//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest` with streamed response bodies
//! - `FileSystemAccess` using `tokio::fs`
//! - `NetworkMonitor` using a TCP connectivity probe
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopNetworkMonitor, ReqwestHttpClient, TokioFileSystem};
//!
//! #[tokio::main]
//! async fn main() {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let fs = TokioFileSystem::new();
//!     let network = DesktopNetworkMonitor::new();
//!
//!     // Hand these to `CoreConfig::builder()`
//! }
//! ```

mod filesystem;
mod http;
mod network;

pub use filesystem::TokioFileSystem;
pub use http::ReqwestHttpClient;
pub use network::DesktopNetworkMonitor;
