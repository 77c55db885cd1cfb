//! HTTP Client Abstraction
//!
//! Provides async media downloads delivered as a stream of byte chunks so the
//! core can observe cancellation between chunks instead of waiting for the
//! whole body.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// Chunked response body.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Download request builder
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            timeout: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// Response head returned alongside a streamed body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub content_length: Option<u64>,
}

impl HttpResponse {
    /// Check if response status is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if response status indicates a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Check if response status indicates a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Async HTTP client trait
///
/// Implementations should handle:
/// - TLS certificate validation
/// - Connection pooling and keep-alive
/// - Mapping non-2xx statuses to [`BridgeError::HttpStatus`](crate::error::BridgeError::HttpStatus)
///
/// Retries are owned by the caller; implementations perform a single attempt.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest};
/// use futures::StreamExt;
///
/// async fn fetch_len(client: &dyn HttpClient, url: &str) -> Result<usize> {
///     let (_head, mut body) = client.download_stream(HttpRequest::get(url)).await?;
///     let mut total = 0;
///     while let Some(chunk) = body.next().await {
///         total += chunk?.len();
///     }
///     Ok(total)
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Start a download and return the response head plus a chunked body.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Network connection fails
    /// - TLS validation fails
    /// - The server answers with a non-2xx status
    async fn download_stream(&self, request: HttpRequest) -> Result<(HttpResponse, ByteStream)>;
}
