//! HTTP Client Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{ByteStream, HttpClient, HttpRequest, HttpResponse},
};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Reqwest-based HTTP client implementation
///
/// Provides media downloads with:
/// - Connection pooling via reqwest
/// - rustls TLS
/// - Chunked body delivery so callers can cancel mid-transfer
///
/// Retries are left to the download coordinator.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Create a new HTTP client with default configuration
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a new HTTP client with a custom connect timeout
    ///
    /// No overall request timeout is set because bodies are streamed; the
    /// coordinator bounds each attempt instead.
    pub fn with_connect_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(10)
            .user_agent(concat!("music-streaming-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Create a new HTTP client with custom configuration
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Build reqwest request from bridge request
    fn build_request(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut req = self.client.get(&request.url);

        for (key, value) in &request.headers {
            req = req.header(key, value);
        }

        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        req
    }

    fn map_send_error(e: reqwest::Error) -> BridgeError {
        if e.is_timeout() {
            BridgeError::OperationFailed("Request timed out".to_string())
        } else if e.is_connect() {
            BridgeError::OperationFailed(format!("Connection failed: {}", e))
        } else {
            BridgeError::OperationFailed(e.to_string())
        }
    }

    /// Drop the query string so signed URLs never reach logs or errors.
    fn loggable(url: &str) -> &str {
        url.split('?').next().unwrap_or(url)
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn download_stream(&self, request: HttpRequest) -> Result<(HttpResponse, ByteStream)> {
        let url = Self::loggable(&request.url).to_string();
        debug!(url = %url, "Starting media download");

        let response = self
            .build_request(&request)
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                warn!(url = %url, error = %e, "HTTP request failed");
                Self::map_send_error(e)
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            warn!(url = %url, status, "HTTP request returned error status");
            return Err(BridgeError::HttpStatus { status, url });
        }

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let head = HttpResponse {
            status,
            headers,
            content_length: response.content_length(),
        };

        let body = response
            .bytes_stream()
            .map_err(|e| BridgeError::OperationFailed(e.without_url().to_string()))
            .boxed();

        Ok((head, body))
    }
}
