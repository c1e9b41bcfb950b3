//! HTTP change feed implementation.
//!
//! The actual HTTP client is abstracted via a trait so the engine does not
//! depend on a specific HTTP library. The CLI provides a `reqwest` client;
//! tests use [`MockHttpClient`].

use crate::change_feed::{ChangeBatch, ChangeFeedClient, ChangeRecord};
use crate::consumer::RemoteConsumer;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a 200 response.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    /// Returns true for a 200 status.
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// HTTP client abstraction.
///
/// Errors are plain messages; callers classify them as transport errors.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a GET request.
    async fn get(&self, url: &str) -> Result<HttpResponse, String>;
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    async fn get(&self, url: &str) -> Result<HttpResponse, String> {
        (**self).get(url).await
    }
}

/// Maps a non-200 status to a transport error.
pub(crate) fn status_error(url: &str, status: u16) -> SyncError {
    let message = format!("GET {url} returned HTTP {status}");
    if status >= 500 || status == 408 || status == 429 {
        SyncError::transport_retryable(message)
    } else {
        SyncError::transport_fatal(message)
    }
}

/// Change feed client speaking the catalog REST API.
pub struct HttpChangeFeedClient<C: HttpClient> {
    /// Base URL of the catalog API (e.g., "https://cti.example.com/api/v1").
    base_url: String,
    client: C,
    timeout: Duration,
}

impl<C: HttpClient> HttpChangeFeedClient<C> {
    /// Creates a new client.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the consumer resource.
    pub fn consumer_url(&self, context: &str, consumer: &str) -> String {
        format!(
            "{}/catalog/contexts/{}/consumers/{}",
            self.base_url, context, consumer
        )
    }

    /// URL of a change range.
    pub fn changes_url(&self, context: &str, consumer: &str, from: u64, to: u64) -> String {
        format!(
            "{}/changes?from_offset={}&to_offset={}&with_empties=true",
            self.consumer_url(context, consumer),
            from,
            to
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> SyncResult<T> {
        debug!(url, "GET");
        let response = tokio::time::timeout(self.timeout, self.client.get(url))
            .await
            .map_err(|_| SyncError::Timeout)?
            .map_err(SyncError::transport_retryable)?;

        if !response.is_ok() {
            return Err(status_error(url, response.status));
        }

        serde_json::from_slice(&response.body)
            .map_err(|e| SyncError::Protocol(format!("failed to decode {url}: {e}")))
    }
}

#[async_trait]
impl<C: HttpClient> ChangeFeedClient for HttpChangeFeedClient<C> {
    async fn fetch_changes(
        &self,
        context: &str,
        consumer: &str,
        from_offset: u64,
        to_offset: u64,
    ) -> SyncResult<Vec<ChangeRecord>> {
        let url = self.changes_url(context, consumer, from_offset, to_offset);
        let batch: ChangeBatch = self.get_json(&url).await?;
        Ok(batch.data)
    }

    async fn fetch_consumer(&self, context: &str, consumer: &str) -> SyncResult<RemoteConsumer> {
        self.get_json(&self.consumer_url(context, consumer)).await
    }
}

/// A canned-response HTTP client for testing.
///
/// Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    routes: RwLock<HashMap<String, HttpResponse>>,
    requests: RwLock<Vec<String>>,
}

impl MockHttpClient {
    /// Creates a client with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the response for `url`.
    pub fn route(&self, url: impl Into<String>, response: HttpResponse) {
        self.routes.write().insert(url.into(), response);
    }

    /// Returns every URL requested so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.read().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, String> {
        self.requests.write().push(url.to_string());
        Ok(self.routes.read().get(url).cloned().unwrap_or(HttpResponse {
            status: 404,
            body: Vec::new(),
        }))
    }
}
