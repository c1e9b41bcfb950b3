//! Network collaborators used by the CLI.

use async_trait::async_trait;
use catalog_content::{ResourceType, Space};
use catalog_sync_engine::{ExternalRegistrationService, HttpClient, HttpResponse, RegistrationError};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// `HttpClient` backed by reqwest.
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Builds a client that bounds connection setup only.
    ///
    /// Whole-request limits are left to callers: feed calls carry their own
    /// timeout and snapshot downloads run under the snapshot deadline.
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("catalogctl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, String> {
        let response = self.inner.get(url).send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Registration service that only reports what would be registered.
///
/// The CLI has no rule engine to register content with.
#[derive(Debug, Default)]
pub struct LogRegistration;

#[async_trait]
impl ExternalRegistrationService for LogRegistration {
    async fn upsert(
        &self,
        resource_type: ResourceType,
        document: &Value,
        space: Space,
    ) -> Result<(), RegistrationError> {
        let id = document.get("id").and_then(Value::as_str).unwrap_or_default();
        info!(resource_type = %resource_type, id, space = %space, "register");
        Ok(())
    }

    async fn delete(&self, resource_type: ResourceType, id: &str) -> Result<(), RegistrationError> {
        info!(resource_type = %resource_type, id, "deregister");
        Ok(())
    }
}
