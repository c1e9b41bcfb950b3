//! Document validation collaborator.

use crate::error::{PromotionError, PromotionResult};
use async_trait::async_trait;
use catalog_content::ResourceType;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Checks documents before they are written to a space.
///
/// Implementations report rejections as [`PromotionError::ValidationFailed`].
#[async_trait]
pub trait ValidationService: Send + Sync {
    /// Validates a document of the given type.
    async fn validate(&self, resource_type: ResourceType, document: &Value) -> PromotionResult<()>;
}

/// Accepts every document.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl ValidationService for AcceptAll {
    async fn validate(
        &self,
        _resource_type: ResourceType,
        _document: &Value,
    ) -> PromotionResult<()> {
        Ok(())
    }
}

/// A validation service for testing that rejects configured IDs.
#[derive(Debug, Default)]
pub struct MockValidationService {
    rejections: RwLock<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl MockValidationService {
    /// Creates a service that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects documents whose `id` or `title` equals `key`.
    pub fn reject(&self, key: impl Into<String>, message: impl Into<String>) {
        self.rejections.write().insert(key.into(), message.into());
    }

    /// Number of documents validated so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ValidationService for MockValidationService {
    async fn validate(
        &self,
        _resource_type: ResourceType,
        document: &Value,
    ) -> PromotionResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rejections = self.rejections.read();
        for key in ["id", "title"] {
            if let Some(message) = document
                .get(key)
                .and_then(Value::as_str)
                .and_then(|value| rejections.get(value))
            {
                return Err(PromotionError::validation_failed(message.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_rejects_by_id_or_title() {
        let service = MockValidationService::new();
        service.reject("bad", "field 'check' is invalid");

        assert!(service
            .validate(ResourceType::Rule, &json!({"id": "ok"}))
            .await
            .is_ok());
        let err = service
            .validate(ResourceType::Rule, &json!({"id": "x", "title": "bad"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PromotionError::ValidationFailed { ref message } if message.contains("check")
        ));
        assert_eq!(service.calls(), 2);
        assert!(AcceptAll.validate(ResourceType::Rule, &json!({})).await.is_ok());
    }
}
