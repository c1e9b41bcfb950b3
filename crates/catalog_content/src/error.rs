//! Error types for content operations.

use crate::model::{ResourceType, Space};
use crate::patch::PatchError;
use thiserror::Error;

/// Result type for content operations.
pub type ContentResult<T> = Result<T, ContentError>;

/// Errors that can occur while reading, writing or transforming content.
#[derive(Debug, Error)]
pub enum ContentError {
    /// The addressed resource does not exist.
    #[error("{resource_type} '{id}' not found in space '{space}'")]
    NotFound {
        /// Collection that was searched.
        resource_type: ResourceType,
        /// Space that was searched.
        space: Space,
        /// Logical resource ID.
        id: String,
    },

    /// The document does not have the expected shape.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A patch operation could not be applied.
    #[error("patch failed: {0}")]
    Patch(#[from] PatchError),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store rejected the operation.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ContentError {
    /// Creates a not-found error.
    pub fn not_found(resource_type: ResourceType, space: Space, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type,
            space,
            id: id.into(),
        }
    }

    /// Creates an invalid-document error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidDocument(message.into())
    }

    /// Returns true if this error reports a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContentError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = ContentError::not_found(ResourceType::Rule, Space::Draft, "r-1");
        assert_eq!(err.to_string(), "rule 'r-1' not found in space 'draft'");
        assert!(err.is_not_found());
        assert!(!ContentError::invalid("missing id").is_not_found());
    }
}
