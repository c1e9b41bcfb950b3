//! Error types for promotion and draft content operations.

use crate::diff::PromotionOperation;
use catalog_content::{ContentError, ReferenceList, ResourceType, Space};
use catalog_sync_engine::RegistrationError;
use thiserror::Error;

/// Result type for promotion operations.
pub type PromotionResult<T> = Result<T, PromotionError>;

/// Errors that can occur while promoting or editing content.
#[derive(Error, Debug)]
pub enum PromotionError {
    /// The space has no promotion target.
    #[error("space '{0}' cannot be promoted")]
    UnpromotableSpace(Space),

    /// A policy change other than update was requested.
    #[error("invalid policy operation '{0}': a space always has exactly one policy")]
    InvalidPolicyOperation(PromotionOperation),

    /// The request itself is invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// The validation service rejected a document.
    #[error("validation failed: {message}")]
    ValidationFailed {
        /// Message from the validation service.
        message: String,
    },

    /// A resource does not exist.
    #[error("{resource_type} '{id}' not found in space '{space}'")]
    NotFound {
        /// Resource type.
        resource_type: ResourceType,
        /// Space searched.
        space: Space,
        /// Resource ID.
        id: String,
    },

    /// A resource already exists.
    #[error("{resource_type} '{id}' already exists in space '{space}'")]
    AlreadyExists {
        /// Resource type.
        resource_type: ResourceType,
        /// Space searched.
        space: Space,
        /// Resource ID.
        id: String,
    },

    /// An integration still references children.
    #[error("integration '{id}' still has {list} attached")]
    HasLinkedResources {
        /// Integration ID.
        id: String,
        /// First non-empty reference list.
        list: ReferenceList,
    },

    /// A created resource could not be linked to its parent and was removed.
    #[error("failed to link '{child}' to '{parent}': {message}")]
    LinkFailed {
        /// Parent ID.
        parent: String,
        /// Child ID.
        child: String,
        /// Cause.
        message: String,
    },

    /// The registration service failed.
    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Content store or document error.
    #[error("content error: {0}")]
    Content(#[from] ContentError),
}

impl PromotionError {
    /// Creates a not-found error.
    pub fn not_found(resource_type: ResourceType, space: Space, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type,
            space,
            id: id.into(),
        }
    }

    /// Creates a validation-failed error.
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }

    /// Returns true if the caller sent a request that can never succeed as is.
    pub fn is_client_error(&self) -> bool {
        match self {
            PromotionError::UnpromotableSpace(_)
            | PromotionError::InvalidPolicyOperation(_)
            | PromotionError::Validation(_)
            | PromotionError::ValidationFailed { .. }
            | PromotionError::NotFound { .. }
            | PromotionError::AlreadyExists { .. }
            | PromotionError::HasLinkedResources { .. } => true,
            PromotionError::Content(e) => matches!(e, ContentError::InvalidDocument(_)),
            PromotionError::LinkFailed { .. } | PromotionError::Registration(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors() {
        assert!(PromotionError::UnpromotableSpace(Space::Standard).is_client_error());
        assert!(PromotionError::HasLinkedResources {
            id: "i1".into(),
            list: ReferenceList::Decoders,
        }
        .is_client_error());
        assert!(!PromotionError::Registration(RegistrationError::Timeout).is_client_error());
    }

    #[test]
    fn error_display() {
        let err = PromotionError::HasLinkedResources {
            id: "i1".into(),
            list: ReferenceList::Rules,
        };
        assert_eq!(err.to_string(), "integration 'i1' still has rules attached");

        let err = PromotionError::not_found(ResourceType::Decoder, Space::Draft, "d1");
        assert_eq!(err.to_string(), "decoder 'd1' not found in space 'draft'");

        let err = PromotionError::InvalidPolicyOperation(PromotionOperation::Add);
        assert!(err.to_string().contains("'add'"));
    }
}
