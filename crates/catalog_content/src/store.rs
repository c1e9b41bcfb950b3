//! Content store trait definition.

use crate::error::{ContentError, ContentResult};
use crate::model::{Resource, ResourceType, Space};
use crate::patch::PatchOperation;

/// Keyed storage for catalog resources.
///
/// Physical documents are addressed by `(resource type, space, id)`, so the
/// same logical resource can exist independently in every space it has been
/// promoted into.
///
/// # Invariants
///
/// - `create` is an upsert: writing the same key twice overwrites, never duplicates
/// - `search_by_space` only returns documents tagged with the requested space
/// - stored hashes always match stored documents (see [`Resource`])
/// - stores must be `Send + Sync` for shared access
///
/// # Implementors
///
/// - [`super::InMemoryContentStore`] - For testing and ephemeral mirrors
pub trait ContentStore: Send + Sync {
    /// Fetches a resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn get(&self, resource_type: ResourceType, space: Space, id: &str)
        -> ContentResult<Option<Resource>>;

    /// Inserts or overwrites a resource under its type, space and `document.id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn create(&self, resource: Resource) -> ContentResult<()>;

    /// Deletes a resource. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn delete(&self, resource_type: ResourceType, space: Space, id: &str) -> ContentResult<bool>;

    /// Returns every resource of a type in a space.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn search_by_space(&self, resource_type: ResourceType, space: Space)
        -> ContentResult<Vec<Resource>>;

    /// Removes every resource of a type in a space. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn clear(&self, resource_type: ResourceType, space: Space) -> ContentResult<usize>;

    /// Returns true if the resource exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn exists(&self, resource_type: ResourceType, space: Space, id: &str) -> ContentResult<bool> {
        Ok(self.get(resource_type, space, id)?.is_some())
    }

    /// Applies patch operations to a stored resource and writes the result.
    ///
    /// The patched document is sanitized and rehashed. Nothing is written if
    /// any operation fails.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::NotFound`] if the resource does not exist, or
    /// the patch error of the first failing operation.
    fn update(
        &self,
        resource_type: ResourceType,
        space: Space,
        id: &str,
        operations: &[PatchOperation],
    ) -> ContentResult<Resource> {
        let current = self
            .get(resource_type, space, id)?
            .ok_or_else(|| ContentError::not_found(resource_type, space, id))?;
        let patched = current.apply_patch(operations)?;
        self.create(patched.clone())?;
        Ok(patched)
    }

    /// Writes a batch of resources.
    ///
    /// # Errors
    ///
    /// Returns the first write error.
    fn bulk_create(&self, resources: Vec<Resource>) -> ContentResult<()> {
        for resource in resources {
            self.create(resource)?;
        }
        Ok(())
    }

    /// Finds which collection holds `id` in `space`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn locate(&self, space: Space, id: &str) -> ContentResult<Option<ResourceType>> {
        for resource_type in ResourceType::ALL {
            if self.exists(resource_type, space, id)? {
                return Ok(Some(resource_type));
            }
        }
        Ok(None)
    }
}
