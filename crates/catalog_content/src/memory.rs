//! In-memory content store.

use crate::error::ContentResult;
use crate::model::{Resource, ResourceType, Space};
use crate::store::ContentStore;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

type Collection = BTreeMap<String, Resource>;

/// An in-memory content store.
///
/// Suitable for:
/// - Unit and integration tests
/// - Ephemeral mirrors that are rebuilt from a snapshot on start
///
/// Collections are ordered by ID, so searches are deterministic.
///
/// # Example
///
/// ```rust
/// use catalog_content::{ContentStore, InMemoryContentStore, Resource, ResourceType, Space};
/// use serde_json::json;
///
/// let store = InMemoryContentStore::new();
/// let rule = Resource::new(ResourceType::Rule, Space::Draft, json!({"id": "r1"})).unwrap();
/// store.create(rule).unwrap();
/// assert!(store.exists(ResourceType::Rule, Space::Draft, "r1").unwrap());
/// assert!(!store.exists(ResourceType::Rule, Space::Test, "r1").unwrap());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    collections: RwLock<HashMap<(ResourceType, Space), Collection>>,
}

impl InMemoryContentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `resources`.
    #[must_use]
    pub fn with_resources(resources: impl IntoIterator<Item = Resource>) -> Self {
        let store = Self::new();
        {
            let mut collections = store.collections.write();
            for resource in resources {
                collections
                    .entry((resource.resource_type(), resource.space()))
                    .or_default()
                    .insert(resource.id().to_string(), resource);
            }
        }
        store
    }

    /// Returns a copy of every stored resource.
    pub fn all(&self) -> Vec<Resource> {
        let collections = self.collections.read();
        let mut keys: Vec<_> = collections.keys().copied().collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|key| collections[&key].values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Returns the number of resources of a type in a space.
    pub fn count(&self, resource_type: ResourceType, space: Space) -> usize {
        self.collections
            .read()
            .get(&(resource_type, space))
            .map_or(0, BTreeMap::len)
    }

    /// Returns the total number of stored resources.
    pub fn len(&self) -> usize {
        self.collections.read().values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for InMemoryContentStore {
    fn get(
        &self,
        resource_type: ResourceType,
        space: Space,
        id: &str,
    ) -> ContentResult<Option<Resource>> {
        Ok(self
            .collections
            .read()
            .get(&(resource_type, space))
            .and_then(|c| c.get(id))
            .cloned())
    }

    fn create(&self, resource: Resource) -> ContentResult<()> {
        self.collections
            .write()
            .entry((resource.resource_type(), resource.space()))
            .or_default()
            .insert(resource.id().to_string(), resource);
        Ok(())
    }

    fn delete(&self, resource_type: ResourceType, space: Space, id: &str) -> ContentResult<bool> {
        Ok(self
            .collections
            .write()
            .get_mut(&(resource_type, space))
            .and_then(|c| c.remove(id))
            .is_some())
    }

    fn search_by_space(
        &self,
        resource_type: ResourceType,
        space: Space,
    ) -> ContentResult<Vec<Resource>> {
        Ok(self
            .collections
            .read()
            .get(&(resource_type, space))
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    fn clear(&self, resource_type: ResourceType, space: Space) -> ContentResult<usize> {
        Ok(self
            .collections
            .write()
            .remove(&(resource_type, space))
            .map_or(0, |c| c.len()))
    }

    fn bulk_create(&self, resources: Vec<Resource>) -> ContentResult<()> {
        let mut collections = self.collections.write();
        for resource in resources {
            collections
                .entry((resource.resource_type(), resource.space()))
                .or_default()
                .insert(resource.id().to_string(), resource);
        }
        Ok(())
    }
}
