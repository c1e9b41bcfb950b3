//! Parent/child reference maintenance in the draft space.
//!
//! Integrations reference their decoders, rules and kvdbs; the draft policy
//! references integrations and filters. The graph only edits these reference
//! lists. It never owns document content.

use crate::error::{PromotionError, PromotionResult};
use catalog_content::{ContentStore, ReferenceList, Resource, ResourceType, Space};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Returns the container type that owns `list`.
pub fn container_type(list: ReferenceList) -> ResourceType {
    match list {
        ReferenceList::Decoders | ReferenceList::Rules | ReferenceList::Kvdbs => {
            ResourceType::Integration
        }
        ReferenceList::Integrations | ReferenceList::Filters => ResourceType::Policy,
    }
}

/// Maintains reference lists of draft containers.
#[derive(Clone)]
pub struct ResourceLinkGraph {
    store: Arc<dyn ContentStore>,
}

impl ResourceLinkGraph {
    /// Creates a graph over `store`.
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Adds `child_id` to a draft container's list. Linking twice is a no-op.
    ///
    /// The container keeps its previous aggregate hash until the next
    /// recalculation.
    ///
    /// # Errors
    ///
    /// Returns [`PromotionError::NotFound`] if the container is not in draft.
    pub fn link(
        &self,
        parent_id: &str,
        child_id: &str,
        list: ReferenceList,
    ) -> PromotionResult<()> {
        let parent_type = container_type(list);
        let mut parent = self
            .store
            .get(parent_type, Space::Draft, parent_id)?
            .ok_or_else(|| PromotionError::not_found(parent_type, Space::Draft, parent_id))?;

        let mut ids = parent.references(list);
        if ids.iter().any(|id| id == child_id) {
            return Ok(());
        }
        ids.push(child_id.to_string());
        parent.set_references(list, ids)?;
        self.store.create(parent)?;
        debug!(parent = parent_id, child = child_id, list = %list, "linked");
        Ok(())
    }

    /// Removes `child_id` from `list` of every draft container holding it.
    ///
    /// Returns the IDs of the containers that changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn unlink(&self, child_id: &str, list: ReferenceList) -> PromotionResult<Vec<String>> {
        let mut changed = Vec::new();
        for mut parent in self
            .store
            .search_by_space(container_type(list), Space::Draft)?
        {
            let ids = parent.references(list);
            if !ids.iter().any(|id| id == child_id) {
                continue;
            }
            let kept = ids.into_iter().filter(|id| id != child_id).collect();
            parent.set_references(list, kept)?;
            changed.push(parent.id().to_string());
            self.store.create(parent)?;
        }
        debug!(child = child_id, list = %list, parents = changed.len(), "unlinked");
        Ok(changed)
    }

    /// Creates `child` and links it to `parent_id`.
    ///
    /// If linking fails the child is deleted again, so no orphan is left.
    ///
    /// # Errors
    ///
    /// Returns [`PromotionError::LinkFailed`] if linking failed, or the store
    /// error of the create.
    pub fn create_linked(
        &self,
        child: Resource,
        parent_id: &str,
        list: ReferenceList,
    ) -> PromotionResult<()> {
        let child_type = child.resource_type();
        let space = child.space();
        let child_id = child.id().to_string();
        self.store.create(child)?;

        if let Err(e) = self.link(parent_id, &child_id, list) {
            warn!(
                parent = parent_id,
                child = %child_id,
                error = %e,
                "link failed, removing created resource"
            );
            if let Err(delete_err) = self.store.delete(child_type, space, &child_id) {
                error!(
                    child = %child_id,
                    error = %delete_err,
                    "failed to remove unlinked resource"
                );
            }
            return Err(PromotionError::LinkFailed {
                parent: parent_id.to_string(),
                child: child_id,
                message: e.to_string(),
            });
        }
        Ok(())
    }

    /// Refuses deletion of an integration that still has children.
    ///
    /// Lists are checked decoders first, then rules, then kvdbs.
    ///
    /// # Errors
    ///
    /// Returns [`PromotionError::HasLinkedResources`] naming the first
    /// non-empty list.
    pub fn check_deletable(&self, integration: &Resource) -> PromotionResult<()> {
        for list in ReferenceList::DELETE_ORDER {
            if !integration.references(list).is_empty() {
                return Err(PromotionError::HasLinkedResources {
                    id: integration.id().to_string(),
                    list,
                });
            }
        }
        Ok(())
    }
}
