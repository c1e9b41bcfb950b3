//! Per-space enumeration and aggregate ("hash of hashes") maintenance.

use crate::error::ContentResult;
use crate::hasher::ContentHasher;
use crate::model::{ReferenceList, Resource, ResourceType, Space};
use crate::store::ContentStore;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// `{id: hash}` maps per resource type.
pub type SpaceHashes = BTreeMap<ResourceType, BTreeMap<String, String>>;

/// Spaces that get a default policy when they have none.
pub const USER_SPACES: [Space; 3] = [Space::Draft, Space::Test, Space::Custom];

const DEFAULT_POLICY_SEED: &str = "catalog-default-policy";

/// Outcome of a [`SpaceService::recalculate`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecalculateReport {
    /// Policies whose aggregate hash was written.
    pub policies: usize,
    /// Integrations whose aggregate hash was written.
    pub integrations: usize,
    /// Referenced children that no longer exist.
    pub missing_references: usize,
}

/// Reads space contents and keeps container aggregate hashes current.
pub struct SpaceService<S: ContentStore + ?Sized> {
    store: Arc<S>,
}

impl<S: ContentStore + ?Sized> Clone for SpaceService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ContentStore + ?Sized> SpaceService<S> {
    /// Creates a service over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns `{id: hash}` for one collection of a space.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn hashes_of(
        &self,
        resource_type: ResourceType,
        space: Space,
    ) -> ContentResult<BTreeMap<String, String>> {
        Ok(self
            .store
            .search_by_space(resource_type, space)?
            .into_iter()
            .map(|r| {
                let summary = r.summary();
                (summary.id, summary.hash)
            })
            .collect())
    }

    /// Returns `{type: {id: hash}}` for every managed collection of a space.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn resources_of(&self, space: Space) -> ContentResult<SpaceHashes> {
        ResourceType::ALL
            .into_iter()
            .map(|t| Ok((t, self.hashes_of(t, space)?)))
            .collect()
    }

    /// Returns the policy of a space, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn policy(&self, space: Space) -> ContentResult<Option<Resource>> {
        Ok(self
            .store
            .search_by_space(ResourceType::Policy, space)?
            .into_iter()
            .next())
    }

    /// Computes the aggregate hash of an integration without writing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn integration_hash(&self, space: Space, id: &str) -> ContentResult<Option<String>> {
        let Some(integration) = self.store.get(ResourceType::Integration, space, id)? else {
            return Ok(None);
        };
        let mut missing = 0;
        let digests = self.integration_digests(&integration, &mut missing)?;
        Ok(Some(ContentHasher::aggregate(digests)))
    }

    /// Recomputes aggregate hashes for every policy and integration in `spaces`.
    ///
    /// References to children that no longer exist are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn recalculate(&self, spaces: &[Space]) -> ContentResult<RecalculateReport> {
        let mut report = RecalculateReport::default();

        for &space in spaces {
            for mut integration in self.store.search_by_space(ResourceType::Integration, space)? {
                let digests =
                    self.integration_digests(&integration, &mut report.missing_references)?;
                integration.set_space_hash(ContentHasher::aggregate(digests));
                self.store.create(integration)?;
                report.integrations += 1;
            }

            for mut policy in self.store.search_by_space(ResourceType::Policy, space)? {
                let digests = self.policy_digests(&policy, &mut report.missing_references)?;
                let aggregate = ContentHasher::aggregate(digests);
                debug!(
                    space = %space,
                    policy = policy.id(),
                    hash = %aggregate,
                    "policy hash recalculated"
                );
                policy.set_space_hash(aggregate);
                self.store.create(policy)?;
                report.policies += 1;
            }
        }

        info!(
            policies = report.policies,
            integrations = report.integrations,
            missing = report.missing_references,
            "aggregate hashes recalculated"
        );
        Ok(report)
    }

    /// Creates a default policy in every user space that has none.
    ///
    /// Returns the spaces that were initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn initialize_spaces(&self) -> ContentResult<Vec<Space>> {
        let mut initialized = Vec::new();
        for space in USER_SPACES {
            if self.policy(space)?.is_some() {
                continue;
            }
            let mut policy = Resource::new(ResourceType::Policy, space, default_policy_document())?;
            policy.set_space_hash(policy.hash().to_string());
            self.store.create(policy)?;
            info!(space = %space, "default policy created");
            initialized.push(space);
        }
        Ok(initialized)
    }

    /// `[integration, decoders.., kvdbs.., rules..]`
    fn integration_digests(
        &self,
        integration: &Resource,
        missing: &mut usize,
    ) -> ContentResult<Vec<String>> {
        let mut digests = vec![integration.hash().to_string()];
        for list in ReferenceList::HASH_ORDER {
            digests.extend(self.child_hashes(integration, list, missing)?);
        }
        Ok(digests)
    }

    /// `[policy, (integration, decoders.., kvdbs.., rules..)..]`
    fn policy_digests(&self, policy: &Resource, missing: &mut usize) -> ContentResult<Vec<String>> {
        let space = policy.space();
        let mut digests = vec![policy.hash().to_string()];
        for id in policy.references(ReferenceList::Integrations) {
            match self.store.get(ResourceType::Integration, space, &id)? {
                Some(integration) => {
                    digests.extend(self.integration_digests(&integration, missing)?)
                }
                None => {
                    debug!(space = %space, integration = %id, "referenced integration missing");
                    *missing += 1;
                }
            }
        }
        Ok(digests)
    }

    fn child_hashes(
        &self,
        parent: &Resource,
        list: ReferenceList,
        missing: &mut usize,
    ) -> ContentResult<Vec<String>> {
        let mut hashes = Vec::new();
        for id in parent.references(list) {
            match self.store.get(list.child_type(), parent.space(), &id)? {
                Some(child) => hashes.push(child.hash().to_string()),
                None => {
                    debug!(
                        parent = parent.id(),
                        list = %list,
                        child = %id,
                        "referenced child missing"
                    );
                    *missing += 1;
                }
            }
        }
        Ok(hashes)
    }
}

/// Document ID shared by every default policy.
pub fn default_policy_id() -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, DEFAULT_POLICY_SEED.as_bytes()).to_string()
}

fn default_policy_document() -> serde_json::Value {
    json!({
        "id": default_policy_id(),
        "title": "Custom policy",
        "description": "Custom policy",
        "author": "catalog",
        "root_decoder": "",
        "documentation": "",
        "integrations": [],
        "filters": [],
        "enrichments": [],
        "references": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryContentStore;
    use serde_json::json;

    fn put(
        store: &InMemoryContentStore,
        t: ResourceType,
        space: Space,
        doc: serde_json::Value,
    ) -> Resource {
        let resource = Resource::new(t, space, doc).unwrap();
        store.create(resource.clone()).unwrap();
        resource
    }

    fn fixture() -> (Arc<InMemoryContentStore>, Resource, Resource, Resource, Resource) {
        let store = Arc::new(InMemoryContentStore::new());
        let decoder = put(&store, ResourceType::Decoder, Space::Draft, json!({"id": "d1"}));
        let rule = put(&store, ResourceType::Rule, Space::Draft, json!({"id": "r1", "level": 1}));
        let integration = put(
            &store,
            ResourceType::Integration,
            Space::Draft,
            json!({"id": "i1", "decoders": ["d1"], "kvdbs": ["gone"], "rules": ["r1"]}),
        );
        let policy = put(
            &store,
            ResourceType::Policy,
            Space::Draft,
            json!({"id": "p1", "integrations": ["i1"]}),
        );
        (store, decoder, rule, integration, policy)
    }

    #[test]
    fn resources_of_returns_summaries_per_type() {
        let (store, _, rule, _, _) = fixture();
        let service = SpaceService::new(store);
        let hashes = service.resources_of(Space::Draft).unwrap();
        assert_eq!(hashes[&ResourceType::Rule]["r1"], rule.hash());
        assert!(hashes[&ResourceType::Filter].is_empty());
        assert!(service.resources_of(Space::Test).unwrap()[&ResourceType::Rule].is_empty());
    }

    #[test]
    fn policy_aggregate_follows_traversal_order() {
        let (store, decoder, rule, integration, policy) = fixture();
        let service = SpaceService::new(Arc::clone(&store));

        let report = service.recalculate(&[Space::Draft]).unwrap();
        assert_eq!(report.policies, 1);
        assert_eq!(report.integrations, 1);
        // the dangling kvdb is counted once per traversal
        assert_eq!(report.missing_references, 2);

        let expected = ContentHasher::aggregate([
            policy.hash(),
            integration.hash(),
            decoder.hash(),
            rule.hash(),
        ]);
        let stored = service.policy(Space::Draft).unwrap().unwrap();
        assert_eq!(stored.space_hash(), Some(expected.as_str()));
        assert_eq!(stored.hash(), policy.hash());
    }

    #[test]
    fn child_change_propagates_to_aggregates() {
        let (store, _, _, _, _) = fixture();
        let service = SpaceService::new(Arc::clone(&store));
        service.recalculate(&[Space::Draft]).unwrap();
        let integration_before = service.integration_hash(Space::Draft, "i1").unwrap();
        let policy_before = service.policy(Space::Draft).unwrap().unwrap();

        put(&store, ResourceType::Rule, Space::Draft, json!({"id": "r1", "level": 2}));

        assert_ne!(service.integration_hash(Space::Draft, "i1").unwrap(), integration_before);
        service.recalculate(&[Space::Draft]).unwrap();
        let policy_after = service.policy(Space::Draft).unwrap().unwrap();
        assert_ne!(policy_after.space_hash(), policy_before.space_hash());
    }

    #[test]
    fn recalculate_only_touches_requested_spaces() {
        let (store, _, _, _, _) = fixture();
        put(&store, ResourceType::Policy, Space::Test, json!({"id": "p1"}));
        let service = SpaceService::new(Arc::clone(&store));
        service.recalculate(&[Space::Draft]).unwrap();
        assert_eq!(service.policy(Space::Test).unwrap().unwrap().space_hash(), None);
    }

    #[test]
    fn initialize_spaces_is_idempotent() {
        let store = Arc::new(InMemoryContentStore::new());
        let service = SpaceService::new(Arc::clone(&store));
        assert_eq!(service.initialize_spaces().unwrap(), USER_SPACES.to_vec());
        assert!(service.initialize_spaces().unwrap().is_empty());

        let draft = service.policy(Space::Draft).unwrap().unwrap();
        let custom = service.policy(Space::Custom).unwrap().unwrap();
        assert_eq!(draft.id(), default_policy_id());
        assert_eq!(draft.hash(), custom.hash());
        assert!(service.policy(Space::Standard).unwrap().is_none());
    }
}
