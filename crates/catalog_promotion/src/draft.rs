//! Lifecycle of user-authored content in the draft space.

use crate::error::{PromotionError, PromotionResult};
use crate::link::ResourceLinkGraph;
use crate::validation::ValidationService;
use catalog_content::{ContentStore, ReferenceList, Resource, ResourceType, Space, SpaceService};
use catalog_sync_engine::{ExternalRegistrationService, RegistrationTask};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fields carried over from the stored document on update.
const PRESERVED_FIELDS: [&str; 1] = ["date"];

/// Creates, updates and deletes draft content.
///
/// Every mutation keeps reference lists, the registration service and the
/// draft policy's aggregate hash in step with the store.
pub struct DraftContentService {
    store: Arc<dyn ContentStore>,
    links: ResourceLinkGraph,
    spaces: SpaceService<dyn ContentStore>,
    validator: Arc<dyn ValidationService>,
    registration: Arc<dyn ExternalRegistrationService>,
}

impl DraftContentService {
    /// Creates a new service.
    pub fn new(
        store: Arc<dyn ContentStore>,
        validator: Arc<dyn ValidationService>,
        registration: Arc<dyn ExternalRegistrationService>,
    ) -> Self {
        Self {
            links: ResourceLinkGraph::new(Arc::clone(&store)),
            spaces: SpaceService::new(Arc::clone(&store)),
            store,
            validator,
            registration,
        }
    }

    /// Returns the link graph.
    pub fn links(&self) -> &ResourceLinkGraph {
        &self.links
    }

    /// Creates a draft resource and returns its new ID.
    ///
    /// Decoders, rules and kvdbs are linked to `parent_integration`, which
    /// must exist in draft. Integrations and filters are linked to the draft
    /// policy when there is one.
    ///
    /// # Errors
    ///
    /// Returns a validation, not-found, link or store error. Registration
    /// failures are only logged.
    pub async fn create(
        &self,
        resource_type: ResourceType,
        document: Value,
        parent_integration: Option<&str>,
    ) -> PromotionResult<String> {
        if matches!(resource_type, ResourceType::Policy | ResourceType::Ioc) {
            return Err(PromotionError::Validation(format!(
                "{} cannot be created in draft",
                resource_type.plural()
            )));
        }
        let mut body = user_document(document)?;

        let link = match ReferenceList::for_child(resource_type) {
            Some(list) => {
                let parent = parent_integration.ok_or_else(|| {
                    PromotionError::Validation(format!(
                        "a {resource_type} needs a parent integration"
                    ))
                })?;
                if !self.store.exists(ResourceType::Integration, Space::Draft, parent)? {
                    return Err(PromotionError::not_found(
                        ResourceType::Integration,
                        Space::Draft,
                        parent,
                    ));
                }
                Some((parent.to_string(), list))
            }
            None => self.policy_link(resource_type)?,
        };

        let id = Uuid::new_v4().to_string();
        body.insert("id".into(), Value::String(id.clone()));
        if resource_type == ResourceType::Integration {
            for list in ReferenceList::HASH_ORDER {
                body.entry(list.key()).or_insert_with(|| Value::Array(Vec::new()));
            }
        }
        let document = Value::Object(body);

        self.validator.validate(resource_type, &document).await?;
        let resource = Resource::new(resource_type, Space::Draft, document)?;
        let registered = resource.document().clone();

        match link {
            Some((parent, list)) => self.links.create_linked(resource, &parent, list)?,
            None => self.store.create(resource)?,
        }
        info!(resource_type = %resource_type, id = %id, "draft resource created");

        self.register(resource_type, &registered).await;
        self.spaces.recalculate(&[Space::Draft])?;
        Ok(id)
    }

    /// Replaces the document of a draft resource.
    ///
    /// `date` and `enabled` are kept from the stored document when the new one
    /// does not set them, and container reference lists are always kept.
    ///
    /// # Errors
    ///
    /// Returns a validation, not-found or store error.
    pub async fn update(
        &self,
        resource_type: ResourceType,
        id: &str,
        document: Value,
    ) -> PromotionResult<()> {
        let mut stored = self
            .store
            .get(resource_type, Space::Draft, id)?
            .ok_or_else(|| PromotionError::not_found(resource_type, Space::Draft, id))?;
        let mut body = user_document(document)?;
        body.insert("id".into(), Value::String(id.to_string()));

        let previous = stored.document();
        for field in PRESERVED_FIELDS {
            if let Some(value) = previous.get(field) {
                body.insert(field.into(), value.clone());
            }
        }
        if !body.contains_key("enabled") {
            body.insert(
                "enabled".into(),
                previous.get("enabled").cloned().unwrap_or(Value::Bool(true)),
            );
        }
        for list in container_lists(resource_type) {
            body.insert(
                list.key().into(),
                previous.get(list.key()).cloned().unwrap_or_else(|| Value::Array(Vec::new())),
            );
        }
        let document = Value::Object(body);

        self.validator.validate(resource_type, &document).await?;
        stored.replace_document(document)?;
        let registered = stored.document().clone();
        self.store.create(stored)?;
        debug!(resource_type = %resource_type, id, "draft resource updated");

        self.register(resource_type, &registered).await;
        self.spaces.recalculate(&[Space::Draft])?;
        Ok(())
    }

    /// Deletes a draft resource.
    ///
    /// The registration is removed first; a registration that does not exist
    /// is fine, any other registration failure aborts with nothing changed.
    ///
    /// # Errors
    ///
    /// Returns a not-found, linked-resources, registration or store error.
    pub async fn delete(&self, resource_type: ResourceType, id: &str) -> PromotionResult<()> {
        let existing = self
            .store
            .get(resource_type, Space::Draft, id)?
            .ok_or_else(|| PromotionError::not_found(resource_type, Space::Draft, id))?;

        match resource_type {
            ResourceType::Policy => {
                return Err(PromotionError::Validation(
                    "the policy of a space cannot be deleted".into(),
                ))
            }
            ResourceType::Integration => self.links.check_deletable(&existing)?,
            _ => {}
        }

        if RegistrationTask::is_registrable(resource_type) {
            match self.registration.delete(resource_type, id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(resource_type = %resource_type, id, "registration already absent");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(list) = parent_list(resource_type) {
            self.links.unlink(id, list)?;
        }
        self.store.delete(resource_type, Space::Draft, id)?;
        info!(resource_type = %resource_type, id, "draft resource deleted");

        self.spaces.recalculate(&[Space::Draft])?;
        Ok(())
    }

    fn policy_link(
        &self,
        resource_type: ResourceType,
    ) -> PromotionResult<Option<(String, ReferenceList)>> {
        let Some(list) = parent_list(resource_type) else {
            return Ok(None);
        };
        Ok(self
            .spaces
            .policy(Space::Draft)?
            .map(|policy| (policy.id().to_string(), list)))
    }

    async fn register(&self, resource_type: ResourceType, document: &Value) {
        if !RegistrationTask::is_registrable(resource_type) {
            return;
        }
        if let Err(e) = self
            .registration
            .upsert(resource_type, document, Space::Draft)
            .await
        {
            warn!(resource_type = %resource_type, error = %e, "registration sync failed");
        }
    }
}

/// Checks the shape of a user document and returns its fields.
fn user_document(document: Value) -> PromotionResult<Map<String, Value>> {
    let Value::Object(body) = document else {
        return Err(PromotionError::Validation("document must be an object".into()));
    };
    let titled = body
        .get("title")
        .and_then(Value::as_str)
        .is_some_and(|title| !title.trim().is_empty());
    if !titled {
        return Err(PromotionError::Validation("title is required".into()));
    }
    Ok(body)
}

/// The reference list a resource of this type is listed in.
fn parent_list(resource_type: ResourceType) -> Option<ReferenceList> {
    match resource_type {
        ResourceType::Integration => Some(ReferenceList::Integrations),
        ResourceType::Filter => Some(ReferenceList::Filters),
        other => ReferenceList::for_child(other),
    }
}

/// The reference lists a container of this type owns.
fn container_lists(resource_type: ResourceType) -> &'static [ReferenceList] {
    match resource_type {
        ResourceType::Integration => &ReferenceList::HASH_ORDER,
        ResourceType::Policy => &[ReferenceList::Integrations, ReferenceList::Filters],
        _ => &[],
    }
}
