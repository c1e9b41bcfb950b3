//! Space promotion: preview a diff, then execute it.

use crate::diff::{
    diff_hashes, ChangeItem, PromotionChange, PromotionOperation, PromotionPreview, SpaceDiff,
};
use crate::error::{PromotionError, PromotionResult};
use crate::validation::ValidationService;
use catalog_content::{ContentStore, RecalculateReport, Resource, ResourceType, Space, SpaceService};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the promotion engine.
#[derive(Debug, Clone, Default)]
pub struct PromotionConfig {
    /// Target spaces whose policy hash is not recalculated after execute.
    pub recalculate_excluded: Vec<Space>,
}

impl PromotionConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Skips hash recalculation for `space`.
    pub fn with_excluded(mut self, space: Space) -> Self {
        if !self.recalculate_excluded.contains(&space) {
            self.recalculate_excluded.push(space);
        }
        self
    }
}

/// Counts of an executed promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    /// Target space.
    pub target: Option<Space>,
    /// Resources copied into the target.
    pub added: usize,
    /// Resources overwritten in the target.
    pub updated: usize,
    /// Resources deleted from the target.
    pub removed: usize,
    /// Removals whose target was already gone.
    pub missing_removals: usize,
    /// Aggregate hash recalculation of the target.
    pub recalculated: Option<RecalculateReport>,
}

/// A resolved write, checked before anything is applied.
enum Planned {
    Write {
        operation: PromotionOperation,
        resource: Resource,
    },
    Remove {
        resource_type: ResourceType,
        id: String,
    },
    Policy {
        source: Resource,
    },
}

/// Computes and applies promotions between adjacent spaces.
pub struct PromotionEngine {
    store: Arc<dyn ContentStore>,
    spaces: SpaceService<dyn ContentStore>,
    validator: Arc<dyn ValidationService>,
    config: PromotionConfig,
}

impl PromotionEngine {
    /// Creates a new engine.
    pub fn new(
        store: Arc<dyn ContentStore>,
        validator: Arc<dyn ValidationService>,
        config: PromotionConfig,
    ) -> Self {
        Self {
            spaces: SpaceService::new(Arc::clone(&store)),
            store,
            validator,
            config,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    /// Computes the changes that bring the target of `source` in line with it.
    ///
    /// Every promotable type gets an entry, possibly empty. Policies are
    /// compared by document body with `id` ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PromotionError::UnpromotableSpace`] for `standard`, or a
    /// store error.
    pub fn preview(&self, source: Space) -> PromotionResult<PromotionPreview> {
        let target = source
            .promotion_target()
            .ok_or(PromotionError::UnpromotableSpace(source))?;

        let mut preview = PromotionPreview::new();
        for resource_type in ResourceType::PROMOTABLE {
            let changes = if resource_type == ResourceType::Policy {
                self.policy_diff(source, target)?
            } else {
                diff_hashes(
                    resource_type,
                    &self.spaces.hashes_of(resource_type, source)?,
                    &self.spaces.hashes_of(resource_type, target)?,
                )
            };
            preview.insert(resource_type, changes);
        }

        debug!(
            source = %source,
            target = %target,
            changes = preview.values().map(Vec::len).sum::<usize>(),
            "promotion previewed"
        );
        Ok(preview)
    }

    fn policy_diff(&self, source: Space, target: Space) -> PromotionResult<Vec<PromotionChange>> {
        let Some(source_policy) = self.spaces.policy(source)? else {
            return Ok(Vec::new());
        };
        let unchanged = self
            .spaces
            .policy(target)?
            .is_some_and(|t| without_id(t.document()) == without_id(source_policy.document()));
        if unchanged {
            return Ok(Vec::new());
        }
        Ok(vec![PromotionChange {
            resource_type: ResourceType::Policy,
            id: source_policy.id().to_string(),
            operation: PromotionOperation::Update,
        }])
    }

    /// Applies a previewed diff to the target of `diff.space`.
    ///
    /// The whole request is checked and every written document validated
    /// before the first write. The target's aggregate hashes are recalculated
    /// afterwards unless the target is excluded by configuration.
    ///
    /// # Errors
    ///
    /// Returns a precondition or validation error with nothing written, or a
    /// store error.
    pub async fn execute(&self, diff: &SpaceDiff) -> PromotionResult<PromotionReport> {
        let source = diff.space;
        let target = source
            .promotion_target()
            .ok_or(PromotionError::UnpromotableSpace(source))?;

        if let Some(item) = diff
            .changes
            .policy
            .iter()
            .find(|item| item.operation != PromotionOperation::Update)
        {
            return Err(PromotionError::InvalidPolicyOperation(item.operation));
        }

        let plan = self.plan(diff, target)?;
        for step in &plan {
            match step {
                Planned::Write { resource, .. } | Planned::Policy { source: resource } => {
                    self.validator
                        .validate(resource.resource_type(), resource.document())
                        .await?;
                }
                Planned::Remove { .. } => {}
            }
        }

        let mut report = PromotionReport {
            target: Some(target),
            ..PromotionReport::default()
        };
        for step in plan {
            self.apply(step, target, &mut report)?;
        }

        if !self.config.recalculate_excluded.contains(&target) {
            report.recalculated = Some(self.spaces.recalculate(&[target])?);
        }

        info!(
            source = %source,
            target = %target,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            "promotion executed"
        );
        Ok(report)
    }

    fn plan(&self, diff: &SpaceDiff, target: Space) -> PromotionResult<Vec<Planned>> {
        let source = diff.space;
        let mut plan = Vec::new();

        for ChangeItem { id, .. } in &diff.changes.policy {
            let policy = self
                .spaces
                .policy(source)?
                .filter(|p| p.id() == id)
                .ok_or_else(|| PromotionError::not_found(ResourceType::Policy, source, id))?;
            plan.push(Planned::Policy { source: policy });
        }

        for resource_type in ResourceType::PROMOTABLE {
            if resource_type == ResourceType::Policy {
                continue;
            }
            for ChangeItem { operation, id } in diff.changes.for_type(resource_type) {
                if *operation == PromotionOperation::Remove {
                    plan.push(Planned::Remove {
                        resource_type,
                        id: id.clone(),
                    });
                    continue;
                }
                let resource = self
                    .store
                    .get(resource_type, source, id)?
                    .ok_or_else(|| PromotionError::not_found(resource_type, source, id))?;
                if *operation == PromotionOperation::Add
                    && self.store.exists(resource_type, target, id)?
                {
                    return Err(PromotionError::AlreadyExists {
                        resource_type,
                        space: target,
                        id: id.clone(),
                    });
                }
                plan.push(Planned::Write {
                    operation: *operation,
                    resource,
                });
            }
        }
        Ok(plan)
    }

    fn apply(
        &self,
        step: Planned,
        target: Space,
        report: &mut PromotionReport,
    ) -> PromotionResult<()> {
        match step {
            Planned::Write {
                operation,
                resource,
            } => {
                debug!(
                    resource_type = %resource.resource_type(),
                    id = resource.id(),
                    %operation,
                    "promoting"
                );
                self.store.create(resource.with_space(target))?;
                match operation {
                    PromotionOperation::Add => report.added += 1,
                    _ => report.updated += 1,
                }
            }
            Planned::Remove { resource_type, id } => {
                if self.store.delete(resource_type, target, &id)? {
                    report.removed += 1;
                } else {
                    warn!(
                        resource_type = %resource_type,
                        id = %id,
                        space = %target,
                        "promoted removal target already gone"
                    );
                    report.missing_removals += 1;
                }
            }
            Planned::Policy { source } => {
                for stale in self.store.search_by_space(ResourceType::Policy, target)? {
                    if stale.id() != source.id() {
                        self.store.delete(ResourceType::Policy, target, stale.id())?;
                    }
                }
                self.store.create(source.with_space(target))?;
                report.updated += 1;
            }
        }
        Ok(())
    }
}

fn without_id(document: &Value) -> Value {
    let mut document = document.clone();
    if let Some(map) = document.as_object_mut() {
        map.remove("id");
    }
    document
}
