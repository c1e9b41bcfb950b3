//! Promotion diff model.

use catalog_content::{ResourceType, Space};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Operation needed to bring one target resource in line with the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionOperation {
    /// Copy a resource that only exists in the source.
    Add,
    /// Overwrite a target resource whose hash differs.
    Update,
    /// Delete a resource that only exists in the target.
    #[serde(rename = "delete", alias = "remove")]
    Remove,
}

impl fmt::Display for PromotionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PromotionOperation::Add => "add",
            PromotionOperation::Update => "update",
            PromotionOperation::Remove => "delete",
        })
    }
}

/// One row of a promotion preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionChange {
    /// Collection of the resource.
    pub resource_type: ResourceType,
    /// Resource ID.
    pub id: String,
    /// Operation to apply.
    pub operation: PromotionOperation,
}

/// Preview result: changes per resource type.
pub type PromotionPreview = BTreeMap<ResourceType, Vec<PromotionChange>>;

/// `{operation, id}` item of a [`SpaceDiff`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeItem {
    /// Operation to apply.
    pub operation: PromotionOperation,
    /// Resource ID.
    pub id: String,
}

impl ChangeItem {
    /// Creates an item.
    pub fn new(operation: PromotionOperation, id: impl Into<String>) -> Self {
        Self {
            operation,
            id: id.into(),
        }
    }
}

/// Changes per collection of a [`SpaceDiff`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceChanges {
    /// Policy changes. Only updates are valid.
    pub policy: Vec<ChangeItem>,
    /// Integration changes.
    pub integrations: Vec<ChangeItem>,
    /// Kvdb changes.
    pub kvdbs: Vec<ChangeItem>,
    /// Decoder changes.
    pub decoders: Vec<ChangeItem>,
    /// Filter changes.
    pub filters: Vec<ChangeItem>,
    /// Rule changes.
    #[serde(default)]
    pub rules: Vec<ChangeItem>,
}

impl SpaceChanges {
    /// Returns the items for one collection. IoCs never have any.
    pub fn for_type(&self, resource_type: ResourceType) -> &[ChangeItem] {
        match resource_type {
            ResourceType::Policy => &self.policy,
            ResourceType::Integration => &self.integrations,
            ResourceType::Kvdb => &self.kvdbs,
            ResourceType::Decoder => &self.decoders,
            ResourceType::Filter => &self.filters,
            ResourceType::Rule => &self.rules,
            ResourceType::Ioc => &[],
        }
    }

    fn for_type_mut(&mut self, resource_type: ResourceType) -> Option<&mut Vec<ChangeItem>> {
        match resource_type {
            ResourceType::Policy => Some(&mut self.policy),
            ResourceType::Integration => Some(&mut self.integrations),
            ResourceType::Kvdb => Some(&mut self.kvdbs),
            ResourceType::Decoder => Some(&mut self.decoders),
            ResourceType::Filter => Some(&mut self.filters),
            ResourceType::Rule => Some(&mut self.rules),
            ResourceType::Ioc => None,
        }
    }

    /// Total number of items.
    pub fn len(&self) -> usize {
        ResourceType::PROMOTABLE
            .into_iter()
            .map(|t| self.for_type(t).len())
            .sum()
    }

    /// Returns true if there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Execution request: the previewed changes of a source space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceDiff {
    /// Source space.
    pub space: Space,
    /// Changes to apply to the source's promotion target.
    pub changes: SpaceChanges,
}

impl SpaceDiff {
    /// Builds an execution request from a preview.
    pub fn from_preview(space: Space, preview: &PromotionPreview) -> Self {
        let mut changes = SpaceChanges::default();
        for change in preview.values().flatten() {
            if let Some(items) = changes.for_type_mut(change.resource_type) {
                items.push(ChangeItem::new(change.operation, change.id.clone()));
            }
        }
        Self { space, changes }
    }
}

/// Diffs two `{id: hash}` maps.
///
/// Output is sorted by operation, then ID. Unchanged IDs are omitted.
pub fn diff_hashes(
    resource_type: ResourceType,
    source: &BTreeMap<String, String>,
    target: &BTreeMap<String, String>,
) -> Vec<PromotionChange> {
    let mut changes = Vec::new();
    let mut push = |id: &str, operation| {
        changes.push(PromotionChange {
            resource_type,
            id: id.to_string(),
            operation,
        })
    };

    for (id, hash) in source {
        match target.get(id) {
            None => push(id, PromotionOperation::Add),
            Some(target_hash) if target_hash != hash => push(id, PromotionOperation::Update),
            Some(_) => {}
        }
    }
    for id in target.keys().filter(|id| !source.contains_key(*id)) {
        push(id, PromotionOperation::Remove);
    }

    changes.sort_by(|a, b| (a.operation, &a.id).cmp(&(b.operation, &b.id)));
    changes
}
