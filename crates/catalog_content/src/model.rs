//! Resource model: resource types, spaces and the stored resource wrapper.

use crate::error::{ContentError, ContentResult};
use crate::hasher::ContentHasher;
use crate::patch::{self, PatchOperation};
use crate::sanitize::sanitize_document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of catalog content. Each kind lives in its own collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// The singleton policy of a space.
    #[serde(alias = "policies")]
    Policy,
    /// Integration: a container of decoders, rules and kvdbs.
    #[serde(alias = "integrations")]
    Integration,
    /// Log decoder.
    #[serde(alias = "decoders")]
    Decoder,
    /// Key-value database.
    #[serde(alias = "kvdbs")]
    Kvdb,
    /// Detection rule.
    #[serde(alias = "rules")]
    Rule,
    /// Event filter.
    #[serde(alias = "filters")]
    Filter,
    /// Indicator of compromise. Stored, never promoted.
    #[serde(alias = "iocs")]
    Ioc,
}

impl ResourceType {
    /// Every managed collection, in routing order.
    pub const ALL: [ResourceType; 7] = [
        ResourceType::Policy,
        ResourceType::Integration,
        ResourceType::Decoder,
        ResourceType::Kvdb,
        ResourceType::Rule,
        ResourceType::Filter,
        ResourceType::Ioc,
    ];

    /// Collections that take part in space promotion.
    pub const PROMOTABLE: [ResourceType; 6] = [
        ResourceType::Policy,
        ResourceType::Integration,
        ResourceType::Decoder,
        ResourceType::Kvdb,
        ResourceType::Rule,
        ResourceType::Filter,
    ];

    /// Returns the singular wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceType::Policy => "policy",
            ResourceType::Integration => "integration",
            ResourceType::Decoder => "decoder",
            ResourceType::Kvdb => "kvdb",
            ResourceType::Rule => "rule",
            ResourceType::Filter => "filter",
            ResourceType::Ioc => "ioc",
        }
    }

    /// Returns the plural key used in diff payloads.
    pub const fn plural(self) -> &'static str {
        match self {
            ResourceType::Policy => "policy",
            ResourceType::Integration => "integrations",
            ResourceType::Decoder => "decoders",
            ResourceType::Kvdb => "kvdbs",
            ResourceType::Rule => "rules",
            ResourceType::Filter => "filters",
            ResourceType::Ioc => "iocs",
        }
    }

    /// Returns true if this type can be promoted between spaces.
    pub fn is_promotable(self) -> bool {
        self != ResourceType::Ioc
    }

    /// Parses a type name, accepting singular or plural, any case.
    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == lower || t.plural() == lower)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ContentError::invalid(format!("unknown resource type '{s}'")))
    }
}

/// Lifecycle environment holding an independent copy of the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Space {
    /// Work in progress, the only space open to user edits.
    Draft,
    /// Content under test.
    #[serde(alias = "testing")]
    Test,
    /// Accepted user content.
    Custom,
    /// Catalog content mirrored from upstream.
    Standard,
}

impl Space {
    /// All spaces in promotion order.
    pub const ALL: [Space; 4] = [Space::Draft, Space::Test, Space::Custom, Space::Standard];

    /// Returns the wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Space::Draft => "draft",
            Space::Test => "test",
            Space::Custom => "custom",
            Space::Standard => "standard",
        }
    }

    /// Returns the space this one promotes into, if any.
    pub const fn promotion_target(self) -> Option<Space> {
        match self {
            Space::Draft => Some(Space::Test),
            Space::Test => Some(Space::Custom),
            Space::Custom => Some(Space::Standard),
            Space::Standard => None,
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Space {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(Space::Draft),
            "test" | "testing" => Ok(Space::Test),
            "custom" => Ok(Space::Custom),
            "standard" => Ok(Space::Standard),
            other => Err(ContentError::invalid(format!("unknown space '{other}'"))),
        }
    }
}

/// Named reference list held by a container document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceList {
    /// `decoders` of an integration.
    Decoders,
    /// `rules` of an integration.
    Rules,
    /// `kvdbs` of an integration.
    Kvdbs,
    /// `integrations` of a policy.
    Integrations,
    /// `filters` of a policy.
    Filters,
}

impl ReferenceList {
    /// Integration lists in aggregate hashing order.
    pub const HASH_ORDER: [ReferenceList; 3] = [
        ReferenceList::Decoders,
        ReferenceList::Kvdbs,
        ReferenceList::Rules,
    ];

    /// Integration lists in delete-precondition order.
    pub const DELETE_ORDER: [ReferenceList; 3] = [
        ReferenceList::Decoders,
        ReferenceList::Rules,
        ReferenceList::Kvdbs,
    ];

    /// Returns the document key of this list.
    pub const fn key(self) -> &'static str {
        match self {
            ReferenceList::Decoders => "decoders",
            ReferenceList::Rules => "rules",
            ReferenceList::Kvdbs => "kvdbs",
            ReferenceList::Integrations => "integrations",
            ReferenceList::Filters => "filters",
        }
    }

    /// Returns the resource type the list points at.
    pub const fn child_type(self) -> ResourceType {
        match self {
            ReferenceList::Decoders => ResourceType::Decoder,
            ReferenceList::Rules => ResourceType::Rule,
            ReferenceList::Kvdbs => ResourceType::Kvdb,
            ReferenceList::Integrations => ResourceType::Integration,
            ReferenceList::Filters => ResourceType::Filter,
        }
    }

    /// Returns the list an integration uses for children of `resource_type`.
    pub fn for_child(resource_type: ResourceType) -> Option<Self> {
        match resource_type {
            ResourceType::Decoder => Some(ReferenceList::Decoders),
            ResourceType::Rule => Some(ReferenceList::Rules),
            ResourceType::Kvdb => Some(ReferenceList::Kvdbs),
            _ => None,
        }
    }
}

impl fmt::Display for ReferenceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A `{"sha256": "..."}` digest field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashField {
    /// Lowercase hex SHA-256.
    pub sha256: String,
}

/// The `space` section of a stored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceTag {
    /// Space the physical copy belongs to.
    pub name: Space,
    /// Aggregate hash of a container, if computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashField>,
}

/// `{id, hash}` pair used for cheap space comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSummary {
    /// Logical resource ID.
    pub id: String,
    /// Document hash.
    pub hash: String,
}

/// A stored resource: one physical copy of a document in one space.
///
/// The document hash is maintained by every mutator, so it is never stale.
/// The document must be a JSON object carrying a non-empty string `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    resource_type: ResourceType,
    document: Value,
    space: SpaceTag,
    hash: HashField,
}

impl Resource {
    /// Creates a resource, hashing the document as given.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not an object with a string `id`.
    pub fn new(resource_type: ResourceType, space: Space, document: Value) -> ContentResult<Self> {
        validate_document(&document)?;
        let hash = ContentHasher::hash(&document);
        Ok(Self {
            resource_type,
            document,
            space: SpaceTag { name: space, hash: None },
            hash: HashField { sha256: hash },
        })
    }

    /// Creates a resource from ingested content, sanitizing it before hashing.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not an object with a string `id`.
    pub fn ingest(
        resource_type: ResourceType,
        space: Space,
        document: Value,
    ) -> ContentResult<Self> {
        Self::new(resource_type, space, sanitize_document(document))
    }

    /// Logical resource ID (`document.id`).
    pub fn id(&self) -> &str {
        self.document
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Collection this resource belongs to.
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Space of this physical copy.
    pub fn space(&self) -> Space {
        self.space.name
    }

    /// Document body.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Document hash.
    pub fn hash(&self) -> &str {
        &self.hash.sha256
    }

    /// Aggregate hash of a container, if computed.
    pub fn space_hash(&self) -> Option<&str> {
        self.space.hash.as_ref().map(|h| h.sha256.as_str())
    }

    /// Returns the `{id, hash}` summary.
    pub fn summary(&self) -> ResourceSummary {
        ResourceSummary {
            id: self.id().to_string(),
            hash: self.hash().to_string(),
        }
    }

    /// Stores the aggregate hash.
    pub fn set_space_hash(&mut self, digest: impl Into<String>) {
        self.space.hash = Some(HashField {
            sha256: digest.into(),
        });
    }

    /// Returns a copy re-tagged into another space.
    ///
    /// The aggregate hash belongs to the old space and is dropped.
    #[must_use]
    pub fn with_space(mut self, space: Space) -> Self {
        self.space = SpaceTag { name: space, hash: None };
        self
    }

    /// Replaces the document and recomputes its hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the new document is not an object with a string `id`.
    pub fn replace_document(&mut self, document: Value) -> ContentResult<()> {
        validate_document(&document)?;
        self.hash = HashField {
            sha256: ContentHasher::hash(&document),
        };
        self.document = document;
        Ok(())
    }

    /// Returns a patched copy of this resource. `self` is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if any operation fails or the result is not a valid document.
    pub fn apply_patch(&self, operations: &[PatchOperation]) -> ContentResult<Resource> {
        let patched = patch::apply_all(&self.document, operations)?;
        let mut next = self.clone();
        next.replace_document(sanitize_document(patched))?;
        Ok(next)
    }

    /// Reads a reference list. Missing or malformed lists read as empty.
    pub fn references(&self, list: ReferenceList) -> Vec<String> {
        self.document
            .get(list.key())
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrites a reference list and recomputes the hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not an object.
    pub fn set_references(&mut self, list: ReferenceList, ids: Vec<String>) -> ContentResult<()> {
        let mut document = self.document.clone();
        let map = document
            .as_object_mut()
            .ok_or_else(|| ContentError::invalid("document is not an object"))?;
        map.insert(
            list.key().to_string(),
            Value::Array(ids.into_iter().map(Value::String).collect()),
        );
        self.replace_document(document)
    }
}

fn validate_document(document: &Value) -> ContentResult<()> {
    let map = document
        .as_object()
        .ok_or_else(|| ContentError::invalid("document is not an object"))?;
    match map.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(()),
        _ => Err(ContentError::invalid("document has no string 'id'")),
    }
}
