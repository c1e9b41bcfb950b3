//! Change feed records and the client abstraction that fetches them.

use crate::consumer::RemoteConsumer;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use catalog_content::{PatchOperation, ResourceType};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Kind of change carried by a [`ChangeRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    /// A new resource with a full payload.
    Create,
    /// Patch operations against an existing resource.
    Update,
    /// Removal of an existing resource.
    Delete,
}

impl ChangeType {
    /// Parses a change type, ignoring case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Some(ChangeType::Create),
            "UPDATE" => Some(ChangeType::Update),
            "DELETE" => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Create => f.write_str("CREATE"),
            ChangeType::Update => f.write_str("UPDATE"),
            ChangeType::Delete => f.write_str("DELETE"),
        }
    }
}

impl<'de> Deserialize<'de> for ChangeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ChangeType::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown change type '{raw}'")))
    }
}

/// `{type, document}` payload of a CREATE record or snapshot line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    /// Declared resource type, kept raw so unknown types can be skipped.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Document body.
    pub document: Value,
}

impl ChangePayload {
    /// Returns the declared type if it is a managed collection.
    pub fn managed_type(&self) -> Option<ResourceType> {
        ResourceType::parse(&self.resource_type)
    }
}

/// One entry of the remote change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position in the feed. Unique and strictly increasing.
    pub offset: u64,
    /// ID of the affected resource.
    pub resource: String,
    /// Kind of change.
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// Context the change belongs to.
    #[serde(default)]
    pub context: String,
    /// Resource version after the change.
    #[serde(default)]
    pub version: Option<u64>,
    /// Patch operations of an UPDATE.
    #[serde(default)]
    pub operations: Vec<PatchOperation>,
    /// Full payload of a CREATE.
    #[serde(default)]
    pub payload: Option<ChangePayload>,
}

impl ChangeRecord {
    /// Builds a CREATE record.
    pub fn create(offset: u64, resource_type: ResourceType, document: Value) -> Self {
        let resource = document
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            offset,
            resource,
            change_type: ChangeType::Create,
            context: String::new(),
            version: None,
            operations: Vec::new(),
            payload: Some(ChangePayload {
                resource_type: resource_type.as_str().to_string(),
                document,
            }),
        }
    }

    /// Builds an UPDATE record.
    pub fn update(
        offset: u64,
        resource: impl Into<String>,
        operations: Vec<PatchOperation>,
    ) -> Self {
        Self {
            offset,
            resource: resource.into(),
            change_type: ChangeType::Update,
            context: String::new(),
            version: None,
            operations,
            payload: None,
        }
    }

    /// Builds a DELETE record.
    pub fn delete(offset: u64, resource: impl Into<String>) -> Self {
        Self {
            offset,
            resource: resource.into(),
            change_type: ChangeType::Delete,
            context: String::new(),
            version: None,
            operations: Vec::new(),
            payload: None,
        }
    }
}

/// `{"data": [...]}` envelope returned by the changes endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Records, in whatever order the remote returned them.
    #[serde(default)]
    pub data: Vec<ChangeRecord>,
}

/// Fetches change batches and consumer metadata from the remote catalog.
#[async_trait]
pub trait ChangeFeedClient: Send + Sync {
    /// Fetches the records in `(from_offset, to_offset]`.
    async fn fetch_changes(
        &self,
        context: &str,
        consumer: &str,
        from_offset: u64,
        to_offset: u64,
    ) -> SyncResult<Vec<ChangeRecord>>;

    /// Fetches the remote view of a consumer.
    async fn fetch_consumer(&self, context: &str, consumer: &str) -> SyncResult<RemoteConsumer>;
}

/// An in-memory change feed for testing.
#[derive(Debug, Default)]
pub struct MockChangeFeed {
    records: RwLock<Vec<ChangeRecord>>,
    consumer: RwLock<RemoteConsumer>,
    failing: AtomicBool,
    requests: RwLock<Vec<(u64, u64)>>,
}

impl MockChangeFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record. Records are served in insertion order.
    pub fn push(&self, record: ChangeRecord) {
        self.records.write().push(record);
    }

    /// Sets the consumer returned by `fetch_consumer`.
    pub fn set_consumer(&self, consumer: RemoteConsumer) {
        *self.consumer.write() = consumer;
    }

    /// Makes every call fail with a retryable transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the `(from, to)` ranges requested so far.
    pub fn requests(&self) -> Vec<(u64, u64)> {
        self.requests.read().clone()
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("mock feed unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeedClient for MockChangeFeed {
    async fn fetch_changes(
        &self,
        _context: &str,
        _consumer: &str,
        from_offset: u64,
        to_offset: u64,
    ) -> SyncResult<Vec<ChangeRecord>> {
        self.requests.write().push((from_offset, to_offset));
        self.check()?;
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.offset > from_offset && r.offset <= to_offset)
            .cloned()
            .collect())
    }

    async fn fetch_consumer(&self, _context: &str, _consumer: &str) -> SyncResult<RemoteConsumer> {
        self.check()?;
        Ok(self.consumer.read().clone())
    }
}
