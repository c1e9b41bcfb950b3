//! Consumer cursors: local progress and the remote view of a consumer.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Local progress of one (context, consumer) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerState {
    /// Consumer name.
    pub name: String,
    /// Context name.
    pub context: String,
    /// Last offset fully applied locally.
    #[serde(default)]
    pub local_offset: u64,
    /// Last offset known to exist upstream.
    #[serde(default)]
    pub remote_offset: u64,
    /// Snapshot used for the last bootstrap. Empty if none.
    #[serde(default)]
    pub snapshot_link: String,
}

impl ConsumerState {
    /// Creates a fresh state with zero offsets.
    pub fn new(context: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            name: consumer.into(),
            context: context.into(),
            local_offset: 0,
            remote_offset: 0,
            snapshot_link: String::new(),
        }
    }

    /// Returns true if nothing has been applied yet.
    pub fn is_empty(&self) -> bool {
        self.local_offset == 0
    }
}

/// The remote catalog's description of a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteConsumer {
    /// Consumer name.
    #[serde(default)]
    pub name: String,
    /// Context name.
    #[serde(default)]
    pub context: String,
    /// Newest offset available in the change feed.
    #[serde(default)]
    pub last_offset: u64,
    /// Download URL of the newest snapshot.
    #[serde(default)]
    pub last_snapshot_link: Option<String>,
    /// Offset the newest snapshot was taken at.
    #[serde(default)]
    pub last_snapshot_offset: u64,
}

impl RemoteConsumer {
    /// Returns the snapshot link if one is advertised.
    pub fn snapshot_link(&self) -> Option<&str> {
        self.last_snapshot_link
            .as_deref()
            .filter(|link| !link.trim().is_empty())
    }
}

/// Persistence for consumer cursors.
///
/// The store is the single owner of offset state. Writers must be
/// serialized per (context, consumer); the store does not lock across calls.
pub trait ConsumerStateStore: Send + Sync {
    /// Reads the state of a consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, context: &str, consumer: &str) -> SyncResult<Option<ConsumerState>>;

    /// Upserts the state of a consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn set(&self, state: ConsumerState) -> SyncResult<()>;

    /// Zeroes both offsets and clears the snapshot link.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn reset(&self, context: &str, consumer: &str) -> SyncResult<()> {
        self.set(ConsumerState::new(context, consumer))
    }

    /// Reads the state, or a fresh zero state if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_or_default(&self, context: &str, consumer: &str) -> SyncResult<ConsumerState> {
        Ok(self
            .get(context, consumer)?
            .unwrap_or_else(|| ConsumerState::new(context, consumer)))
    }
}

/// An in-memory consumer state store.
#[derive(Debug, Default)]
pub struct MemoryConsumerStore {
    states: RwLock<BTreeMap<(String, String), ConsumerState>>,
}

impl MemoryConsumerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes every record as a JSON array.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn export(&self) -> SyncResult<String> {
        let states: Vec<ConsumerState> = self.states.read().values().cloned().collect();
        serde_json::to_string_pretty(&states)
            .map_err(|e| SyncError::ConsumerState(e.to_string()))
    }

    /// Loads records previously produced by [`export`](Self::export).
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid export.
    pub fn import(&self, json: &str) -> SyncResult<usize> {
        let states: Vec<ConsumerState> =
            serde_json::from_str(json).map_err(|e| SyncError::ConsumerState(e.to_string()))?;
        let count = states.len();
        let mut map = self.states.write();
        for state in states {
            map.insert((state.context.clone(), state.name.clone()), state);
        }
        Ok(count)
    }
}

impl ConsumerStateStore for MemoryConsumerStore {
    fn get(&self, context: &str, consumer: &str) -> SyncResult<Option<ConsumerState>> {
        Ok(self
            .states
            .read()
            .get(&(context.to_string(), consumer.to_string()))
            .cloned())
    }

    fn set(&self, state: ConsumerState) -> SyncResult<()> {
        self.states
            .write()
            .insert((state.context.clone(), state.name.clone()), state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_reset() {
        let store = MemoryConsumerStore::new();
        assert!(store.get("ctx", "c").unwrap().is_none());
        assert!(store.get_or_default("ctx", "c").unwrap().is_empty());

        let mut state = ConsumerState::new("ctx", "c");
        state.local_offset = 10;
        state.remote_offset = 12;
        state.snapshot_link = "https://cti/snap.zip".into();
        store.set(state.clone()).unwrap();
        assert_eq!(store.get("ctx", "c").unwrap(), Some(state));

        store.reset("ctx", "c").unwrap();
        let reset = store.get("ctx", "c").unwrap().unwrap();
        assert_eq!(reset.local_offset, 0);
        assert_eq!(reset.remote_offset, 0);
        assert!(reset.snapshot_link.is_empty());
    }

    #[test]
    fn consumers_are_keyed_by_context_and_name() {
        let store = MemoryConsumerStore::new();
        let mut a = ConsumerState::new("ctx", "a");
        a.local_offset = 1;
        store.set(a).unwrap();
        store.set(ConsumerState::new("other", "a")).unwrap();
        assert_eq!(store.get("ctx", "a").unwrap().unwrap().local_offset, 1);
    }

    #[test]
    fn export_import() {
        let store = MemoryConsumerStore::new();
        let mut state = ConsumerState::new("ctx", "c");
        state.local_offset = 7;
        store.set(state.clone()).unwrap();

        let restored = MemoryConsumerStore::new();
        assert_eq!(restored.import(&store.export().unwrap()).unwrap(), 1);
        assert_eq!(restored.get("ctx", "c").unwrap(), Some(state));
        assert!(restored.import("{").is_err());
    }

    #[test]
    fn remote_consumer_parsing() {
        let remote: RemoteConsumer = serde_json::from_value(json!({
            "name": "c",
            "context": "ctx",
            "last_offset": 42,
            "last_snapshot_link": "https://cti/snap.zip",
            "last_snapshot_offset": 40,
            "changes_url": "ignored",
            "inserted_at": "2024-01-01"
        }))
        .unwrap();
        assert_eq!(remote.last_offset, 42);
        assert_eq!(remote.snapshot_link(), Some("https://cti/snap.zip"));

        let bare: RemoteConsumer =
            serde_json::from_value(json!({"last_snapshot_link": null})).unwrap();
        assert_eq!(bare.snapshot_link(), None);
        assert_eq!(bare.last_offset, 0);
    }
}
