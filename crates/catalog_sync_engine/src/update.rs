//! Incremental update engine.
//!
//! One cycle fetches the change records in `(from, to]`, applies them in
//! ascending offset order and then commits the consumer offset. A cycle either
//! commits or resets the consumer; there is no partial commit.

use crate::change_feed::{ChangeFeedClient, ChangeRecord, ChangeType};
use crate::config::SyncConfig;
use crate::consumer::ConsumerStateStore;
use crate::error::{SyncError, SyncResult};
use crate::registration::RegistrationTask;
use catalog_content::{ContentStore, Resource, ResourceType};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Resource ID that addresses the space's single policy in UPDATE records.
pub const POLICY_RESOURCE_ID: &str = "policy";

/// The state of the update engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// No cycle running.
    Idle,
    /// Fetching the change batch.
    Fetching,
    /// Applying records to the content store.
    Applying,
    /// The last cycle committed its offset.
    Committed,
    /// The last cycle failed and reset the consumer.
    Reset,
}

impl UpdateState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(self, UpdateState::Fetching | UpdateState::Applying)
    }

    /// Returns true if a new cycle can start.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            UpdateState::Idle | UpdateState::Committed | UpdateState::Reset
        )
    }
}

/// Statistics about update cycles.
#[derive(Debug, Clone, Default)]
pub struct UpdateStats {
    /// Cycles that committed.
    pub cycles_committed: u64,
    /// Cycles that reset the consumer.
    pub cycles_reset: u64,
    /// Records applied.
    pub records_applied: u64,
    /// Records skipped (unknown type, missing delete target).
    pub records_skipped: u64,
    /// Last cycle end time.
    pub last_cycle_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a committed update cycle.
#[derive(Debug, Clone)]
pub struct UpdateCycleResult {
    /// Exclusive lower bound requested.
    pub from_offset: u64,
    /// Inclusive upper bound requested.
    pub to_offset: u64,
    /// Offset written to the consumer state.
    pub committed_offset: u64,
    /// Records applied.
    pub applied: u64,
    /// Records skipped.
    pub skipped: u64,
    /// Downstream registration work implied by the applied records.
    pub registrations: Vec<RegistrationTask>,
    /// Duration of the cycle.
    pub duration: Duration,
}

impl UpdateCycleResult {
    /// Returns true if any record changed content.
    pub fn has_changes(&self) -> bool {
        self.applied > 0
    }
}

enum Applied {
    Changed(Option<RegistrationTask>),
    Skipped,
}

/// Applies change feed batches to the content store.
pub struct UpdateEngine {
    store: Arc<dyn ContentStore>,
    feed: Arc<dyn ChangeFeedClient>,
    consumers: Arc<dyn ConsumerStateStore>,
    config: SyncConfig,
    state: RwLock<UpdateState>,
    stats: RwLock<UpdateStats>,
    cancelled: AtomicBool,
}

impl UpdateEngine {
    /// Creates a new update engine.
    pub fn new(
        store: Arc<dyn ContentStore>,
        feed: Arc<dyn ChangeFeedClient>,
        consumers: Arc<dyn ConsumerStateStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            feed,
            consumers,
            config,
            state: RwLock::new(UpdateState::Idle),
            stats: RwLock::new(UpdateStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> UpdateState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> UpdateStats {
        self.stats.read().clone()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cancels the running cycle. A cancelled cycle resets the consumer.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: UpdateState) {
        *self.state.write() = state;
    }

    /// Runs one update cycle over `(from_offset, to_offset]`.
    ///
    /// A fetch failure leaves the consumer untouched. Any failure while
    /// applying resets the consumer so the next cycle re-bootstraps.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] if a cycle is already
    /// running, or the error that ended the cycle.
    pub async fn update(&self, from_offset: u64, to_offset: u64) -> SyncResult<UpdateCycleResult> {
        {
            let mut state = self.state.write();
            if !state.can_start() {
                return Err(SyncError::InvalidStateTransition {
                    from: format!("{:?}", *state),
                    to: "update".into(),
                });
            }
            *state = UpdateState::Fetching;
        }
        self.cancelled.store(false, Ordering::SeqCst);
        let start = Instant::now();

        let mut records = match self
            .feed
            .fetch_changes(&self.config.context, &self.config.consumer, from_offset, to_offset)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(from = from_offset, to = to_offset, error = %e, "change fetch failed");
                self.stats.write().last_error = Some(e.to_string());
                self.set_state(UpdateState::Idle);
                return Err(e);
            }
        };
        records.sort_by_key(|r| r.offset);

        self.set_state(UpdateState::Applying);
        let mut result = UpdateCycleResult {
            from_offset,
            to_offset,
            committed_offset: from_offset,
            applied: 0,
            skipped: 0,
            registrations: Vec::new(),
            duration: Duration::ZERO,
        };

        if let Err(e) = self.apply_and_commit(&records, &mut result) {
            error!(
                from = from_offset,
                to = to_offset,
                applied = result.applied,
                error = %e,
                "update cycle failed, resetting consumer"
            );
            if let Err(reset_err) = self
                .consumers
                .reset(&self.config.context, &self.config.consumer)
            {
                error!(error = %reset_err, "failed to reset consumer state");
            }
            self.set_state(UpdateState::Reset);
            let mut stats = self.stats.write();
            stats.cycles_reset += 1;
            stats.records_applied += result.applied;
            stats.records_skipped += result.skipped;
            stats.last_cycle_time = Some(Instant::now());
            stats.last_error = Some(e.to_string());
            return Err(e);
        }

        result.duration = start.elapsed();
        self.set_state(UpdateState::Committed);
        {
            let mut stats = self.stats.write();
            stats.cycles_committed += 1;
            stats.records_applied += result.applied;
            stats.records_skipped += result.skipped;
            stats.last_cycle_time = Some(Instant::now());
            stats.last_error = None;
        }

        info!(
            offset = result.committed_offset,
            applied = result.applied,
            skipped = result.skipped,
            "update cycle committed"
        );
        Ok(result)
    }

    fn apply_and_commit(
        &self,
        records: &[ChangeRecord],
        result: &mut UpdateCycleResult,
    ) -> SyncResult<()> {
        check_offsets(records, result.from_offset, result.to_offset)?;
        let mut last_offset: Option<u64> = None;

        for record in records {
            self.check_cancelled()?;
            match self.apply(record)? {
                Applied::Changed(task) => {
                    result.applied += 1;
                    result.registrations.extend(task);
                }
                Applied::Skipped => result.skipped += 1,
            }
            last_offset = Some(record.offset);
        }

        let offset = last_offset.unwrap_or(result.from_offset);
        let mut state = self
            .consumers
            .get_or_default(&self.config.context, &self.config.consumer)?;
        state.local_offset = offset;
        self.consumers.set(state)?;
        result.committed_offset = offset;
        Ok(())
    }

    fn apply(&self, record: &ChangeRecord) -> SyncResult<Applied> {
        let space = self.config.space;
        match record.change_type {
            ChangeType::Create => {
                let payload = record.payload.as_ref().ok_or_else(|| {
                    SyncError::Protocol(format!(
                        "CREATE at offset {} has no payload",
                        record.offset
                    ))
                })?;
                let Some(resource_type) = payload.managed_type() else {
                    warn!(
                        offset = record.offset,
                        resource_type = %payload.resource_type,
                        "unknown resource type, skipping"
                    );
                    return Ok(Applied::Skipped);
                };
                let resource = Resource::ingest(resource_type, space, payload.document.clone())?;
                debug!(
                    offset = record.offset,
                    resource_type = %resource_type,
                    id = resource.id(),
                    "create"
                );
                let task = registration_upsert(&resource);
                self.store.create(resource)?;
                Ok(Applied::Changed(task))
            }
            ChangeType::Update => {
                let (resource_type, id) = self.locate_update_target(record)?;
                debug!(offset = record.offset, resource_type = %resource_type, id = %id, "update");
                let updated = self
                    .store
                    .update(resource_type, space, &id, &record.operations)?;
                Ok(Applied::Changed(registration_upsert(&updated)))
            }
            ChangeType::Delete => {
                let Some(resource_type) = self.store.locate(space, &record.resource)? else {
                    warn!(
                        offset = record.offset,
                        id = %record.resource,
                        "delete target not found, skipping"
                    );
                    return Ok(Applied::Skipped);
                };
                debug!(
                    offset = record.offset,
                    resource_type = %resource_type,
                    id = %record.resource,
                    "delete"
                );
                self.store.delete(resource_type, space, &record.resource)?;
                let task = RegistrationTask::is_registrable(resource_type)
                    .then(|| RegistrationTask::delete(resource_type, record.resource.clone()));
                Ok(Applied::Changed(task))
            }
        }
    }

    fn locate_update_target(&self, record: &ChangeRecord) -> SyncResult<(ResourceType, String)> {
        let space = self.config.space;
        if record.resource == POLICY_RESOURCE_ID {
            if let Some(policy) = self
                .store
                .search_by_space(ResourceType::Policy, space)?
                .into_iter()
                .next()
            {
                return Ok((ResourceType::Policy, policy.id().to_string()));
            }
        }
        match self.store.locate(space, &record.resource)? {
            Some(resource_type) => Ok((resource_type, record.resource.clone())),
            None => Err(SyncError::Protocol(format!(
                "UPDATE at offset {} targets unknown resource '{}'",
                record.offset, record.resource
            ))),
        }
    }
}

/// Checks that sorted records are unique and inside `(from_offset, to_offset]`.
fn check_offsets(records: &[ChangeRecord], from_offset: u64, to_offset: u64) -> SyncResult<()> {
    let mut last: Option<u64> = None;
    for record in records {
        if record.offset <= from_offset || record.offset > to_offset {
            return Err(SyncError::Protocol(format!(
                "change offset {} outside requested range ({from_offset}, {to_offset}]",
                record.offset
            )));
        }
        if last.is_some_and(|last| record.offset <= last) {
            return Err(SyncError::Protocol(format!(
                "duplicate change offset {}",
                record.offset
            )));
        }
        last = Some(record.offset);
    }
    Ok(())
}

fn registration_upsert(resource: &Resource) -> Option<RegistrationTask> {
    RegistrationTask::is_registrable(resource.resource_type())
        .then(|| RegistrationTask::upsert(resource))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_feed::MockChangeFeed;
    use crate::consumer::{ConsumerState, MemoryConsumerStore};
    use catalog_content::{InMemoryContentStore, PatchOperation, Space};
    use serde_json::json;

    struct Fixture {
        engine: UpdateEngine,
        store: Arc<InMemoryContentStore>,
        feed: Arc<MockChangeFeed>,
        consumers: Arc<MemoryConsumerStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryContentStore::new());
        let feed = Arc::new(MockChangeFeed::new());
        let consumers = Arc::new(MemoryConsumerStore::new());
        let engine = UpdateEngine::new(
            store.clone(),
            feed.clone(),
            consumers.clone(),
            SyncConfig::new("rules", "c1", "http://cti"),
        );
        Fixture {
            engine,
            store,
            feed,
            consumers,
        }
    }

    fn offset(f: &Fixture) -> u64 {
        f.consumers.get("rules", "c1").unwrap().unwrap().local_offset
    }

    #[tokio::test]
    async fn applies_in_offset_order() {
        let f = fixture();
        // served out of order
        f.feed.push(ChangeRecord::update(
            2,
            "r1",
            vec![PatchOperation::replace("/level", json!(5))],
        ));
        f.feed
            .push(ChangeRecord::create(1, ResourceType::Rule, json!({"id": "r1", "level": 1})));
        f.feed.push(ChangeRecord::delete(3, "r1"));
        f.feed
            .push(ChangeRecord::create(4, ResourceType::Rule, json!({"id": "r2", "level": 2})));

        let result = f.engine.update(0, 4).await.unwrap();
        assert_eq!(result.applied, 4);
        assert_eq!(result.committed_offset, 4);
        assert_eq!(offset(&f), 4);
        assert_eq!(f.engine.state(), UpdateState::Committed);
        assert!(!f.store.exists(ResourceType::Rule, Space::Standard, "r1").unwrap());
        assert!(f.store.exists(ResourceType::Rule, Space::Standard, "r2").unwrap());
    }

    #[tokio::test]
    async fn empty_batch_keeps_lower_bound() {
        let f = fixture();
        let mut state = ConsumerState::new("rules", "c1");
        state.remote_offset = 20;
        state.snapshot_link = "http://cti/snap.zip".into();
        f.consumers.set(state).unwrap();

        let result = f.engine.update(5, 9).await.unwrap();
        assert!(!result.has_changes());
        assert_eq!(result.committed_offset, 5);
        let state = f.consumers.get("rules", "c1").unwrap().unwrap();
        assert_eq!(state.local_offset, 5);
        assert_eq!(state.remote_offset, 20);
        assert_eq!(state.snapshot_link, "http://cti/snap.zip");
    }

    #[tokio::test]
    async fn failure_resets_consumer() {
        let f = fixture();
        let mut state = ConsumerState::new("rules", "c1");
        state.local_offset = 10;
        f.consumers.set(state).unwrap();

        f.feed
            .push(ChangeRecord::create(11, ResourceType::Rule, json!({"id": "r1"})));
        f.feed
            .push(ChangeRecord::create(12, ResourceType::Rule, json!({"id": "r2"})));
        f.feed.push(ChangeRecord::update(
            13,
            "missing",
            vec![PatchOperation::replace("/level", json!(1))],
        ));
        f.feed.push(ChangeRecord::delete(14, "r1"));
        f.feed
            .push(ChangeRecord::create(15, ResourceType::Rule, json!({"id": "r3"})));

        let err = f.engine.update(10, 15).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(offset(&f), 0);
        assert_eq!(f.engine.state(), UpdateState::Reset);
        assert_eq!(f.engine.stats().cycles_reset, 1);

        // a reset engine can start again
        assert!(f.engine.state().can_start());
    }

    #[tokio::test]
    async fn fetch_failure_leaves_state_untouched() {
        let f = fixture();
        let mut state = ConsumerState::new("rules", "c1");
        state.local_offset = 7;
        f.consumers.set(state).unwrap();
        f.feed.set_failing(true);

        let err = f.engine.update(7, 9).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(offset(&f), 7);
        assert_eq!(f.engine.state(), UpdateState::Idle);
    }

    #[tokio::test]
    async fn policy_alias_and_skips() {
        let f = fixture();
        let policy =
            Resource::new(ResourceType::Policy, Space::Standard, json!({"id": "p-1", "title": "a"}))
                .unwrap();
        f.store.create(policy).unwrap();

        f.feed.push(ChangeRecord::update(
            1,
            POLICY_RESOURCE_ID,
            vec![PatchOperation::replace("/title", json!("b"))],
        ));
        let mut unknown = ChangeRecord::create(2, ResourceType::Rule, json!({"id": "x"}));
        if let Some(payload) = unknown.payload.as_mut() {
            payload.resource_type = "widget".into();
        }
        f.feed.push(unknown);
        f.feed.push(ChangeRecord::delete(3, "never-existed"));

        let result = f.engine.update(0, 3).await.unwrap();
        assert_eq!(result.applied, 1);
        assert_eq!(result.skipped, 2);
        assert_eq!(result.committed_offset, 3);
        let policy = f
            .store
            .get(ResourceType::Policy, Space::Standard, "p-1")
            .unwrap()
            .unwrap();
        assert_eq!(policy.document()["title"], "b");
    }

    #[tokio::test]
    async fn registrations_follow_applied_records() {
        let f = fixture();
        f.feed
            .push(ChangeRecord::create(1, ResourceType::Integration, json!({"id": "i1"})));
        f.feed
            .push(ChangeRecord::create(2, ResourceType::Decoder, json!({"id": "d1"})));
        f.feed
            .push(ChangeRecord::create(3, ResourceType::Rule, json!({"id": "r1"})));
        f.feed.push(ChangeRecord::delete(4, "r1"));

        let result = f.engine.update(0, 4).await.unwrap();
        let ids: Vec<_> = result.registrations.iter().map(|t| t.id().to_string()).collect();
        assert_eq!(ids, vec!["i1", "r1", "r1"]);
        assert!(matches!(
            result.registrations[2],
            RegistrationTask::Delete { .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_offsets_fail_closed() {
        let f = fixture();
        f.feed
            .push(ChangeRecord::create(1, ResourceType::Rule, json!({"id": "a"})));
        f.feed
            .push(ChangeRecord::create(1, ResourceType::Rule, json!({"id": "b"})));
        assert!(f.engine.update(0, 1).await.is_err());
        assert_eq!(offset(&f), 0);
    }

    /// Serves a fixed batch whatever range is requested.
    struct FixedFeed(Vec<ChangeRecord>);

    #[async_trait::async_trait]
    impl ChangeFeedClient for FixedFeed {
        async fn fetch_changes(
            &self,
            _context: &str,
            _consumer: &str,
            _from_offset: u64,
            _to_offset: u64,
        ) -> SyncResult<Vec<ChangeRecord>> {
            Ok(self.0.clone())
        }

        async fn fetch_consumer(
            &self,
            _context: &str,
            _consumer: &str,
        ) -> SyncResult<crate::consumer::RemoteConsumer> {
            Ok(Default::default())
        }
    }

    fn engine_with(
        records: Vec<ChangeRecord>,
    ) -> (UpdateEngine, Arc<InMemoryContentStore>, Arc<MemoryConsumerStore>) {
        let store = Arc::new(InMemoryContentStore::new());
        let consumers = Arc::new(MemoryConsumerStore::new());
        let engine = UpdateEngine::new(
            store.clone(),
            Arc::new(FixedFeed(records)),
            consumers.clone(),
            SyncConfig::new("rules", "c1", "http://cti"),
        );
        (engine, store, consumers)
    }

    #[tokio::test]
    async fn offsets_outside_range_fail_closed() {
        for stray in [5, 50] {
            let (engine, store, consumers) = engine_with(vec![
                ChangeRecord::create(6, ResourceType::Rule, json!({"id": "a"})),
                ChangeRecord::create(stray, ResourceType::Rule, json!({"id": "b"})),
            ]);
            let mut state = ConsumerState::new("rules", "c1");
            state.local_offset = 5;
            consumers.set(state).unwrap();

            let err = engine.update(5, 9).await.unwrap_err();
            assert!(matches!(err, SyncError::Protocol(_)));
            assert_eq!(consumers.get("rules", "c1").unwrap().unwrap().local_offset, 0);
            assert!(store.is_empty());
            assert_eq!(engine.state(), UpdateState::Reset);
        }
    }
}
