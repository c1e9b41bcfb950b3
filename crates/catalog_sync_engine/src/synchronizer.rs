//! One full sync cycle for a (context, consumer) pair.

use crate::change_feed::ChangeFeedClient;
use crate::config::SyncConfig;
use crate::consumer::ConsumerStateStore;
use crate::error::SyncResult;
use crate::registration::{
    DispatchReport, ExternalRegistrationService, RegistrationDispatcher, RegistrationTask,
};
use crate::snapshot::{SnapshotBootstrapper, SnapshotReport, SnapshotTransport};
use crate::update::{UpdateCycleResult, UpdateEngine};
use catalog_content::{ContentStore, RecalculateReport, ResourceType, Space, SpaceService};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// What one [`ConsumerSynchronizer::synchronize`] call did.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// Snapshot bootstrap, if one ran.
    pub snapshot: Option<SnapshotReport>,
    /// Update cycle, if one ran.
    pub update: Option<UpdateCycleResult>,
    /// Spaces that received a default policy.
    pub initialized_spaces: Vec<Space>,
    /// Registration fan-out counts.
    pub registrations: DispatchReport,
    /// Aggregate hash recalculation, if content changed.
    pub recalculated: Option<RecalculateReport>,
    /// Local offset after the cycle.
    pub local_offset: u64,
    /// Remote offset observed at the start of the cycle.
    pub remote_offset: u64,
}

impl SyncOutcome {
    /// Returns true if local content changed.
    pub fn has_changes(&self) -> bool {
        self.snapshot.is_some() || self.update.as_ref().is_some_and(UpdateCycleResult::has_changes)
    }
}

/// Drives snapshot bootstrap, incremental updates and post-sync work.
///
/// Calls to [`synchronize`](Self::synchronize) on one instance are serialized.
pub struct ConsumerSynchronizer {
    store: Arc<dyn ContentStore>,
    consumers: Arc<dyn ConsumerStateStore>,
    feed: Arc<dyn ChangeFeedClient>,
    bootstrapper: SnapshotBootstrapper,
    engine: UpdateEngine,
    dispatcher: RegistrationDispatcher,
    spaces: SpaceService<dyn ContentStore>,
    config: SyncConfig,
    lock: Mutex<()>,
}

impl ConsumerSynchronizer {
    /// Creates a synchronizer wiring every component to the same collaborators.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ContentStore>,
        consumers: Arc<dyn ConsumerStateStore>,
        feed: Arc<dyn ChangeFeedClient>,
        transport: Arc<dyn SnapshotTransport>,
        registration: Arc<dyn ExternalRegistrationService>,
    ) -> Self {
        Self {
            bootstrapper: SnapshotBootstrapper::new(
                Arc::clone(&store),
                transport,
                Arc::clone(&consumers),
                config.clone(),
            ),
            engine: UpdateEngine::new(
                Arc::clone(&store),
                Arc::clone(&feed),
                Arc::clone(&consumers),
                config.clone(),
            ),
            dispatcher: RegistrationDispatcher::new(registration, config.registration.clone()),
            spaces: SpaceService::new(Arc::clone(&store)),
            store,
            consumers,
            feed,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Returns the update engine.
    pub fn engine(&self) -> &UpdateEngine {
        &self.engine
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs one cycle.
    ///
    /// Bootstraps from the advertised snapshot when nothing has been applied
    /// locally, then applies changes up to the remote offset. When content
    /// changed, default policies are created, registrations are dispatched
    /// and aggregate hashes are recalculated. Registration failures are
    /// counted, never returned.
    ///
    /// # Errors
    ///
    /// Returns a fetch, bootstrap, update or store error. A failed bootstrap
    /// resets the consumer.
    pub async fn synchronize(&self) -> SyncResult<SyncOutcome> {
        let _guard = self.lock.lock().await;
        let context = self.config.context.as_str();
        let consumer = self.config.consumer.as_str();

        let local = self.consumers.get_or_default(context, consumer)?;
        let remote = self.feed.fetch_consumer(context, consumer).await?;
        let mut outcome = SyncOutcome {
            remote_offset: remote.last_offset,
            ..SyncOutcome::default()
        };
        let mut current = local.local_offset;
        let mut tasks = Vec::new();

        if current == 0 {
            if let Some(link) = remote.snapshot_link() {
                match self
                    .bootstrapper
                    .initialize(link, remote.last_snapshot_offset)
                    .await
                {
                    Ok(report) => {
                        current = remote.last_snapshot_offset;
                        tasks.extend(self.snapshot_registrations()?);
                        outcome.snapshot = Some(report);
                    }
                    Err(e) => {
                        error!(context, consumer, error = %e, "snapshot bootstrap failed");
                        if let Err(reset_err) = self.consumers.reset(context, consumer) {
                            error!(error = %reset_err, "failed to reset consumer state");
                        }
                        return Err(e);
                    }
                }
            }
        }

        if current < remote.last_offset {
            let result = self.engine.update(current, remote.last_offset).await?;
            current = result.committed_offset;
            tasks.extend(result.registrations.iter().cloned());
            outcome.update = Some(result);
        }

        if outcome.has_changes() {
            outcome.initialized_spaces = self.spaces.initialize_spaces()?;
            outcome.registrations = self.dispatcher.dispatch(tasks).await;
            outcome.recalculated = Some(self.spaces.recalculate(&Space::ALL)?);
        }

        let mut state = self.consumers.get_or_default(context, consumer)?;
        state.remote_offset = remote.last_offset;
        self.consumers.set(state)?;
        outcome.local_offset = current;

        info!(
            context,
            consumer,
            local_offset = current,
            remote_offset = remote.last_offset,
            changed = outcome.has_changes(),
            "sync cycle finished"
        );
        Ok(outcome)
    }

    fn snapshot_registrations(&self) -> SyncResult<Vec<RegistrationTask>> {
        let mut tasks = Vec::new();
        for resource_type in [ResourceType::Integration, ResourceType::Rule] {
            tasks.extend(
                self.store
                    .search_by_space(resource_type, self.config.space)?
                    .iter()
                    .map(RegistrationTask::upsert),
            );
        }
        Ok(tasks)
    }
}
