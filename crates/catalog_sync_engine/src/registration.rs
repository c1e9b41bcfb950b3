//! Best-effort fan-out to the external detection registration service.
//!
//! Integrations and rules are mirrored into a downstream service after every
//! local change. Failures there never roll back local content; they are
//! logged and counted in a [`DispatchReport`].

use crate::config::RegistrationConfig;
use async_trait::async_trait;
use catalog_content::{Resource, ResourceType, Space};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Errors returned by an [`ExternalRegistrationService`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The resource is not registered.
    #[error("resource not registered: {0}")]
    NotFound(String),

    /// The service refused the document.
    #[error("registration rejected: {0}")]
    Rejected(String),

    /// The service could not be reached.
    #[error("registration service unavailable: {0}")]
    Unavailable(String),

    /// The request did not complete in time.
    #[error("registration timed out")]
    Timeout,
}

impl RegistrationError {
    /// Returns true if the resource was simply not registered.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistrationError::NotFound(_))
    }
}

/// Downstream service that registers integrations and rules.
#[async_trait]
pub trait ExternalRegistrationService: Send + Sync {
    /// Creates or replaces the registration of a document.
    async fn upsert(
        &self,
        resource_type: ResourceType,
        document: &Value,
        space: Space,
    ) -> Result<(), RegistrationError>;

    /// Removes a registration.
    async fn delete(&self, resource_type: ResourceType, id: &str) -> Result<(), RegistrationError>;
}

/// One request to the registration service.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationTask {
    /// Register or refresh a document.
    Upsert {
        /// Type of the document.
        resource_type: ResourceType,
        /// Space the document lives in.
        space: Space,
        /// Document body.
        document: Value,
    },
    /// Remove a registration.
    Delete {
        /// Type of the resource.
        resource_type: ResourceType,
        /// Resource ID.
        id: String,
    },
}

impl RegistrationTask {
    /// Returns true if resources of this type are registered downstream.
    pub fn is_registrable(resource_type: ResourceType) -> bool {
        matches!(resource_type, ResourceType::Integration | ResourceType::Rule)
    }

    /// Builds an upsert for a stored resource.
    pub fn upsert(resource: &Resource) -> Self {
        RegistrationTask::Upsert {
            resource_type: resource.resource_type(),
            space: resource.space(),
            document: resource.document().clone(),
        }
    }

    /// Builds a delete.
    pub fn delete(resource_type: ResourceType, id: impl Into<String>) -> Self {
        RegistrationTask::Delete {
            resource_type,
            id: id.into(),
        }
    }

    /// Resource ID the task addresses.
    pub fn id(&self) -> &str {
        match self {
            RegistrationTask::Upsert { document, .. } => {
                document.get("id").and_then(Value::as_str).unwrap_or_default()
            }
            RegistrationTask::Delete { id, .. } => id,
        }
    }

    /// Resource type the task addresses.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            RegistrationTask::Upsert { resource_type, .. }
            | RegistrationTask::Delete { resource_type, .. } => *resource_type,
        }
    }

    async fn run(
        &self,
        service: &dyn ExternalRegistrationService,
    ) -> Result<(), RegistrationError> {
        match self {
            RegistrationTask::Upsert {
                resource_type,
                space,
                document,
            } => service.upsert(*resource_type, document, *space).await,
            RegistrationTask::Delete { resource_type, id } => {
                match service.delete(*resource_type, id).await {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            }
        }
    }
}

/// Counts of a dispatched batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Requests that completed successfully.
    pub succeeded: usize,
    /// Requests the service failed.
    pub failed: usize,
    /// Requests cut off by the item timeout or the batch deadline.
    pub timed_out: usize,
}

impl DispatchReport {
    /// Total requests accounted for.
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }

    /// Returns true if every request succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.timed_out == 0
    }

    fn record(&mut self, task: &RegistrationTask, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed(e) => {
                warn!(
                    resource_type = %task.resource_type(),
                    id = task.id(),
                    error = %e,
                    "registration failed"
                );
                self.failed += 1;
            }
            Outcome::TimedOut => {
                warn!(
                    resource_type = %task.resource_type(),
                    id = task.id(),
                    "registration timed out"
                );
                self.timed_out += 1;
            }
        }
    }
}

enum Outcome {
    Succeeded,
    Failed(RegistrationError),
    TimedOut,
}

/// Bounded-parallel dispatcher for [`RegistrationTask`]s.
///
/// Tasks are issued one at a time until the first one succeeds, so a
/// downstream service can create its backing structures before concurrent
/// writes arrive. The rest run with at most `max_concurrency` requests in
/// flight. Every request has its own timeout and the whole batch has a
/// deadline; requests still running at the deadline are aborted.
pub struct RegistrationDispatcher {
    service: Arc<dyn ExternalRegistrationService>,
    config: RegistrationConfig,
}

impl RegistrationDispatcher {
    /// Creates a new dispatcher.
    pub fn new(service: Arc<dyn ExternalRegistrationService>, config: RegistrationConfig) -> Self {
        Self { service, config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Runs every task and reports the outcome. Never fails.
    pub async fn dispatch(&self, tasks: Vec<RegistrationTask>) -> DispatchReport {
        let mut report = DispatchReport::default();
        if tasks.is_empty() {
            return report;
        }
        let count = tasks.len();
        let deadline = Instant::now() + self.config.batch_timeout;
        let mut pending = tasks.into_iter();

        // Sequential until the service has accepted one request.
        for task in pending.by_ref() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                report.record(&task, Outcome::TimedOut);
                continue;
            }
            let budget = self.config.item_timeout.min(remaining);
            let outcome = run_with_timeout(self.service.as_ref(), &task, budget).await;
            let succeeded = matches!(outcome, Outcome::Succeeded);
            report.record(&task, outcome);
            if succeeded {
                break;
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut join_set = JoinSet::new();
        for task in pending {
            let service = Arc::clone(&self.service);
            let semaphore = Arc::clone(&semaphore);
            let item_timeout = self.config.item_timeout;
            join_set.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => run_with_timeout(service.as_ref(), &task, item_timeout).await,
                    Err(_) => Outcome::Failed(RegistrationError::Unavailable(
                        "dispatcher closed".into(),
                    )),
                };
                (task, outcome)
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((task, outcome)))) => report.record(&task, outcome),
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "registration task aborted");
                    report.failed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    let abandoned = join_set.len();
                    warn!(abandoned, "registration batch deadline reached");
                    join_set.abort_all();
                    report.timed_out += abandoned;
                    break;
                }
            }
        }

        if report.is_clean() {
            debug!(count, "registration batch dispatched");
        } else {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                timed_out = report.timed_out,
                "registration batch finished with errors"
            );
        }
        report
    }
}

async fn run_with_timeout(
    service: &dyn ExternalRegistrationService,
    task: &RegistrationTask,
    budget: Duration,
) -> Outcome {
    match tokio::time::timeout(budget, task.run(service)).await {
        Ok(Ok(())) => Outcome::Succeeded,
        Ok(Err(RegistrationError::Timeout)) | Err(_) => Outcome::TimedOut,
        Ok(Err(e)) => Outcome::Failed(e),
    }
}

/// An in-memory registration service for testing.
///
/// IDs can be configured to fail or to hang. Concurrency is tracked so tests
/// can check the dispatcher's sequencing.
#[derive(Debug, Default)]
pub struct MemoryRegistrationService {
    registered: RwLock<BTreeMap<(ResourceType, String), Value>>,
    failing: RwLock<HashSet<String>>,
    hanging: RwLock<HashSet<String>>,
    delay: RwLock<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    starts: RwLock<Vec<usize>>,
}

impl MemoryRegistrationService {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes requests for `id` fail with [`RegistrationError::Rejected`].
    pub fn fail_on(&self, id: impl Into<String>) {
        self.failing.write().insert(id.into());
    }

    /// Makes requests for `id` never complete.
    pub fn hang_on(&self, id: impl Into<String>) {
        self.hanging.write().insert(id.into());
    }

    /// Adds latency to every request.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }

    /// Returns true if the resource is registered.
    pub fn is_registered(&self, resource_type: ResourceType, id: &str) -> bool {
        self.registered
            .read()
            .contains_key(&(resource_type, id.to_string()))
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.registered.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest number of concurrent requests observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Requests in flight at the start of each request, in call order.
    pub fn starts(&self) -> Vec<usize> {
        self.starts.read().clone()
    }

    async fn enter(&self, id: &str) -> Result<(), RegistrationError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.starts.write().push(now);

        let delay = *self.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let hangs = self.hanging.read().contains(id);
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fails = self.failing.read().contains(id);
        if fails {
            return Err(RegistrationError::Rejected(format!("{id} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalRegistrationService for MemoryRegistrationService {
    async fn upsert(
        &self,
        resource_type: ResourceType,
        document: &Value,
        _space: Space,
    ) -> Result<(), RegistrationError> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RegistrationError::Rejected("document has no id".into()))?;
        self.enter(id).await?;
        self.registered
            .write()
            .insert((resource_type, id.to_string()), document.clone());
        Ok(())
    }

    async fn delete(&self, resource_type: ResourceType, id: &str) -> Result<(), RegistrationError> {
        self.enter(id).await?;
        self.registered
            .write()
            .remove(&(resource_type, id.to_string()))
            .map(|_| ())
            .ok_or_else(|| RegistrationError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(id: &str) -> RegistrationTask {
        RegistrationTask::Upsert {
            resource_type: ResourceType::Rule,
            space: Space::Standard,
            document: json!({"id": id}),
        }
    }

    fn dispatcher(
        service: &Arc<MemoryRegistrationService>,
        config: RegistrationConfig,
    ) -> RegistrationDispatcher {
        RegistrationDispatcher::new(service.clone(), config)
    }

    #[test]
    fn task_accessors() {
        let task = upsert("r1");
        assert_eq!(task.id(), "r1");
        assert_eq!(task.resource_type(), ResourceType::Rule);
        assert!(RegistrationTask::is_registrable(ResourceType::Integration));
        assert!(!RegistrationTask::is_registrable(ResourceType::Decoder));
        assert!(RegistrationError::NotFound("x".into()).is_not_found());
    }

    #[tokio::test]
    async fn first_request_runs_alone() {
        let service = Arc::new(MemoryRegistrationService::new());
        service.set_delay(Duration::from_millis(20));
        let tasks = (0..5).map(|i| upsert(&format!("r{i}"))).collect();

        let report = dispatcher(&service, RegistrationConfig::new(8)).dispatch(tasks).await;
        assert_eq!(report.succeeded, 5);
        assert!(report.is_clean());
        assert_eq!(service.starts()[0], 1);
        assert!(service.max_in_flight() > 1);
        assert_eq!(service.len(), 5);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let service = Arc::new(MemoryRegistrationService::new());
        service.set_delay(Duration::from_millis(10));
        let tasks = (0..10).map(|i| upsert(&format!("r{i}"))).collect();

        let report = dispatcher(&service, RegistrationConfig::new(2)).dispatch(tasks).await;
        assert_eq!(report.succeeded, 10);
        assert!(service.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn failures_do_not_block_others() {
        let service = Arc::new(MemoryRegistrationService::new());
        service.fail_on("r0");
        service.fail_on("r3");
        service.hang_on("r4");
        let tasks = (0..6).map(|i| upsert(&format!("r{i}"))).collect();
        let config = RegistrationConfig::new(4).with_item_timeout(Duration::from_millis(50));

        let report = dispatcher(&service, config).dispatch(tasks).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.succeeded, 3);
        assert!(service.is_registered(ResourceType::Rule, "r5"));
        assert!(!service.is_registered(ResourceType::Rule, "r3"));
    }

    #[tokio::test]
    async fn batch_deadline_aborts_stragglers() {
        let service = Arc::new(MemoryRegistrationService::new());
        service.hang_on("r2");
        service.hang_on("r3");
        let tasks = (0..4).map(|i| upsert(&format!("r{i}"))).collect();
        let config = RegistrationConfig::new(4)
            .with_item_timeout(Duration::from_secs(30))
            .with_batch_timeout(Duration::from_millis(100));

        let report = dispatcher(&service, config).dispatch(tasks).await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.timed_out, 2);
        assert_eq!(report.total(), 4);
    }

    #[tokio::test]
    async fn delete_of_unregistered_is_tolerated() {
        let service = Arc::new(MemoryRegistrationService::new());
        let report = dispatcher(&service, RegistrationConfig::default())
            .dispatch(vec![RegistrationTask::delete(ResourceType::Rule, "ghost")])
            .await;
        assert_eq!(report.succeeded, 1);
    }
}
