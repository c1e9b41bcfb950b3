//! Sync command implementation.

use crate::client::{LogRegistration, ReqwestClient};
use catalog_content::{InMemoryContentStore, Resource, Space};
use catalog_sync_engine::{
    ConsumerSynchronizer, HttpChangeFeedClient, HttpSnapshotTransport, MemoryConsumerStore,
    RegistrationConfig, SyncConfig, SyncOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const CONSUMERS_FILE: &str = "consumers.json";
const CONTENT_FILE: &str = "content.json";

/// Flags of the sync command.
pub struct SyncArgs {
    /// Catalog API base URL.
    pub api_url: String,
    /// Catalog context.
    pub context: String,
    /// Consumer name.
    pub consumer: String,
    /// State directory.
    pub data_dir: PathBuf,
    /// Target space.
    pub space: Space,
    /// Documents per bulk write.
    pub batch_size: usize,
    /// Request timeout in seconds.
    pub timeout: u64,
    /// Snapshot deadline in seconds.
    pub snapshot_deadline: Option<u64>,
    /// Concurrent registration requests.
    pub concurrency: usize,
}

impl SyncArgs {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(&self.context, &self.consumer, &self.api_url)
            .with_space(self.space)
            .with_bulk_batch_size(self.batch_size)
            .with_request_timeout(Duration::from_secs(self.timeout))
            .with_registration(RegistrationConfig::new(self.concurrency));
        if let Some(secs) = self.snapshot_deadline {
            config = config.with_snapshot_deadline(Duration::from_secs(secs));
        }
        config
    }
}

/// Runs one synchronization cycle.
///
/// Consumer state and content are loaded from the data directory and written
/// back after the cycle, whether it succeeded or not: a failed cycle resets
/// the consumer, and that reset must survive to the next run.
pub fn run(args: SyncArgs) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&args.data_dir)?;
    let consumers = Arc::new(MemoryConsumerStore::new());
    let store = Arc::new(load_content(&args.data_dir)?);
    let consumers_path = args.data_dir.join(CONSUMERS_FILE);
    if consumers_path.exists() {
        let loaded = consumers.import(&std::fs::read_to_string(&consumers_path)?)?;
        info!(path = %consumers_path.display(), consumers = loaded, "consumer state loaded");
    }

    let config = args.config();
    let client = Arc::new(ReqwestClient::new(config.request_timeout)?);
    let feed = HttpChangeFeedClient::new(&config.api_url, Arc::clone(&client))
        .with_timeout(config.request_timeout);
    let synchronizer = ConsumerSynchronizer::new(
        config,
        store.clone(),
        consumers.clone(),
        Arc::new(feed),
        Arc::new(HttpSnapshotTransport::new(client)),
        Arc::new(LogRegistration),
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(synchronizer.synchronize());

    std::fs::write(&consumers_path, consumers.export()?)?;
    save_content(&args.data_dir, &store.all())?;

    print_outcome(&outcome?);
    Ok(())
}

fn load_content(dir: &Path) -> Result<InMemoryContentStore, Box<dyn std::error::Error>> {
    let path = dir.join(CONTENT_FILE);
    if !path.exists() {
        return Ok(InMemoryContentStore::new());
    }
    let resources: Vec<Resource> = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    info!(path = %path.display(), resources = resources.len(), "content loaded");
    Ok(InMemoryContentStore::with_resources(resources))
}

fn save_content(dir: &Path, resources: &[Resource]) -> Result<(), Box<dyn std::error::Error>> {
    let path = dir.join(CONTENT_FILE);
    std::fs::write(&path, serde_json::to_string(resources)?)?;
    info!(path = %path.display(), resources = resources.len(), "content saved");
    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) {
    println!("Sync Cycle");
    println!("==========");
    println!("Local offset:  {}", outcome.local_offset);
    println!("Remote offset: {}", outcome.remote_offset);

    if let Some(snapshot) = &outcome.snapshot {
        println!();
        println!("Snapshot: {} ({} files)", snapshot.url, snapshot.files);
        for (resource_type, count) in &snapshot.loaded {
            println!("  {}: {}", resource_type.plural(), count);
        }
        if snapshot.skipped_lines > 0 {
            println!("  skipped lines: {}", snapshot.skipped_lines);
        }
    }

    if let Some(update) = &outcome.update {
        println!();
        println!(
            "Update: offsets {}..{} ({} applied, {} skipped, {:?})",
            update.from_offset, update.to_offset, update.applied, update.skipped, update.duration
        );
    }

    if !outcome.initialized_spaces.is_empty() {
        let spaces: Vec<_> = outcome.initialized_spaces.iter().map(|s| s.as_str()).collect();
        println!("Initialized spaces: {}", spaces.join(", "));
    }

    let registrations = &outcome.registrations;
    if registrations.total() > 0 {
        println!(
            "Registrations: {} ok, {} failed, {} timed out",
            registrations.succeeded, registrations.failed, registrations.timed_out
        );
    }
    if let Some(recalculated) = &outcome.recalculated {
        println!(
            "Recalculated: {} policies, {} integrations",
            recalculated.policies, recalculated.integrations
        );
    }
}
