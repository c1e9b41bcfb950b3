//! Full-catalog snapshot bootstrap.
//!
//! A snapshot is a zip archive of newline-delimited JSON files. Each line is a
//! `{"payload": {"type": ..., "document": {...}}}` record. Loading a snapshot
//! replaces every managed collection of the configured space.

use crate::archive::extract_archive_until;
use crate::config::SyncConfig;
use crate::consumer::ConsumerStateStore;
use crate::error::{SyncError, SyncResult};
use crate::http::{status_error, HttpClient};
use async_trait::async_trait;
use catalog_content::{ContentStore, Resource, ResourceType, Space};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::future::Future;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Downloads and unpacks snapshot archives.
#[async_trait]
pub trait SnapshotTransport: Send + Sync {
    /// Downloads `url` into `dir` and returns the local file.
    async fn download(&self, url: &str, dir: &Path) -> SyncResult<PathBuf>;

    /// Extracts `archive` into `dest` and returns the extracted files.
    ///
    /// Implementations stop with [`SyncError::Timeout`] once `deadline` has
    /// passed and must not write into `dest` after returning.
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        deadline: Option<Instant>,
    ) -> SyncResult<Vec<PathBuf>> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive_until(&archive, &dest, deadline))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?
    }
}

/// Snapshot transport over an [`HttpClient`].
pub struct HttpSnapshotTransport<C: HttpClient> {
    client: C,
}

impl<C: HttpClient> HttpSnapshotTransport<C> {
    /// Creates a new transport.
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> SnapshotTransport for HttpSnapshotTransport<C> {
    async fn download(&self, url: &str, dir: &Path) -> SyncResult<PathBuf> {
        let response = self
            .client
            .get(url)
            .await
            .map_err(SyncError::transport_retryable)?;
        if !response.is_ok() {
            return Err(status_error(url, response.status));
        }
        let path = dir.join("snapshot.zip");
        tokio::fs::write(&path, &response.body).await?;
        debug!(url, bytes = response.body.len(), "snapshot downloaded");
        Ok(path)
    }
}

/// Outcome of a snapshot bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Snapshot URL. Empty if the bootstrap was skipped.
    pub url: String,
    /// Offset the consumer was moved to.
    pub offset: u64,
    /// Records loaded per type.
    pub loaded: BTreeMap<ResourceType, usize>,
    /// Lines skipped as incomplete or of an unknown type.
    pub skipped_lines: usize,
    /// Record files read.
    pub files: usize,
}

impl SnapshotReport {
    /// Total records loaded.
    pub fn total(&self) -> usize {
        self.loaded.values().sum()
    }

    /// Returns true if nothing was loaded.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Replaces a space's content with a full snapshot.
pub struct SnapshotBootstrapper {
    store: Arc<dyn ContentStore>,
    transport: Arc<dyn SnapshotTransport>,
    consumers: Arc<dyn ConsumerStateStore>,
    config: SyncConfig,
}

impl SnapshotBootstrapper {
    /// Creates a new bootstrapper.
    pub fn new(
        store: Arc<dyn ContentStore>,
        transport: Arc<dyn SnapshotTransport>,
        consumers: Arc<dyn ConsumerStateStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transport,
            consumers,
            config,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Loads the snapshot at `url` and moves the consumer to `base_offset`.
    ///
    /// An empty URL is skipped. On failure after the space was cleared, the
    /// space is cleared again so no partial catalog remains. Temporary files
    /// are removed on every path.
    ///
    /// # Errors
    ///
    /// Returns the first transport, archive, I/O, parse or store error, or
    /// [`SyncError::Timeout`] if the configured deadline passes.
    pub async fn initialize(&self, url: &str, base_offset: u64) -> SyncResult<SnapshotReport> {
        if url.trim().is_empty() {
            warn!(context = %self.config.context, "empty snapshot link, skipping bootstrap");
            return Ok(SnapshotReport::default());
        }

        let deadline = self.config.snapshot_deadline.map(|d| Instant::now() + d);
        info!(url, offset = base_offset, space = %self.config.space, "bootstrapping from snapshot");

        let workdir = match &self.config.work_dir {
            Some(root) => tempfile::tempdir_in(root)?,
            None => tempfile::tempdir()?,
        };
        let archive = within(deadline, self.transport.download(url, workdir.path())).await?;
        // Extraction must finish before `workdir` drops.
        let extract_dir = workdir.path().join("extracted");
        let files = self.transport.extract(&archive, &extract_dir, deadline).await?;
        check_deadline(deadline)?;

        let cleared = self.clear_space()?;
        debug!(cleared, space = %self.config.space, "space cleared for snapshot");

        let store = Arc::clone(&self.store);
        let space = self.config.space;
        let batch_size = self.config.bulk_batch_size;
        let ingested = tokio::task::spawn_blocking(move || {
            ingest_files(store.as_ref(), space, batch_size, &files, deadline)
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))
        .and_then(|result| result);

        let mut report = match ingested {
            Ok(report) => report,
            Err(e) => {
                error!(url, error = %e, "snapshot load failed, clearing partial content");
                if let Err(clear_err) = self.clear_space() {
                    error!(error = %clear_err, "failed to clear partial snapshot content");
                }
                return Err(e);
            }
        };
        drop(workdir);

        let mut state = self
            .consumers
            .get_or_default(&self.config.context, &self.config.consumer)?;
        state.local_offset = base_offset;
        state.remote_offset = base_offset;
        state.snapshot_link = url.to_string();
        self.consumers.set(state)?;

        report.url = url.to_string();
        report.offset = base_offset;
        info!(
            records = report.total(),
            skipped = report.skipped_lines,
            files = report.files,
            offset = base_offset,
            "snapshot loaded"
        );
        Ok(report)
    }

    fn clear_space(&self) -> SyncResult<usize> {
        let mut cleared = 0;
        for resource_type in ResourceType::ALL {
            cleared += self.store.clear(resource_type, self.config.space)?;
        }
        Ok(cleared)
    }
}

async fn within<T>(
    deadline: Option<Instant>,
    future: impl Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
    match deadline {
        None => future.await,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                return Err(SyncError::Timeout);
            }
            tokio::time::timeout(remaining, future)
                .await
                .map_err(|_| SyncError::Timeout)?
        }
    }
}

fn check_deadline(deadline: Option<Instant>) -> SyncResult<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(SyncError::Timeout),
        _ => Ok(()),
    }
}

fn ingest_files(
    store: &dyn ContentStore,
    space: Space,
    batch_size: usize,
    files: &[PathBuf],
    deadline: Option<Instant>,
) -> SyncResult<SnapshotReport> {
    let mut json_files: Vec<&PathBuf> = files
        .iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    json_files.sort();

    let mut report = SnapshotReport::default();
    let mut batch = Vec::with_capacity(batch_size);

    for path in json_files {
        check_deadline(deadline)?;
        report.files += 1;
        let reader = BufReader::new(File::open(path)?);

        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(line).map_err(|e| {
                SyncError::Protocol(format!("{}:{}: {e}", path.display(), number + 1))
            })?;

            let Some(resource) = parse_line(&record, space, path, number + 1) else {
                report.skipped_lines += 1;
                continue;
            };
            *report.loaded.entry(resource.resource_type()).or_default() += 1;
            batch.push(resource);

            if batch.len() >= batch_size {
                store.bulk_create(std::mem::take(&mut batch))?;
            }
        }
    }

    if !batch.is_empty() {
        store.bulk_create(batch)?;
    }
    Ok(report)
}

fn parse_line(record: &Value, space: Space, path: &Path, line: usize) -> Option<Resource> {
    let payload = record.get("payload");
    let declared = payload.and_then(|p| p.get("type")).and_then(Value::as_str);
    let document = payload.and_then(|p| p.get("document"));

    let (Some(declared), Some(document)) = (declared, document) else {
        warn!(
            file = %path.display(),
            line,
            "snapshot line without payload type or document, skipping"
        );
        return None;
    };
    let Some(resource_type) = ResourceType::parse(declared) else {
        warn!(
            file = %path.display(),
            line,
            resource_type = declared,
            "unknown resource type, skipping"
        );
        return None;
    };
    match Resource::ingest(resource_type, space, document.clone()) {
        Ok(resource) => Some(resource),
        Err(e) => {
            warn!(file = %path.display(), line, error = %e, "invalid snapshot document, skipping");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::MemoryConsumerStore;
    use catalog_content::InMemoryContentStore;
    use serde_json::json;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Serves a prebuilt archive from disk, blocking for `delay` first.
    struct FileTransport {
        archive: Vec<u8>,
        delay: Duration,
    }

    #[async_trait]
    impl SnapshotTransport for FileTransport {
        async fn download(&self, _url: &str, dir: &Path) -> SyncResult<PathBuf> {
            std::thread::sleep(self.delay);
            let path = dir.join("snapshot.zip");
            std::fs::write(&path, &self.archive)?;
            Ok(path)
        }
    }

    fn archive(entries: &[(&str, String)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn line(resource_type: &str, document: Value) -> String {
        json!({"payload": {"type": resource_type, "document": document}}).to_string()
    }

    fn bootstrapper(
        archive: Vec<u8>,
        batch: usize,
    ) -> (
        SnapshotBootstrapper,
        Arc<InMemoryContentStore>,
        Arc<MemoryConsumerStore>,
    ) {
        let store = Arc::new(InMemoryContentStore::new());
        let consumers = Arc::new(MemoryConsumerStore::new());
        let config = SyncConfig::new("rules", "c1", "http://cti").with_bulk_batch_size(batch);
        let bootstrapper = SnapshotBootstrapper::new(
            store.clone(),
            Arc::new(FileTransport {
                archive,
                delay: Duration::ZERO,
            }),
            consumers.clone(),
            config,
        );
        (bootstrapper, store, consumers)
    }

    #[tokio::test]
    async fn loads_and_replaces_space() {
        let body = [
            line("rule", json!({"id": "r1"})),
            String::new(),
            line("decoder", json!({"id": "d1"})),
            json!({"offset": 3}).to_string(),
            line("widget", json!({"id": "w1"})),
            line("rule", json!({"id": "r2", "metadata": {"dataset": "x"}})),
        ]
        .join("\n");
        let (bootstrapper, store, consumers) = bootstrapper(
            archive(&[("content/rules.json", body), ("README.md", "ignored".into())]),
            2,
        );
        let stale = Resource::new(ResourceType::Rule, Space::Standard, json!({"id": "old"}));
        store.create(stale.unwrap()).unwrap();
        let draft = Resource::new(ResourceType::Rule, Space::Draft, json!({"id": "mine"})).unwrap();
        store.create(draft).unwrap();

        let report = bootstrapper.initialize("http://cti/snap.zip", 40).await.unwrap();
        assert_eq!(report.total(), 3);
        assert_eq!(report.loaded[&ResourceType::Rule], 2);
        assert_eq!(report.skipped_lines, 2);
        assert_eq!(report.files, 1);

        assert!(!store.exists(ResourceType::Rule, Space::Standard, "old").unwrap());
        assert!(store.exists(ResourceType::Rule, Space::Draft, "mine").unwrap());
        let r2 = store.get(ResourceType::Rule, Space::Standard, "r2").unwrap().unwrap();
        assert!(r2.document()["metadata"].get("dataset").is_none());

        let state = consumers.get("rules", "c1").unwrap().unwrap();
        assert_eq!(state.local_offset, 40);
        assert_eq!(state.remote_offset, 40);
        assert_eq!(state.snapshot_link, "http://cti/snap.zip");
    }

    #[tokio::test]
    async fn empty_url_is_skipped() {
        let (bootstrapper, _, consumers) = bootstrapper(Vec::new(), 10);
        let report = bootstrapper.initialize("  ", 5).await.unwrap();
        assert!(report.is_empty());
        assert!(consumers.get("rules", "c1").unwrap().is_none());
    }

    #[tokio::test]
    async fn parse_error_leaves_space_empty() {
        let body = [line("rule", json!({"id": "r1"})), "{broken".to_string()].join("\n");
        let (bootstrapper, store, consumers) = bootstrapper(archive(&[("a.json", body)]), 1);
        let stale = Resource::new(ResourceType::Rule, Space::Standard, json!({"id": "old"}));
        store.create(stale.unwrap()).unwrap();

        let err = bootstrapper.initialize("http://cti/snap.zip", 9).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(store.count(ResourceType::Rule, Space::Standard), 0);
        assert!(consumers.get("rules", "c1").unwrap().is_none());
    }

    #[tokio::test]
    async fn download_failure_keeps_content() {
        let (bootstrapper, store, _) = bootstrapper(b"not a zip".to_vec(), 10);
        let kept = Resource::new(ResourceType::Rule, Space::Standard, json!({"id": "kept"}));
        store.create(kept.unwrap()).unwrap();

        let err = bootstrapper.initialize("http://cti/snap.zip", 9).await.unwrap_err();
        assert!(matches!(err, SyncError::Archive(_)));
        assert!(store.exists(ResourceType::Rule, Space::Standard, "kept").unwrap());
    }

    #[tokio::test]
    async fn deadline_during_extraction_removes_scratch_files() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryContentStore::new());
        let consumers = Arc::new(MemoryConsumerStore::new());
        let kept = Resource::new(ResourceType::Rule, Space::Standard, json!({"id": "kept"}));
        store.create(kept.unwrap()).unwrap();

        let body = line("rule", json!({"id": "r1"}));
        let transport = FileTransport {
            archive: archive(&[("a.json", body.clone()), ("b.json", body)]),
            delay: Duration::from_millis(50),
        };
        let config = SyncConfig::new("rules", "c1", "http://cti")
            .with_snapshot_deadline(Duration::from_millis(10))
            .with_work_dir(root.path());
        let bootstrapper = SnapshotBootstrapper::new(
            store.clone(),
            Arc::new(transport),
            consumers.clone(),
            config,
        );

        let err = bootstrapper.initialize("http://cti/snap.zip", 9).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
        assert!(store.exists(ResourceType::Rule, Space::Standard, "kept").unwrap());
        assert!(consumers.get("rules", "c1").unwrap().is_none());
    }
}
