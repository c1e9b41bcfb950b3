//! Integration tests for the sync engine components working together.

use catalog_content::{
    ContentHasher, ContentStore, InMemoryContentStore, PatchOperation, ResourceType, Space,
};
use catalog_sync_engine::{
    ChangeRecord, ConsumerState, ConsumerStateStore, ConsumerSynchronizer, HttpResponse,
    HttpSnapshotTransport, MemoryConsumerStore, MemoryRegistrationService, MockChangeFeed,
    MockHttpClient, RemoteConsumer, SnapshotBootstrapper, SyncConfig, SyncError, UpdateEngine,
};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const SNAPSHOT_URL: &str = "https://cti.example.com/snapshots/rules.zip";

fn config() -> SyncConfig {
    SyncConfig::new("rules", "c1", "https://cti.example.com/api/v1")
}

fn zip_bytes(entries: &[(&str, String)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn snapshot_line(resource_type: &str, document: Value) -> String {
    json!({"payload": {"type": resource_type, "document": document}}).to_string()
}

fn catalog_snapshot() -> Vec<u8> {
    let body = [
        snapshot_line(
            "policy",
            json!({"id": "p1", "title": "Standard", "integrations": ["i1"]}),
        ),
        snapshot_line(
            "integration",
            json!({
                "id": "i1",
                "title": "Windows",
                "decoders": ["d1"],
                "rules": ["r1"],
                "kvdbs": []
            }),
        ),
        snapshot_line("decoder", json!({"id": "d1", "title": "windows-event"})),
        snapshot_line("rule", json!({"id": "r1", "title": "Logon", "level": 1})),
    ]
    .join("\n");
    zip_bytes(&[("rules_consumer/content.json", body)])
}

fn five_changes() -> Vec<ChangeRecord> {
    vec![
        ChangeRecord::create(1, ResourceType::Rule, json!({"id": "a", "level": 1})),
        ChangeRecord::create(2, ResourceType::Decoder, json!({"id": "b"})),
        ChangeRecord::update(3, "a", vec![PatchOperation::replace("/level", json!(2))]),
        ChangeRecord::delete(4, "b"),
        ChangeRecord::create(5, ResourceType::Kvdb, json!({"id": "c", "content": {}})),
    ]
}

fn engine_over(
    records: Vec<ChangeRecord>,
) -> (UpdateEngine, Arc<InMemoryContentStore>, Arc<MemoryConsumerStore>) {
    let store = Arc::new(InMemoryContentStore::new());
    let consumers = Arc::new(MemoryConsumerStore::new());
    let feed = Arc::new(MockChangeFeed::new());
    for record in records {
        feed.push(record);
    }
    let engine = UpdateEngine::new(store.clone(), feed, consumers.clone(), config());
    (engine, store, consumers)
}

#[tokio::test]
async fn split_batches_match_single_batch() {
    let (split, split_store, split_consumers) = engine_over(five_changes());
    split.update(0, 3).await.unwrap();
    split.update(3, 5).await.unwrap();

    let (single, single_store, single_consumers) = engine_over(five_changes());
    single.update(0, 5).await.unwrap();

    assert_eq!(split_store.all(), single_store.all());
    assert_eq!(
        split_consumers.get("rules", "c1").unwrap(),
        single_consumers.get("rules", "c1").unwrap()
    );
    assert_eq!(split.stats().records_applied, 5);
}

#[tokio::test]
async fn failing_third_change_resets_offset_to_zero() {
    let mut records = five_changes();
    records[2] = ChangeRecord::update(3, "a", vec![PatchOperation::remove("/does/not/exist")]);
    let (engine, _, consumers) = engine_over(records);

    let err = engine.update(0, 5).await.unwrap_err();
    assert!(matches!(err, SyncError::Content(_)));
    let state = consumers.get("rules", "c1").unwrap().unwrap();
    assert_eq!(state.local_offset, 0);
    assert_eq!(state.remote_offset, 0);
    assert!(state.snapshot_link.is_empty());
}

#[tokio::test]
async fn snapshot_with_escaping_entry_is_rejected() {
    let store = Arc::new(InMemoryContentStore::new());
    let consumers = Arc::new(MemoryConsumerStore::new());
    let http = Arc::new(MockHttpClient::new());
    http.route(
        SNAPSHOT_URL,
        HttpResponse::ok(zip_bytes(&[
            ("content.json", snapshot_line("rule", json!({"id": "r1"}))),
            ("../../evil", "pwned".to_string()),
        ])),
    );
    let kept = catalog_content::Resource::new(
        ResourceType::Rule,
        Space::Standard,
        json!({"id": "kept"}),
    )
    .unwrap();
    store.create(kept).unwrap();

    let bootstrapper = SnapshotBootstrapper::new(
        store.clone(),
        Arc::new(HttpSnapshotTransport::new(http)),
        consumers.clone(),
        config(),
    );
    let err = bootstrapper.initialize(SNAPSHOT_URL, 10).await.unwrap_err();

    assert!(matches!(err, SyncError::PathTraversal { ref entry } if entry == "../../evil"));
    assert!(store.exists(ResourceType::Rule, Space::Standard, "kept").unwrap());
    assert!(!store.exists(ResourceType::Rule, Space::Standard, "r1").unwrap());
    assert!(consumers.get("rules", "c1").unwrap().is_none());
}

struct SyncFixture {
    synchronizer: ConsumerSynchronizer,
    store: Arc<InMemoryContentStore>,
    consumers: Arc<MemoryConsumerStore>,
    feed: Arc<MockChangeFeed>,
    registry: Arc<MemoryRegistrationService>,
}

fn sync_fixture(snapshot: Option<Vec<u8>>) -> SyncFixture {
    let store = Arc::new(InMemoryContentStore::new());
    let consumers = Arc::new(MemoryConsumerStore::new());
    let feed = Arc::new(MockChangeFeed::new());
    let registry = Arc::new(MemoryRegistrationService::new());
    let http = Arc::new(MockHttpClient::new());
    if let Some(bytes) = snapshot {
        http.route(SNAPSHOT_URL, HttpResponse::ok(bytes));
    }

    let synchronizer = ConsumerSynchronizer::new(
        config(),
        store.clone(),
        consumers.clone(),
        feed.clone(),
        Arc::new(HttpSnapshotTransport::new(http)),
        registry.clone(),
    );
    SyncFixture {
        synchronizer,
        store,
        consumers,
        feed,
        registry,
    }
}

#[tokio::test]
async fn synchronizer_bootstraps_then_updates() {
    let f = sync_fixture(Some(catalog_snapshot()));
    f.feed.set_consumer(RemoteConsumer {
        name: "c1".into(),
        context: "rules".into(),
        last_offset: 12,
        last_snapshot_link: Some(SNAPSHOT_URL.into()),
        last_snapshot_offset: 10,
    });
    f.feed.push(ChangeRecord::update(
        11,
        "r1",
        vec![PatchOperation::replace("/level", json!(3))],
    ));
    f.feed
        .push(ChangeRecord::create(12, ResourceType::Rule, json!({"id": "r2", "title": "Logoff"})));

    let outcome = f.synchronizer.synchronize().await.unwrap();

    assert_eq!(outcome.snapshot.as_ref().unwrap().total(), 4);
    assert_eq!(outcome.update.as_ref().unwrap().applied, 2);
    assert_eq!(outcome.local_offset, 12);
    assert_eq!(f.feed.requests(), vec![(10, 12)]);
    assert_eq!(
        outcome.initialized_spaces,
        vec![Space::Draft, Space::Test, Space::Custom]
    );

    // i1 and r1 after the snapshot, then r1 and r2 from the feed
    assert_eq!(outcome.registrations.succeeded, 4);
    assert!(f.registry.is_registered(ResourceType::Integration, "i1"));
    assert!(f.registry.is_registered(ResourceType::Rule, "r2"));
    assert!(!f.registry.is_registered(ResourceType::Decoder, "d1"));

    let get = |t, id| f.store.get(t, Space::Standard, id).unwrap().unwrap();
    let rule = get(ResourceType::Rule, "r1");
    assert_eq!(rule.document()["level"], 3);
    let expected = ContentHasher::aggregate([
        get(ResourceType::Policy, "p1").hash(),
        get(ResourceType::Integration, "i1").hash(),
        get(ResourceType::Decoder, "d1").hash(),
        rule.hash(),
    ]);
    assert_eq!(
        get(ResourceType::Policy, "p1").space_hash(),
        Some(expected.as_str())
    );

    let state = f.consumers.get("rules", "c1").unwrap().unwrap();
    assert_eq!(state.local_offset, 12);
    assert_eq!(state.remote_offset, 12);
    assert_eq!(state.snapshot_link, SNAPSHOT_URL);

    // nothing new upstream: no work
    let again = f.synchronizer.synchronize().await.unwrap();
    assert!(!again.has_changes());
    assert_eq!(again.registrations.total(), 0);
    assert_eq!(f.feed.requests().len(), 1);
}

#[tokio::test]
async fn synchronizer_resumes_from_local_offset() {
    let f = sync_fixture(Some(catalog_snapshot()));
    let mut state = ConsumerState::new("rules", "c1");
    state.local_offset = 20;
    f.consumers.set(state).unwrap();
    f.feed.set_consumer(RemoteConsumer {
        last_offset: 21,
        last_snapshot_link: Some(SNAPSHOT_URL.into()),
        last_snapshot_offset: 10,
        ..RemoteConsumer::default()
    });
    f.feed
        .push(ChangeRecord::create(21, ResourceType::Rule, json!({"id": "r9"})));

    let outcome = f.synchronizer.synchronize().await.unwrap();
    assert!(outcome.snapshot.is_none());
    assert_eq!(outcome.local_offset, 21);
    assert_eq!(f.store.count(ResourceType::Rule, Space::Standard), 1);
}

#[tokio::test]
async fn failed_bootstrap_resets_consumer() {
    let f = sync_fixture(None);
    let mut state = ConsumerState::new("rules", "c1");
    state.remote_offset = 4;
    f.consumers.set(state).unwrap();
    f.feed.set_consumer(RemoteConsumer {
        last_offset: 12,
        last_snapshot_link: Some(SNAPSHOT_URL.into()),
        last_snapshot_offset: 10,
        ..RemoteConsumer::default()
    });

    let err = f.synchronizer.synchronize().await.unwrap_err();
    assert!(matches!(err, SyncError::Transport { retryable: false, .. }));
    let state = f.consumers.get("rules", "c1").unwrap().unwrap();
    assert_eq!(state.remote_offset, 0);
    assert!(f.feed.requests().is_empty());
    assert!(f.registry.is_empty());
}

#[tokio::test]
async fn unreachable_feed_leaves_state_untouched() {
    let f = sync_fixture(None);
    let mut state = ConsumerState::new("rules", "c1");
    state.local_offset = 3;
    f.consumers.set(state.clone()).unwrap();
    f.feed.set_failing(true);

    let err = f.synchronizer.synchronize().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(f.consumers.get("rules", "c1").unwrap(), Some(state));
}
