//! # Catalog Sync Engine
//!
//! Keeps a local mirror of a remote content catalog consistent with the
//! catalog's change feed.
//!
//! This crate provides:
//! - Consumer cursors (local offset, remote offset, snapshot link)
//! - Change feed records and an HTTP change feed client
//! - Snapshot bootstrap from zip archives with a path-traversal guard
//! - The offset-ordered update engine (idle → fetching → applying → committed)
//! - Bounded-parallel registration fan-out
//! - The consumer synchronizer that ties them together
//!
//! ## Architecture
//!
//! A sync cycle follows a **snapshot-then-changes** model:
//! 1. With no local progress, load the advertised full snapshot
//! 2. Apply change records after the snapshot offset, in offset order
//! 3. Commit the consumer offset only after the whole batch applied
//!
//! ## Key Invariants
//!
//! - The remote catalog is authoritative and establishes order
//! - The local offset only moves after a fully applied batch
//! - Any failure while applying resets the consumer (fail-closed)
//! - A snapshot replaces the space, it is never merged
//! - Downstream registration failures never roll back local content

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod archive;
mod change_feed;
mod config;
mod consumer;
mod error;
mod http;
mod registration;
mod snapshot;
mod synchronizer;
mod update;

pub use archive::{extract_archive, extract_archive_until, safe_entry_path};
pub use change_feed::{
    ChangeBatch, ChangeFeedClient, ChangePayload, ChangeRecord, ChangeType, MockChangeFeed,
};
pub use config::{RegistrationConfig, SyncConfig};
pub use consumer::{ConsumerState, ConsumerStateStore, MemoryConsumerStore, RemoteConsumer};
pub use error::{SyncError, SyncResult};
pub use http::{HttpChangeFeedClient, HttpClient, HttpResponse, MockHttpClient};
pub use registration::{
    DispatchReport, ExternalRegistrationService, MemoryRegistrationService, RegistrationDispatcher,
    RegistrationError, RegistrationTask,
};
pub use snapshot::{HttpSnapshotTransport, SnapshotBootstrapper, SnapshotReport, SnapshotTransport};
pub use synchronizer::{ConsumerSynchronizer, SyncOutcome};
pub use update::{UpdateCycleResult, UpdateEngine, UpdateState, UpdateStats, POLICY_RESOURCE_ID};
