//! # Catalog Content
//!
//! Content model, canonical hashing and storage abstraction for the catalog
//! sync engine.
//!
//! This crate provides:
//! - [`Resource`], the stored wrapper around a catalog document
//! - [`ContentHasher`] for canonical document digests and digests of digests
//! - JSON-Patch style operations applied copy-on-write ([`patch`])
//! - The [`ContentStore`] trait and an in-memory implementation
//! - [`SpaceService`] for per-space enumeration and aggregate hashing
//!
//! ## Key Invariants
//!
//! - A resource's hash always matches its document
//! - Physical copies are keyed by type, space and ID, so spaces never share documents
//! - Patching never mutates the input document
//! - Missing references are tolerated by aggregate hashing
//!
//! This crate performs no network I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod hasher;
mod memory;
mod model;
pub mod patch;
mod sanitize;
mod space;
mod store;

pub use error::{ContentError, ContentResult};
pub use hasher::ContentHasher;
pub use memory::InMemoryContentStore;
pub use model::{
    HashField, ReferenceList, Resource, ResourceSummary, ResourceType, Space, SpaceTag,
};
pub use patch::{PatchError, PatchOp, PatchOperation};
pub use sanitize::sanitize_document;
pub use space::{default_policy_id, RecalculateReport, SpaceHashes, SpaceService, USER_SPACES};
pub use store::ContentStore;
