//! # Catalog Promotion
//!
//! Moves content between the user spaces of the catalog and manages the
//! draft content that users author.
//!
//! This crate provides:
//! - The promotion diff model (preview rows and execution requests)
//! - The promotion engine (draft → test → custom)
//! - Reference list maintenance between containers and their children
//! - The draft content lifecycle (create, update, delete)
//!
//! ## Key Invariants
//!
//! - `standard` is never a promotion source, and nothing is promoted into it
//! - A space always has exactly one policy, so policies are only updated
//! - A promotion checks and validates everything before its first write
//! - Only draft containers have their reference lists edited
//! - A created child is never left without its parent link

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod diff;
mod draft;
mod engine;
mod error;
mod link;
mod validation;

pub use diff::{
    diff_hashes, ChangeItem, PromotionChange, PromotionOperation, PromotionPreview, SpaceChanges,
    SpaceDiff,
};
pub use draft::DraftContentService;
pub use engine::{PromotionConfig, PromotionEngine, PromotionReport};
pub use error::{PromotionError, PromotionResult};
pub use link::{container_type, ResourceLinkGraph};
pub use validation::{AcceptAll, MockValidationService, ValidationService};
