//! Hash command implementation.

use catalog_content::{sanitize_document, ContentHasher};
use serde_json::Value;
use std::path::Path;

/// Runs the hash command.
pub fn run(
    path: &Path,
    show_canonical: bool,
    sanitize: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let mut document: Value = serde_json::from_str(&raw)?;
    if sanitize {
        document = sanitize_document(document);
    }

    println!("{}  {}", ContentHasher::hash(&document), path.display());
    if show_canonical {
        println!("{}", ContentHasher::canonical_json(&document));
    }
    Ok(())
}
