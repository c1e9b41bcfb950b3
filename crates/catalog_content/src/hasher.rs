//! Canonical document hashing.
//!
//! The canonical form is compact JSON with object keys sorted by their UTF-8
//! bytes at every depth. Arrays keep their order. Scalars are written exactly
//! as `serde_json` writes them. Keys are sorted here rather than relying on
//! the map implementation, so the `preserve_order` feature of `serde_json`
//! does not change digests.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Computes document digests and digests of digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ContentHasher {
    /// Returns the canonical serialization of a document.
    pub fn canonical_json(document: &Value) -> String {
        let mut out = String::new();
        write_canonical(document, &mut out);
        out
    }

    /// Returns the lowercase hex SHA-256 of the canonical serialization.
    ///
    /// # Example
    ///
    /// ```rust
    /// use catalog_content::ContentHasher;
    /// use serde_json::json;
    ///
    /// let a = ContentHasher::hash(&json!({"id": "r1", "level": 3}));
    /// let b = ContentHasher::hash(&json!({"level": 3, "id": "r1"}));
    /// assert_eq!(a, b);
    /// assert_eq!(a.len(), 64);
    /// ```
    pub fn hash(document: &Value) -> String {
        sha256_hex(Self::canonical_json(document).as_bytes())
    }

    /// Hashes the concatenation of `digests`, in the given order, with no separator.
    pub fn aggregate<I, S>(digests: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        for digest in digests {
            hasher.update(digest.as_ref().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    #[test]
    fn canonical_form_sorts_keys_at_every_depth() {
        let doc = json!({"b": {"y": 1, "x": [3, {"d": true, "c": null}]}, "a": "s\"q"});
        assert_eq!(
            ContentHasher::canonical_json(&doc),
            r#"{"a":"s\"q","b":{"x":[3,{"c":null,"d":true}],"y":1}}"#
        );
    }

    #[test]
    fn known_digest() {
        // sha256 of the two bytes "{}"
        assert_eq!(
            ContentHasher::hash(&json!({})),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn repeated_hashing_is_stable() {
        let doc = json!({"id": "r1", "tags": ["a", "b"], "level": 3});
        assert_eq!(ContentHasher::hash(&doc), ContentHasher::hash(&doc));
    }

    #[test]
    fn field_mutation_changes_hash() {
        let doc = json!({"id": "r1", "tags": ["a", "b"]});
        let reordered = json!({"id": "r1", "tags": ["b", "a"]});
        let changed = json!({"id": "r1", "tags": ["a", "c"]});
        assert_ne!(ContentHasher::hash(&doc), ContentHasher::hash(&reordered));
        assert_ne!(ContentHasher::hash(&doc), ContentHasher::hash(&changed));
    }

    #[test]
    fn aggregate_is_order_sensitive_concatenation() {
        let a = ContentHasher::hash(&json!({"id": "a"}));
        let b = ContentHasher::hash(&json!({"id": "b"}));
        let joined = format!("{a}{b}");
        assert_eq!(
            ContentHasher::aggregate([&a, &b]),
            sha256_hex(joined.as_bytes())
        );
        assert_ne!(
            ContentHasher::aggregate([&a, &b]),
            ContentHasher::aggregate([&b, &a])
        );
    }

    proptest! {
        #[test]
        fn key_insertion_order_does_not_matter(
            entries in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 1..12)
        ) {
            let forward: Map<String, Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let backward: Map<String, Value> =
                entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            prop_assert_eq!(
                ContentHasher::hash(&Value::Object(forward)),
                ContentHasher::hash(&Value::Object(backward))
            );
        }
    }
}
