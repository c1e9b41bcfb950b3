//! Normalization applied to ingested documents before hashing.

use serde_json::Value;

const STRIPPED_METADATA: [&str; 2] = ["custom_fields", "dataset"];

/// Normalizes an ingested document.
///
/// - drops `metadata.custom_fields` and `metadata.dataset`
/// - renames `sigma_id` to `id` in every `related` entry
pub fn sanitize_document(mut document: Value) -> Value {
    let Some(map) = document.as_object_mut() else {
        return document;
    };

    if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
        for key in STRIPPED_METADATA {
            metadata.remove(key);
        }
    }

    match map.get_mut("related") {
        Some(Value::Object(related)) => rename_sigma_id(related),
        Some(Value::Array(items)) => {
            for item in items.iter_mut() {
                if let Value::Object(related) = item {
                    rename_sigma_id(related);
                }
            }
        }
        _ => {}
    }

    document
}

fn rename_sigma_id(related: &mut serde_json::Map<String, Value>) {
    if let Some(sigma_id) = related.remove("sigma_id") {
        related.insert("id".to_string(), sigma_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_internal_metadata() {
        let doc = json!({
            "id": "r1",
            "metadata": {"title": "t", "custom_fields": {"x": 1}, "dataset": "d"}
        });
        assert_eq!(
            sanitize_document(doc),
            json!({"id": "r1", "metadata": {"title": "t"}})
        );
    }

    #[test]
    fn renames_related_sigma_id() {
        let single = json!({"id": "r1", "related": {"sigma_id": "s1", "type": "derived"}});
        assert_eq!(
            sanitize_document(single)["related"],
            json!({"id": "s1", "type": "derived"})
        );

        let many = json!({"id": "r1", "related": [{"sigma_id": "s1"}, {"id": "s2"}, "raw"]});
        assert_eq!(
            sanitize_document(many)["related"],
            json!([{"id": "s1"}, {"id": "s2"}, "raw"])
        );
    }

    #[test]
    fn non_objects_pass_through() {
        assert_eq!(sanitize_document(json!([1, 2])), json!([1, 2]));
    }
}
