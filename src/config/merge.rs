//! Layer merge
//!
//! Layers are JSON values merged left to right:
//! - Objects: deep-merge by key
//! - Arrays: REPLACE (last wins)
//! - Scalars: override (last wins)

use serde_json::Value;

/// Deep merge two JSON values.
///
/// Merge semantics:
/// - Objects: deep-merge by key (recursive)
/// - Arrays: REPLACE (second wins entirely)
/// - Scalars: override (second wins)
/// - Null: override (null can override any value)
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        // Both objects: deep merge
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = if let Some(base_value) = base_map.remove(&key) {
                    deep_merge(base_value, overlay_value)
                } else {
                    overlay_value
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }

        // Arrays: REPLACE (no concatenation)
        (Value::Array(_), overlay @ Value::Array(_)) => overlay,

        // Scalars and any other case: overlay wins
        (_, overlay) => overlay,
    }
}

/// Merge multiple config layers in order (first is base, last has highest precedence)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_override() {
        let result = deep_merge(json!({"lock_timeout_ms": 5000}), json!({"lock_timeout_ms": 250}));
        assert_eq!(result["lock_timeout_ms"], 250);
    }

    #[test]
    fn test_zone_table_merges_by_key() {
        let base = json!({"zones": {"vault": "secure_archive", "replica": "backup_storage"}});
        let overlay = json!({"zones": {"replica": "offsite"}});
        let result = deep_merge(base, overlay);

        assert_eq!(result["zones"]["replica"], "offsite");
        assert_eq!(result["zones"]["vault"], "secure_archive");
    }

    #[test]
    fn test_array_replaced_not_concatenated() {
        let result = deep_merge(json!({"tags": ["a", "b", "c"]}), json!({"tags": ["x"]}));
        assert_eq!(result["tags"], json!(["x"]));
    }

    #[test]
    fn test_null_overrides() {
        let result = deep_merge(json!({"policy_path": "p.toml"}), json!({"policy_path": null}));
        assert!(result["policy_path"].is_null());
    }

    #[test]
    fn test_merge_layers_precedence() {
        let builtin = json!({"purge_staging": true, "confidentiality_label": "CONFIDENTIAL"});
        let host = json!({"purge_staging": false});
        let project = json!({"confidentiality_label": "RESTRICTED"});
        let cli = json!({"purge_staging": true});

        let result = merge_layers(vec![builtin, host, project, cli]);
        assert_eq!(result["purge_staging"], true);
        assert_eq!(result["confidentiality_label"], "RESTRICTED");
    }
}
