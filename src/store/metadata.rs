//! Product metadata record
//!
//! Metadata is never encrypted: it stays searchable while the payload is
//! opaque ciphertext. Fields the pipeline does not know about (orbit, cloud
//! cover, ...) are carried through untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::integrity::Fingerprint;
use crate::state::ProductStatus;

/// Fields every landed metadata record must carry
pub const MANDATORY_FIELDS: &[&str] = &["product_id", "creation_timestamp", "source_identifier"];

/// Schema problems found in a metadata document
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("metadata is not valid JSON: {0}")]
    Malformed(String),

    #[error("metadata is not a JSON object")]
    NotAnObject,

    #[error("missing mandatory fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("metadata product_id '{found}' does not match '{expected}'")]
    ProductIdMismatch { expected: String, found: String },
}

/// Metadata record accumulated as a product moves through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    pub product_id: String,

    pub creation_timestamp: DateTime<Utc>,

    pub source_identifier: String,

    #[serde(default = "default_status")]
    pub status: ProductStatus,

    /// Fingerprint bound at ingestion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_hash: Option<Fingerprint>,

    /// Fingerprint after processing; supersedes `original_hash`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_hash: Option<Fingerprint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidentiality: Option<String>,

    /// Logical location of the vault artifact (zone-relative)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,

    /// Fingerprint of the vault ciphertext as last written by the pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_hash: Option<Fingerprint>,

    /// Key identifier the vault ciphertext was sealed under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,

    /// Status to restore once a corrupted vault artifact is healed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_corruption_status: Option<ProductStatus>,

    /// Descriptive fields owned by the generator
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_status() -> ProductStatus {
    ProductStatus::Generated
}

impl MetadataRecord {
    pub fn new(product_id: &str, source_identifier: &str) -> Self {
        Self {
            product_id: product_id.to_string(),
            creation_timestamp: Utc::now(),
            source_identifier: source_identifier.to_string(),
            status: ProductStatus::Generated,
            original_hash: None,
            processed_hash: None,
            processing_level: None,
            processing_timestamp: None,
            confidentiality: None,
            archived_path: None,
            archived_at: None,
            vault_hash: None,
            key_id: None,
            pre_corruption_status: None,
            extra: BTreeMap::new(),
        }
    }

    /// Parse and validate a landed metadata document.
    ///
    /// Structured-data parse failures, missing mandatory fields and
    /// wrongly-typed mandatory fields all surface as [`SchemaError`].
    pub fn parse_validated(json: &str, expected_product_id: &str) -> Result<Self, SchemaError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        let object = value.as_object().ok_or(SchemaError::NotAnObject)?;

        let missing = missing_fields(object);
        if !missing.is_empty() {
            return Err(SchemaError::MissingFields(missing));
        }

        let record: MetadataRecord = serde_json::from_value(value.clone()).map_err(|e| {
            SchemaError::InvalidField {
                field: first_bad_field(object),
                reason: e.to_string(),
            }
        })?;

        if record.product_id != expected_product_id {
            return Err(SchemaError::ProductIdMismatch {
                expected: expected_product_id.to_string(),
                found: record.product_id,
            });
        }

        Ok(record)
    }

    /// The fingerprint later stages must verify staged content against
    pub fn reference_hash(&self) -> Option<&Fingerprint> {
        self.processed_hash.as_ref().or(self.original_hash.as_ref())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn missing_fields(object: &Map<String, Value>) -> Vec<String> {
    MANDATORY_FIELDS
        .iter()
        .filter(|field| matches!(object.get(**field), None | Some(Value::Null)))
        .map(|field| field.to_string())
        .collect()
}

fn first_bad_field(object: &Map<String, Value>) -> String {
    if !matches!(object.get("product_id"), Some(Value::String(_))) {
        return "product_id".to_string();
    }
    if !matches!(object.get("source_identifier"), Some(Value::String(_))) {
        return "source_identifier".to_string();
    }
    "creation_timestamp".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn landed(extra: Value) -> String {
        let mut base = json!({
            "product_id": "S2_0001",
            "creation_timestamp": "2026-01-01T00:00:00Z",
            "source_identifier": "Simulated-MSI",
            "orbit": 1234
        });
        if let (Some(obj), Some(more)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in more {
                obj.insert(k.clone(), v.clone());
            }
        }
        base.to_string()
    }

    #[test]
    fn test_parse_valid() {
        let record = MetadataRecord::parse_validated(&landed(json!({})), "S2_0001").unwrap();
        assert_eq!(record.source_identifier, "Simulated-MSI");
        assert_eq!(record.status, ProductStatus::Generated);
        assert_eq!(record.extra["orbit"], json!(1234));
    }

    #[test]
    fn test_missing_field() {
        let json = json!({"product_id": "S2_0001", "creation_timestamp": "2026-01-01T00:00:00Z"});
        let err = MetadataRecord::parse_validated(&json.to_string(), "S2_0001").unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingFields(vec!["source_identifier".to_string()])
        );
    }

    #[test]
    fn test_null_counts_as_missing() {
        let err = MetadataRecord::parse_validated(
            &landed(json!({"source_identifier": null})),
            "S2_0001",
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::MissingFields(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = MetadataRecord::parse_validated("{not json", "S2_0001").unwrap_err();
        assert!(matches!(err, SchemaError::Malformed(_)));
    }

    #[test]
    fn test_bad_timestamp_type() {
        let err = MetadataRecord::parse_validated(
            &landed(json!({"creation_timestamp": 1700000000.5})),
            "S2_0001",
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidField { ref field, .. } if field == "creation_timestamp"));
    }

    #[test]
    fn test_product_id_mismatch() {
        let err = MetadataRecord::parse_validated(&landed(json!({})), "OTHER").unwrap_err();
        assert!(matches!(err, SchemaError::ProductIdMismatch { .. }));
    }

    #[test]
    fn test_reference_hash_prefers_processed() {
        let mut record = MetadataRecord::new("P1", "Simulated-MSI");
        let original = Fingerprint::of_bytes(b"raw");
        let processed = Fingerprint::of_bytes(b"calibrated");
        record.original_hash = Some(original.clone());
        assert_eq!(record.reference_hash(), Some(&original));
        record.processed_hash = Some(processed.clone());
        assert_eq!(record.reference_hash(), Some(&processed));
    }

    #[test]
    fn test_extra_fields_round_trip() {
        let record = MetadataRecord::parse_validated(&landed(json!({})), "S2_0001").unwrap();
        let json = record.to_json().unwrap();
        assert!(json.contains("\"orbit\": 1234"));
        assert!(!json.contains("processed_hash"));
        let parsed = MetadataRecord::from_json(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
