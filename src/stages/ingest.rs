//! Ingestion: landing → staging
//!
//! 1. Both landing files must exist
//! 2. Metadata must parse and carry every mandatory field
//! 3. The artifact fingerprint becomes `original_hash`
//! 4. Artifact + updated metadata are written to staging, status INGESTED
//!
//! Validation failures return before anything touches staging. The data file
//! is committed before the metadata file, and removed again if the metadata
//! write fails, so staging never holds a metadata record without its data.

use serde_json::json;

use super::{ArtifactRef, StageContext};
use crate::audit::{AuditEvent, Component};
use crate::integrity::Fingerprint;
use crate::state::{ProductStatus, StatusError};
use crate::store::{MetadataRecord, SchemaError, StoreError, Zone};

/// Ingestion errors
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("landing files missing for {product_id}: {}", .missing.join(", "))]
    Missing {
        product_id: String,
        missing: Vec<String>,
    },

    #[error("metadata schema invalid for {product_id}: {reason}")]
    SchemaInvalid {
        product_id: String,
        reason: SchemaError,
    },

    #[error("status error: {0}")]
    Status(#[from] StatusError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for ingestion
pub type IngestResult<T> = Result<T, IngestError>;

/// Admit a landed product into staging
pub fn ingest(ctx: &StageContext<'_>, product_id: &str) -> IngestResult<ArtifactRef> {
    ctx.emit(
        AuditEvent::info(Component::Ingest, "ingest.start", "Starting ingestion")
            .product(product_id),
    );

    let store = ctx.store;
    let mut missing = Vec::new();
    if !store.has_data(Zone::Landing, product_id) {
        missing.push("data".to_string());
    }
    if !store.has_meta(Zone::Landing, product_id) {
        missing.push("metadata".to_string());
    }
    if !missing.is_empty() {
        ctx.emit(
            AuditEvent::error(
                Component::Ingest,
                "ingest.missing",
                format!("Missing landing files: {}", missing.join(", ")),
            )
            .product(product_id),
        );
        return Err(IngestError::Missing {
            product_id: product_id.to_string(),
            missing,
        });
    }

    let raw_meta = store.read_meta_raw(Zone::Landing, product_id)?;
    let mut record = match MetadataRecord::parse_validated(&raw_meta, product_id) {
        Ok(record) => record,
        Err(reason) => {
            ctx.emit(
                AuditEvent::error(
                    Component::Ingest,
                    "ingest.schema_invalid",
                    format!("Invalid metadata: {}", reason),
                )
                .product(product_id),
            );
            return Err(IngestError::SchemaInvalid {
                product_id: product_id.to_string(),
                reason,
            });
        }
    };

    let artifact = store.read_data(Zone::Landing, product_id)?;
    let original_hash = Fingerprint::of_bytes(&artifact);

    record.status = record.status.transition(ProductStatus::Ingested)?;
    record.original_hash = Some(original_hash.clone());
    record.processed_hash = None;

    let path = store.write_data(Zone::Staging, product_id, &artifact)?;
    if let Err(e) = store.write_meta(Zone::Staging, product_id, &record) {
        let _ = store.remove_data(Zone::Staging, product_id);
        ctx.emit(
            AuditEvent::error(
                Component::Ingest,
                "ingest.write_failed",
                format!("Staging metadata write failed: {}", e),
            )
            .product(product_id),
        );
        return Err(e.into());
    }

    ctx.emit(
        AuditEvent::info(
            Component::Ingest,
            "ingest.success",
            format!("Product ingested. Hash: {}", original_hash),
        )
        .product(product_id)
        .data(json!({ "original_hash": original_hash, "bytes": artifact.len() })),
    );

    Ok(ArtifactRef {
        product_id: product_id.to_string(),
        zone: Zone::Staging,
        path,
        fingerprint: original_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::store::{LifecycleStore, ZoneLayout};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LifecycleStore, MemoryAuditSink) {
        let dir = TempDir::new().unwrap();
        let store = LifecycleStore::new(dir.path(), ZoneLayout::default());
        store.ensure_zones().unwrap();
        (dir, store, MemoryAuditSink::new())
    }

    fn land(store: &LifecycleStore, id: &str, data: &[u8]) {
        store.write_data(Zone::Landing, id, data).unwrap();
        store
            .write_meta(Zone::Landing, id, &MetadataRecord::new(id, "Simulated-MSI"))
            .unwrap();
    }

    #[test]
    fn test_ingest_success() {
        let (_dir, store, audit) = setup();
        land(&store, "P1", b"raw-samples");
        let ctx = StageContext::new(&store, &audit);

        let artifact = ingest(&ctx, "P1").unwrap();
        assert_eq!(artifact.zone, Zone::Staging);
        assert_eq!(artifact.fingerprint, Fingerprint::of_bytes(b"raw-samples"));

        let record = store.read_meta(Zone::Staging, "P1").unwrap();
        assert_eq!(record.status, ProductStatus::Ingested);
        assert_eq!(record.original_hash, Some(artifact.fingerprint.clone()));
        assert_eq!(store.read_data(Zone::Staging, "P1").unwrap(), b"raw-samples");

        let success = audit.of_kind("ingest.success");
        assert_eq!(success.len(), 1);
        assert!(success[0].message.contains(artifact.fingerprint.as_str()));
    }

    #[test]
    fn test_missing_data_writes_nothing() {
        let (_dir, store, audit) = setup();
        store
            .write_meta(Zone::Landing, "P1", &MetadataRecord::new("P1", "src"))
            .unwrap();
        let ctx = StageContext::new(&store, &audit);

        let err = ingest(&ctx, "P1").unwrap_err();
        assert!(matches!(err, IngestError::Missing { ref missing, .. } if missing == &vec!["data".to_string()]));
        assert_eq!(fs::read_dir(store.zone_dir(Zone::Staging)).unwrap().count(), 0);
        assert!(audit.contains_kind("ingest.missing"));
    }

    #[test]
    fn test_schema_invalid() {
        let (_dir, store, audit) = setup();
        store.write_data(Zone::Landing, "P1", b"x").unwrap();
        fs::write(
            store.meta_path(Zone::Landing, "P1"),
            json!({"product_id": "P1", "creation_timestamp": "2026-01-01T00:00:00Z"}).to_string(),
        )
        .unwrap();
        let ctx = StageContext::new(&store, &audit);

        let err = ingest(&ctx, "P1").unwrap_err();
        assert!(matches!(err, IngestError::SchemaInvalid { .. }));
        assert!(!store.has_data(Zone::Staging, "P1"));
        assert!(audit.contains_kind("ingest.schema_invalid"));
    }

    #[test]
    fn test_unparseable_metadata_is_schema_invalid() {
        let (_dir, store, audit) = setup();
        store.write_data(Zone::Landing, "P1", b"x").unwrap();
        fs::write(store.meta_path(Zone::Landing, "P1"), "{{{").unwrap();
        let ctx = StageContext::new(&store, &audit);

        assert!(matches!(
            ingest(&ctx, "P1"),
            Err(IngestError::SchemaInvalid {
                reason: SchemaError::Malformed(_),
                ..
            })
        ));
    }
}
