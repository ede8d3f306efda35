//! Processing: tamper check, transform, re-fingerprint
//!
//! The staged artifact is re-hashed and compared to `original_hash` before
//! anything else happens. Content whose provenance cannot be proven is never
//! transformed. After the transform, a new `processed_hash` supersedes the
//! original as the reference for every later check.

use chrono::Utc;
use serde_json::json;

use super::transform::{QcFault, Transform};
use super::{ArtifactRef, StageContext};
use crate::audit::{AuditEvent, Component};
use crate::integrity::Fingerprint;
use crate::state::{ProductStatus, StatusError};
use crate::store::{StoreError, Zone};

/// Processing errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("staged artifact or metadata missing for {0}")]
    Missing(String),

    #[error("integrity mismatch for {product_id}: expected {expected}, found {actual}")]
    IntegrityMismatch {
        product_id: String,
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("no baseline fingerprint recorded for {0}")]
    NoBaseline(String),

    #[error("quality control failed for {product_id}: {fault}")]
    QcFailed { product_id: String, fault: QcFault },

    #[error("status error: {0}")]
    Status(#[from] StatusError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for processing
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Verify, transform and re-fingerprint a staged product
pub fn process(
    ctx: &StageContext<'_>,
    product_id: &str,
    transform: &dyn Transform,
) -> ProcessResult<ArtifactRef> {
    ctx.emit(
        AuditEvent::info(Component::Process, "process.start", "Starting processing")
            .product(product_id),
    );

    let store = ctx.store;
    if !store.has_data(Zone::Staging, product_id) || !store.has_meta(Zone::Staging, product_id) {
        ctx.emit(
            AuditEvent::error(Component::Process, "process.missing", "Staged files missing")
                .product(product_id),
        );
        return Err(ProcessError::Missing(product_id.to_string()));
    }

    let mut record = store.read_meta(Zone::Staging, product_id)?;
    let expected = record
        .original_hash
        .clone()
        .ok_or_else(|| ProcessError::NoBaseline(product_id.to_string()))?;
    let next_status = record.status.transition(ProductStatus::Processed)?;

    let artifact = store.read_data(Zone::Staging, product_id)?;
    let actual = Fingerprint::of_bytes(&artifact);
    if actual != expected {
        ctx.emit(
            AuditEvent::critical(
                Component::Process,
                "process.integrity_mismatch",
                "Staged artifact does not match its ingestion fingerprint; processing halted",
            )
            .product(product_id)
            .data(json!({ "expected": expected, "actual": actual })),
        );
        return Err(ProcessError::IntegrityMismatch {
            product_id: product_id.to_string(),
            expected,
            actual,
        });
    }

    let transformed = match transform.apply(&artifact) {
        Ok(bytes) => bytes,
        Err(fault) => {
            ctx.emit(
                AuditEvent::warning(
                    Component::Process,
                    "process.qc_failed",
                    format!("Quality control failed: {}", fault),
                )
                .product(product_id),
            );
            return Err(ProcessError::QcFailed {
                product_id: product_id.to_string(),
                fault,
            });
        }
    };

    let processed_hash = Fingerprint::of_bytes(&transformed);
    if processed_hash == expected {
        ctx.emit(
            AuditEvent::info(
                Component::Process,
                "process.noop_transform",
                "Transform left content unchanged; processed hash equals original",
            )
            .product(product_id),
        );
    }

    let path = store.write_data(Zone::Staging, product_id, &transformed)?;

    record.status = next_status;
    record.processed_hash = Some(processed_hash.clone());
    record.processing_level = Some(transform.level().to_string());
    record.processing_timestamp = Some(Utc::now());
    if let Err(e) = store.write_meta(Zone::Staging, product_id, &record) {
        // put the verified original back so staging stays consistent with
        // the metadata that is still on disk
        let _ = store.write_data(Zone::Staging, product_id, &artifact);
        return Err(e.into());
    }

    ctx.emit(
        AuditEvent::info(
            Component::Process,
            "process.success",
            format!("Product processed to {}", transform.level()),
        )
        .product(product_id)
        .data(json!({ "original_hash": expected, "processed_hash": processed_hash })),
    );

    Ok(ArtifactRef {
        product_id: product_id.to_string(),
        zone: Zone::Staging,
        path,
        fingerprint: processed_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MemoryAuditSink, Severity};
    use crate::stages::ingest::ingest;
    use crate::stages::transform::{encode_samples, RadiometricScaling};
    use crate::store::{LifecycleStore, MetadataRecord, ZoneLayout};
    use tempfile::TempDir;

    fn staged(samples: &[f32]) -> (TempDir, LifecycleStore, MemoryAuditSink) {
        let dir = TempDir::new().unwrap();
        let store = LifecycleStore::new(dir.path(), ZoneLayout::default());
        store.ensure_zones().unwrap();
        store
            .write_data(Zone::Landing, "P1", &encode_samples(samples))
            .unwrap();
        store
            .write_meta(Zone::Landing, "P1", &MetadataRecord::new("P1", "Simulated-MSI"))
            .unwrap();
        let audit = MemoryAuditSink::new();
        ingest(&StageContext::new(&store, &audit), "P1").unwrap();
        (dir, store, audit)
    }

    #[test]
    fn test_process_success_rehashes() {
        let (_dir, store, audit) = staged(&[255.0, 127.5]);
        let ctx = StageContext::new(&store, &audit);

        let artifact = process(&ctx, "P1", &RadiometricScaling::default()).unwrap();
        let record = store.read_meta(Zone::Staging, "P1").unwrap();

        assert_eq!(record.status, ProductStatus::Processed);
        assert_eq!(record.processed_hash, Some(artifact.fingerprint.clone()));
        assert_ne!(record.processed_hash, record.original_hash);
        assert_eq!(record.processing_level.as_deref(), Some("L1"));
        assert_eq!(
            store.fingerprint(Zone::Staging, "P1").unwrap(),
            Some(artifact.fingerprint)
        );
    }

    #[test]
    fn test_tampered_staging_is_integrity_mismatch() {
        let (_dir, store, audit) = staged(&[1.0, 2.0]);
        store
            .write_data(Zone::Staging, "P1", &encode_samples(&[1.0, 3.0]))
            .unwrap();
        let ctx = StageContext::new(&store, &audit);

        let err = process(&ctx, "P1", &RadiometricScaling::default()).unwrap_err();
        assert!(matches!(err, ProcessError::IntegrityMismatch { .. }));

        let record = store.read_meta(Zone::Staging, "P1").unwrap();
        assert_eq!(record.status, ProductStatus::Ingested);
        assert!(record.processed_hash.is_none());

        let events = audit.of_kind("process.integrity_mismatch");
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[test]
    fn test_sensor_fault_is_qc_failed() {
        let (_dir, store, audit) = staged(&[1.0, f32::NAN]);
        let before = store.read_data(Zone::Staging, "P1").unwrap();
        let ctx = StageContext::new(&store, &audit);

        let err = process(&ctx, "P1", &RadiometricScaling::default()).unwrap_err();
        assert!(matches!(err, ProcessError::QcFailed { .. }));
        assert_eq!(store.read_data(Zone::Staging, "P1").unwrap(), before);
        assert_eq!(
            store.read_meta(Zone::Staging, "P1").unwrap().status,
            ProductStatus::Ingested
        );
    }

    #[test]
    fn test_noop_transform_still_recorded() {
        let (_dir, store, audit) = staged(&[0.5]);
        let ctx = StageContext::new(&store, &audit);

        process(&ctx, "P1", &RadiometricScaling { gain: 1.0 }).unwrap();
        let record = store.read_meta(Zone::Staging, "P1").unwrap();
        assert_eq!(record.processed_hash, record.original_hash);
        assert!(audit.contains_kind("process.noop_transform"));
    }

    #[test]
    fn test_not_ingested_is_missing() {
        let dir = TempDir::new().unwrap();
        let store = LifecycleStore::new(dir.path(), ZoneLayout::default());
        let audit = MemoryAuditSink::new();
        let ctx = StageContext::new(&store, &audit);
        assert!(matches!(
            process(&ctx, "P1", &RadiometricScaling::default()),
            Err(ProcessError::Missing(_))
        ));
    }
}
