//! Archiving: staging cleartext → sealed vault artifact
//!
//! Order matters here. The artifact is sealed before any vault metadata is
//! written, so no record ever claims ARCHIVED for content that is not
//! encrypted at rest. Purging the staging cleartext comes last and cannot
//! fail the operation; a leftover copy is reported according to
//! [`StaleCleartextPolicy`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

use super::{ArtifactRef, StageContext};
use crate::audit::{AuditEvent, Component};
use crate::integrity::{self, CryptoError, Fingerprint, VaultKey};
use crate::state::{ProductStatus, StatusError};
use crate::store::{atomic_write, LifecycleStore, MetadataRecord, StoreError, StoreResult, Zone};

/// How a staging copy that survived the purge is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleCleartextPolicy {
    /// Warning event only
    Warn,
    /// Critical event flagged as a security finding
    #[default]
    Incident,
}

/// Archive behaviour knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSettings {
    pub purge_staging: bool,
    pub confidentiality_label: String,
    pub stale_cleartext_policy: StaleCleartextPolicy,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            purge_staging: true,
            confidentiality_label: "CONFIDENTIAL".to_string(),
            stale_cleartext_policy: StaleCleartextPolicy::Incident,
        }
    }
}

/// Archive and retrieval errors
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{zone} files missing for {product_id}")]
    Missing { product_id: String, zone: Zone },

    #[error("staged artifact for {product_id} does not match its recorded fingerprint")]
    IntegrityMismatch {
        product_id: String,
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("encryption failed for {product_id}: {source}")]
    EncryptionFailed {
        product_id: String,
        #[source]
        source: CryptoError,
    },

    #[error("decryption failed for {product_id}: {source}")]
    Crypto {
        product_id: String,
        #[source]
        source: CryptoError,
    },

    #[error("status error: {0}")]
    Status(#[from] StatusError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for archiving
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Seal a processed product into the vault
pub fn archive(
    ctx: &StageContext<'_>,
    product_id: &str,
    key: &VaultKey,
    settings: &ArchiveSettings,
) -> ArchiveResult<ArtifactRef> {
    ctx.emit(
        AuditEvent::info(Component::Archive, "archive.start", "Starting archiving")
            .product(product_id),
    );

    let store = ctx.store;
    if !store.has_data(Zone::Staging, product_id) || !store.has_meta(Zone::Staging, product_id) {
        ctx.emit(
            AuditEvent::error(Component::Archive, "archive.missing", "Staged files missing")
                .product(product_id),
        );
        return Err(ArchiveError::Missing {
            product_id: product_id.to_string(),
            zone: Zone::Staging,
        });
    }

    let mut record = store.read_meta(Zone::Staging, product_id)?;
    let next_status = record.status.transition(ProductStatus::Archived)?;

    let cleartext = store.read_data(Zone::Staging, product_id)?;
    let actual = Fingerprint::of_bytes(&cleartext);
    if let Some(expected) = record.reference_hash() {
        if &actual != expected {
            ctx.emit(
                AuditEvent::critical(
                    Component::Archive,
                    "archive.integrity_mismatch",
                    "Staged artifact changed after processing; archiving halted",
                )
                .product(product_id)
                .data(json!({ "expected": expected, "actual": actual })),
            );
            return Err(ArchiveError::IntegrityMismatch {
                product_id: product_id.to_string(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    let sealed = match integrity::seal(key, &cleartext) {
        Ok(sealed) => sealed,
        Err(source) => {
            ctx.emit(
                AuditEvent::error(
                    Component::Archive,
                    "archive.encryption_failed",
                    format!("Encryption failed: {}", source),
                )
                .product(product_id),
            );
            return Err(ArchiveError::EncryptionFailed {
                product_id: product_id.to_string(),
                source,
            });
        }
    };
    let vault_hash = Fingerprint::of_bytes(&sealed);
    let path = store.write_data(Zone::Vault, product_id, &sealed)?;

    record.status = next_status;
    record.confidentiality = Some(settings.confidentiality_label.clone());
    record.archived_path = Some(store.logical_path(Zone::Vault, product_id));
    record.archived_at = Some(Utc::now());
    record.vault_hash = Some(vault_hash.clone());
    record.key_id = Some(key.key_id());
    if let Err(e) = store.write_meta(Zone::Vault, product_id, &record) {
        let _ = store.remove_data(Zone::Vault, product_id);
        return Err(e.into());
    }

    ctx.emit(
        AuditEvent::info(
            Component::Archive,
            "archive.success",
            format!("Product sealed into {}", store.logical_path(Zone::Vault, product_id)),
        )
        .product(product_id)
        .data(json!({ "vault_hash": vault_hash, "key_id": key.key_id() })),
    );

    if settings.purge_staging {
        if let Err(e) = purge_staging(store, product_id) {
            report_stale_cleartext(ctx, product_id, settings.stale_cleartext_policy, &e);
        }
    }

    Ok(ArtifactRef {
        product_id: product_id.to_string(),
        zone: Zone::Vault,
        path,
        fingerprint: vault_hash,
    })
}

fn purge_staging(store: &LifecycleStore, product_id: &str) -> StoreResult<()> {
    store.remove_data(Zone::Staging, product_id)?;
    store.remove_meta(Zone::Staging, product_id)?;
    Ok(())
}

/// Record that cleartext was left behind in staging after archiving
pub fn report_stale_cleartext(
    ctx: &StageContext<'_>,
    product_id: &str,
    policy: StaleCleartextPolicy,
    cause: &StoreError,
) {
    let event = match policy {
        StaleCleartextPolicy::Warn => AuditEvent::warning(
            Component::Archive,
            "archive.stale_cleartext",
            format!("Could not purge staging cleartext: {}", cause),
        ),
        StaleCleartextPolicy::Incident => AuditEvent::critical(
            Component::Archive,
            "archive.stale_cleartext",
            format!(
                "Cleartext copy left in staging after archiving; remove it manually: {}",
                cause
            ),
        )
        .data(json!({ "security_finding": true })),
    };
    ctx.emit(event.product(product_id));
}

/// Decrypt a copy of the vault artifact to `output`.
///
/// The vault ciphertext itself is only read. Tampered ciphertext fails the
/// authentication check and nothing is written.
pub fn retrieve(
    ctx: &StageContext<'_>,
    product_id: &str,
    key: &VaultKey,
    output: &Path,
) -> ArchiveResult<PathBuf> {
    let store = ctx.store;
    if !store.has_data(Zone::Vault, product_id) {
        return Err(ArchiveError::Missing {
            product_id: product_id.to_string(),
            zone: Zone::Vault,
        });
    }

    let sealed = store.read_data(Zone::Vault, product_id)?;
    let cleartext = integrity::open(key, &sealed).map_err(|source| {
        ctx.emit(
            AuditEvent::error(
                Component::Archive,
                "archive.decryption_failed",
                format!("Vault artifact failed authentication: {}", source),
            )
            .product(product_id),
        );
        ArchiveError::Crypto {
            product_id: product_id.to_string(),
            source,
        }
    })?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    atomic_write(output, &cleartext).map_err(|source| StoreError::Io {
        path: output.to_path_buf(),
        source,
    })?;

    ctx.emit(
        AuditEvent::info(
            Component::Archive,
            "archive.retrieved",
            format!("Decrypted copy written to {}", output.display()),
        )
        .product(product_id),
    );
    Ok(output.to_path_buf())
}

/// Catalog filter; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub status: Option<ProductStatus>,
    pub confidentiality: Option<String>,
    pub source_identifier: Option<String>,
}

impl CatalogFilter {
    pub fn matches(&self, record: &MetadataRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self
                .confidentiality
                .as_ref()
                .map_or(true, |c| record.confidentiality.as_ref() == Some(c))
            && self
                .source_identifier
                .as_ref()
                .map_or(true, |s| &record.source_identifier == s)
    }
}

/// All vault metadata records, sorted by product id
pub fn catalog(store: &LifecycleStore) -> StoreResult<Vec<MetadataRecord>> {
    search(store, &CatalogFilter::default())
}

/// Vault metadata records matching `filter`
pub fn search(store: &LifecycleStore, filter: &CatalogFilter) -> StoreResult<Vec<MetadataRecord>> {
    let mut records = Vec::new();
    for id in store.list_products(Zone::Vault)? {
        if !store.has_meta(Zone::Vault, &id) {
            continue;
        }
        let record = store.read_meta(Zone::Vault, &id)?;
        if filter.matches(&record) {
            records.push(record);
        }
    }
    Ok(records)
}

/// Catalog export schema identifier
pub const CATALOG_SCHEMA_ID: &str = "eo-custody/catalog@1";

/// Point-in-time catalog export with a digest over its entries
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub schema_id: String,
    pub created_at: chrono::DateTime<Utc>,
    pub entries: Vec<MetadataRecord>,
    /// SHA-256 over the JCS-canonical entries
    pub catalog_sha256: Fingerprint,
}

/// Catalog entries could not be canonicalized
#[derive(Debug, thiserror::Error)]
#[error("catalog canonicalization failed: {0}")]
pub struct CanonicalizationError(String);

impl CatalogSnapshot {
    pub fn new(entries: Vec<MetadataRecord>) -> Result<Self, CanonicalizationError> {
        let catalog_sha256 = catalog_digest(&entries)?;
        Ok(Self {
            schema_id: CATALOG_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            entries,
            catalog_sha256,
        })
    }
}

/// Digest of catalog entries, independent of field order and whitespace
pub fn catalog_digest(entries: &[MetadataRecord]) -> Result<Fingerprint, CanonicalizationError> {
    let entries_vec: Vec<_> = entries.to_vec();
    let jcs_bytes = serde_json_canonicalizer::to_vec(&entries_vec)
        .map_err(|e| CanonicalizationError(e.to_string()))?;
    Ok(Fingerprint::of_bytes(&jcs_bytes))
}
