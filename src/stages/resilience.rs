//! Replication, integrity audit and self-healing
//!
//! The replica vault holds a second full copy of each sealed artifact plus a
//! snapshot of its metadata. An audit compares the vault artifact against a
//! fingerprint from an independent source ([`ReferenceHashProvider`]) and,
//! on mismatch, swaps the replica bytes back in with a single atomic rename.
//!
//! Status handling on the vault record:
//! - mismatch found: ARCHIVED → CORRUPTED, remembering the prior status
//! - healed: restored to the remembered status
//! - unrecoverable: stays CORRUPTED

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use super::{ArtifactRef, StageContext};
use crate::audit::{AuditEvent, Component};
use crate::integrity::Fingerprint;
use crate::state::ProductStatus;
use crate::store::{LifecycleStore, MetadataRecord, StoreError, StoreResult, Zone};

/// Errors from the resilience stage
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("no vault artifact for {0}; nothing to protect")]
    NothingToProtect(String),

    #[error("vault artifact for {product_id} does not match its catalog fingerprint; refusing to replicate")]
    VaultMismatch {
        product_id: String,
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("no trusted reference fingerprint available for {0}")]
    NoReference(String),

    #[error("vault artifact for {0} still mismatches after restore")]
    HealVerificationFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Outcome of an integrity audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    /// Vault artifact matches the reference
    Healthy,
    /// Mismatch found and repaired from the replica
    Healed,
    /// Mismatch found and no good copy survives
    Unrecoverable,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Healthy => "HEALTHY",
            AuditOutcome::Healed => "HEALED",
            AuditOutcome::Unrecoverable => "UNRECOVERABLE",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the trusted fingerprint for a vault artifact.
///
/// Implementations must never derive the value from the vault artifact under
/// test. `Ok(None)` means the source has no opinion for this product.
pub trait ReferenceHashProvider {
    fn trusted_hash(&self, product_id: &str) -> StoreResult<Option<Fingerprint>>;
}

impl<F> ReferenceHashProvider for F
where
    F: Fn(&str) -> Option<Fingerprint>,
{
    fn trusted_hash(&self, product_id: &str) -> StoreResult<Option<Fingerprint>> {
        Ok(self(product_id))
    }
}

/// Fingerprint of the replica copy
pub struct ReplicaReference<'a> {
    store: &'a LifecycleStore,
}

impl<'a> ReplicaReference<'a> {
    pub fn new(store: &'a LifecycleStore) -> Self {
        Self { store }
    }
}

impl ReferenceHashProvider for ReplicaReference<'_> {
    fn trusted_hash(&self, product_id: &str) -> StoreResult<Option<Fingerprint>> {
        self.store.fingerprint(Zone::Replica, product_id)
    }
}

/// `vault_hash` recorded in the catalog at archive time.
///
/// Falls back to the replica's metadata snapshot when the vault record
/// itself is gone.
pub struct CatalogReference<'a> {
    store: &'a LifecycleStore,
}

impl<'a> CatalogReference<'a> {
    pub fn new(store: &'a LifecycleStore) -> Self {
        Self { store }
    }
}

impl ReferenceHashProvider for CatalogReference<'_> {
    fn trusted_hash(&self, product_id: &str) -> StoreResult<Option<Fingerprint>> {
        for zone in [Zone::Vault, Zone::Replica] {
            if self.store.has_meta(zone, product_id) {
                if let Some(hash) = self.store.read_meta(zone, product_id)?.vault_hash {
                    return Ok(Some(hash));
                }
            }
        }
        Ok(None)
    }
}

/// Copy the sealed vault artifact and its metadata into the replica vault.
///
/// Replicating again overwrites the previous replica. A vault artifact that
/// no longer matches its recorded `vault_hash` is never copied.
pub fn replicate(ctx: &StageContext<'_>, product_id: &str) -> ResilienceResult<ArtifactRef> {
    let store = ctx.store;
    if !store.has_data(Zone::Vault, product_id) {
        ctx.emit(
            AuditEvent::error(
                Component::Resilience,
                "resilience.replicate_missing",
                "No vault artifact to replicate",
            )
            .product(product_id),
        );
        return Err(ResilienceError::NothingToProtect(product_id.to_string()));
    }

    let sealed = store.read_data(Zone::Vault, product_id)?;
    let fingerprint = Fingerprint::of_bytes(&sealed);
    let record = if store.has_meta(Zone::Vault, product_id) {
        Some(store.read_meta(Zone::Vault, product_id)?)
    } else {
        None
    };

    if let Some(expected) = record.as_ref().and_then(|r| r.vault_hash.as_ref()) {
        if expected != &fingerprint {
            ctx.emit(
                AuditEvent::critical(
                    Component::Resilience,
                    "resilience.replicate_refused",
                    "Vault artifact does not match catalog fingerprint; replica left untouched",
                )
                .product(product_id)
                .data(json!({ "expected": expected, "actual": fingerprint })),
            );
            return Err(ResilienceError::VaultMismatch {
                product_id: product_id.to_string(),
                expected: expected.clone(),
                actual: fingerprint,
            });
        }
    }

    let path = store.write_data(Zone::Replica, product_id, &sealed)?;
    if let Some(record) = &record {
        store.write_meta(Zone::Replica, product_id, record)?;
    }

    ctx.emit(
        AuditEvent::info(
            Component::Resilience,
            "resilience.replicated",
            "Vault artifact replicated",
        )
        .product(product_id)
        .data(json!({ "fingerprint": fingerprint })),
    );

    Ok(ArtifactRef {
        product_id: product_id.to_string(),
        zone: Zone::Replica,
        path,
        fingerprint,
    })
}

/// Verify the vault artifact against `reference` and restore it from the
/// replica on mismatch. Safe to re-run.
pub fn audit_and_heal(
    ctx: &StageContext<'_>,
    product_id: &str,
    reference: &dyn ReferenceHashProvider,
) -> ResilienceResult<AuditOutcome> {
    let store = ctx.store;
    ctx.emit(
        AuditEvent::info(
            Component::Resilience,
            "resilience.audit_start",
            "Starting integrity audit",
        )
        .product(product_id),
    );

    let trusted = reference
        .trusted_hash(product_id)?
        .ok_or_else(|| ResilienceError::NoReference(product_id.to_string()))?;
    let current = store.fingerprint(Zone::Vault, product_id)?;

    if current.as_ref() == Some(&trusted) {
        restore_status(store, product_id, None)?;
        ctx.emit(
            AuditEvent::info(
                Component::Resilience,
                "resilience.healthy",
                "Vault artifact matches reference",
            )
            .product(product_id),
        );
        return Ok(AuditOutcome::Healthy);
    }

    ctx.emit(
        AuditEvent::critical(
            Component::Resilience,
            "resilience.corruption_detected",
            "Vault artifact does not match trusted reference",
        )
        .product(product_id)
        .data(json!({
            "expected": trusted,
            "actual": current.as_ref().map(|f| f.as_str()).unwrap_or("absent"),
        })),
    );
    demote(store, product_id)?;

    let replica = if store.has_data(Zone::Replica, product_id) {
        Some(store.read_data(Zone::Replica, product_id)?)
    } else {
        None
    };
    let replica = match replica {
        Some(bytes) if Fingerprint::of_bytes(&bytes) == trusted => bytes,
        other => {
            let reason = if other.is_some() {
                "replica also fails verification"
            } else {
                "no replica exists"
            };
            ctx.emit(
                AuditEvent::critical(
                    Component::Resilience,
                    "resilience.unrecoverable",
                    format!("No surviving good copy: {}", reason),
                )
                .product(product_id),
            );
            return Ok(AuditOutcome::Unrecoverable);
        }
    };

    store.write_data(Zone::Vault, product_id, &replica)?;
    if store.fingerprint(Zone::Vault, product_id)?.as_ref() != Some(&trusted) {
        return Err(ResilienceError::HealVerificationFailed(product_id.to_string()));
    }

    let snapshot = if store.has_meta(Zone::Replica, product_id) {
        Some(store.read_meta(Zone::Replica, product_id)?)
    } else {
        None
    };
    restore_status(store, product_id, snapshot)?;

    ctx.emit(
        AuditEvent::warning(
            Component::Resilience,
            "resilience.healed",
            "Vault artifact restored from replica",
        )
        .product(product_id)
        .data(json!({ "fingerprint": trusted })),
    );
    Ok(AuditOutcome::Healed)
}

fn demote(store: &LifecycleStore, product_id: &str) -> StoreResult<()> {
    if !store.has_meta(Zone::Vault, product_id) {
        return Ok(());
    }
    let mut record = store.read_meta(Zone::Vault, product_id)?;
    if let Ok(next) = record.status.transition(ProductStatus::Corrupted) {
        record.pre_corruption_status = Some(record.status);
        record.status = next;
        store.write_meta(Zone::Vault, product_id, &record)?;
    }
    Ok(())
}

/// Lift a CORRUPTED vault record back to its remembered status. A missing
/// vault record is rebuilt from `snapshot` when one is given.
fn restore_status(
    store: &LifecycleStore,
    product_id: &str,
    snapshot: Option<MetadataRecord>,
) -> StoreResult<()> {
    let record = if store.has_meta(Zone::Vault, product_id) {
        Some(store.read_meta(Zone::Vault, product_id)?)
    } else {
        snapshot
    };
    let Some(mut record) = record else {
        return Ok(());
    };

    let rewrite = !store.has_meta(Zone::Vault, product_id)
        || record.status == ProductStatus::Corrupted;
    if record.status == ProductStatus::Corrupted {
        record.status = record
            .pre_corruption_status
            .take()
            .unwrap_or(ProductStatus::Archived);
    }
    if rewrite {
        store.write_meta(Zone::Vault, product_id, &record)?;
    }
    Ok(())
}

/// Overwrite the vault artifact with `garbage` (operator drill)
pub fn simulate_corruption(
    ctx: &StageContext<'_>,
    product_id: &str,
    garbage: &[u8],
) -> ResilienceResult<()> {
    if !ctx.store.has_data(Zone::Vault, product_id) {
        return Err(ResilienceError::NothingToProtect(product_id.to_string()));
    }
    ctx.store.write_data(Zone::Vault, product_id, garbage)?;
    ctx.emit(
        AuditEvent::warning(
            Component::Resilience,
            "resilience.corruption_simulated",
            format!("Vault artifact overwritten with {} bytes of garbage", garbage.len()),
        )
        .product(product_id),
    );
    Ok(())
}
