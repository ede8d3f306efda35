//! Key rotation
//!
//! Every sealed artifact in the vault and the replica vault is re-sealed
//! under a freshly generated key in three phases:
//!
//! 1. Prepare: open with the old key, seal with the new one, write the result
//!    to a hidden temporary sibling. Any failure removes every temporary and
//!    aborts with nothing changed.
//! 2. Commit: rename temporaries into place, then persist the new key. A
//!    failure here rolls already-renamed artifacts back to the old bytes.
//! 3. Metadata: every `vault_hash` that named an old ciphertext is moved to
//!    the ciphertext that replaced it, in vault and replica records alike.
//!
//! A replica holding the same cleartext as its vault artifact is given the
//! vault's new ciphertext, so the two copies stay byte-identical.
//!
//! The caller must hold exclusive access to all sealed artifacts.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use super::StageContext;
use crate::audit::{AuditEvent, Component};
use crate::integrity::{self, CryptoError, Fingerprint, KeyError, KeyStore, VaultKey};
use crate::store::{atomic_write, StoreError, Zone};

/// Rotation errors
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("cannot re-seal {zone} artifact {product_id}: {source}")]
    Reseal {
        zone: Zone,
        product_id: String,
        #[source]
        source: CryptoError,
    },

    #[error("rotation commit failed on {path}: {source}")]
    Commit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("new key could not be persisted: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for rotation
pub type RotationResult<T> = Result<T, RotationError>;

/// Summary of a committed rotation
#[derive(Debug, Clone, Serialize)]
pub struct RotationReport {
    pub old_key_id: String,
    pub new_key_id: String,
    pub vault_artifacts: usize,
    pub replica_artifacts: usize,
    /// Records whose metadata could not be refreshed after commit
    pub stale_metadata: Vec<String>,
}

struct Pending {
    zone: Zone,
    product_id: String,
    target: PathBuf,
    temp: PathBuf,
    previous: Vec<u8>,
    cleartext: Fingerprint,
    fingerprint: Fingerprint,
}

/// Re-seal all vault and replica artifacts under a new key and make it the
/// active key. Returns the new key.
pub fn rotate(
    ctx: &StageContext<'_>,
    keys: &KeyStore,
    current: &VaultKey,
) -> RotationResult<(VaultKey, RotationReport)> {
    let next = VaultKey::generate();
    ctx.emit(
        AuditEvent::info(Component::Keys, "key.rotation_start", "Starting key rotation")
            .data(json!({ "old_key_id": current.key_id(), "new_key_id": next.key_id() })),
    );

    let pending = match prepare(ctx, current, &next) {
        Ok(pending) => pending,
        Err(e) => {
            ctx.emit(
                AuditEvent::error(
                    Component::Keys,
                    "key.rotation_aborted",
                    format!("Rotation aborted, active key unchanged: {}", e),
                )
                .data(json!({ "old_key_id": current.key_id() })),
            );
            return Err(e);
        }
    };

    if let Err(e) = commit(&pending, keys, &next) {
        ctx.emit(
            AuditEvent::critical(
                Component::Keys,
                "key.rotation_aborted",
                format!("Rotation commit failed and was rolled back: {}", e),
            )
            .data(json!({ "old_key_id": current.key_id() })),
        );
        return Err(e);
    }

    let stale_metadata = refresh_metadata(ctx, &pending, &next);
    let report = RotationReport {
        old_key_id: current.key_id(),
        new_key_id: next.key_id(),
        vault_artifacts: pending.iter().filter(|p| p.zone == Zone::Vault).count(),
        replica_artifacts: pending.iter().filter(|p| p.zone == Zone::Replica).count(),
        stale_metadata,
    };

    ctx.emit(
        AuditEvent::warning(
            Component::Keys,
            "key.rotated",
            format!(
                "Active key rotated; {} vault and {} replica artifacts re-sealed",
                report.vault_artifacts, report.replica_artifacts
            ),
        )
        .data(json!(report)),
    );
    Ok((next, report))
}

fn prepare(
    ctx: &StageContext<'_>,
    current: &VaultKey,
    next: &VaultKey,
) -> RotationResult<Vec<Pending>> {
    let mut pending: Vec<Pending> = Vec::new();
    let result = (|| -> RotationResult<()> {
        for zone in [Zone::Vault, Zone::Replica] {
            for product_id in ctx.store.list_products(zone)? {
                let previous = ctx.store.read_data(zone, &product_id)?;
                let vault = (zone == Zone::Replica)
                    .then(|| {
                        pending
                            .iter()
                            .find(|p| p.zone == Zone::Vault && p.product_id == product_id)
                    })
                    .flatten();

                // byte-identical replicas skip the decrypt entirely
                let (cleartext, resealed) = match vault {
                    Some(vault) if vault.previous == previous => {
                        (vault.cleartext.clone(), read_temp(vault)?)
                    }
                    _ => {
                        let opened = open_current(zone, &product_id, &previous, current)?;
                        let cleartext = Fingerprint::of_bytes(&opened);
                        let resealed = match vault {
                            Some(vault) if vault.cleartext == cleartext => read_temp(vault)?,
                            _ => seal_next(zone, &product_id, &opened, next)?,
                        };
                        (cleartext, resealed)
                    }
                };

                let target = ctx.store.data_path(zone, &product_id);
                let temp = temp_sibling(&target);
                atomic_write(&temp, &resealed).map_err(|source| StoreError::Io {
                    path: temp.clone(),
                    source,
                })?;
                pending.push(Pending {
                    zone,
                    product_id,
                    target,
                    temp,
                    previous,
                    cleartext,
                    fingerprint: Fingerprint::of_bytes(&resealed),
                });
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(pending),
        Err(e) => {
            for p in &pending {
                let _ = fs::remove_file(&p.temp);
            }
            Err(e)
        }
    }
}

fn open_current(
    zone: Zone,
    product_id: &str,
    sealed: &[u8],
    current: &VaultKey,
) -> RotationResult<Vec<u8>> {
    integrity::open(current, sealed).map_err(|source| RotationError::Reseal {
        zone,
        product_id: product_id.to_string(),
        source,
    })
}

fn seal_next(
    zone: Zone,
    product_id: &str,
    cleartext: &[u8],
    next: &VaultKey,
) -> RotationResult<Vec<u8>> {
    integrity::seal(next, cleartext).map_err(|source| RotationError::Reseal {
        zone,
        product_id: product_id.to_string(),
        source,
    })
}

fn read_temp(pending: &Pending) -> RotationResult<Vec<u8>> {
    fs::read(&pending.temp).map_err(|source| {
        RotationError::Store(StoreError::Io {
            path: pending.temp.clone(),
            source,
        })
    })
}

fn temp_sibling(target: &std::path::Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(
        ".{}.rotate-{}",
        name,
        ulid::Ulid::new().to_string().to_lowercase()
    ))
}

fn commit(pending: &[Pending], keys: &KeyStore, next: &VaultKey) -> RotationResult<()> {
    let mut committed = 0;
    let mut failure = None;
    for p in pending {
        if let Err(source) = fs::rename(&p.temp, &p.target) {
            failure = Some(RotationError::Commit {
                path: p.target.clone(),
                source,
            });
            break;
        }
        committed += 1;
    }

    if failure.is_none() {
        match keys.persist(next) {
            Ok(()) => return Ok(()),
            Err(e) => failure = Some(e.into()),
        }
    }

    for p in &pending[..committed] {
        if let Err(e) = atomic_write(&p.target, &p.previous) {
            tracing::error!(path = %p.target.display(), error = %e, "rollback of re-sealed artifact failed");
        }
    }
    for p in &pending[committed..] {
        let _ = fs::remove_file(&p.temp);
    }
    Err(failure.unwrap_or_else(|| RotationError::Commit {
        path: keys.path().to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "rotation commit failed"),
    }))
}

fn refresh_metadata(ctx: &StageContext<'_>, pending: &[Pending], next: &VaultKey) -> Vec<String> {
    let store = ctx.store;
    let moved: BTreeMap<Fingerprint, &Fingerprint> = pending
        .iter()
        .map(|p| (Fingerprint::of_bytes(&p.previous), &p.fingerprint))
        .collect();
    let products: BTreeSet<&str> =
        pending.iter().map(|p| p.product_id.as_str()).collect();

    let mut stale = Vec::new();
    for product_id in products {
        for zone in [Zone::Vault, Zone::Replica] {
            if !store.has_meta(zone, product_id) {
                continue;
            }
            let result = store.read_meta(zone, product_id).and_then(|mut record| {
                let Some(hash) = record.vault_hash.as_ref() else {
                    return Ok(true);
                };
                let Some(&replacement) = moved.get(hash) else {
                    return Ok(false);
                };
                record.vault_hash = Some(replacement.clone());
                record.key_id = Some(next.key_id());
                store.write_meta(zone, product_id, &record).map(|_| true)
            });
            let reason = match result {
                Ok(true) => continue,
                Ok(false) => "recorded fingerprint matches no re-sealed artifact".to_string(),
                Err(e) => e.to_string(),
            };
            ctx.emit(
                AuditEvent::error(
                    Component::Keys,
                    "key.metadata_stale",
                    format!("Could not refresh {} metadata after rotation: {}", zone, reason),
                )
                .product(product_id),
            );
            stale.push(format!("{}/{}", zone, product_id));
        }
    }
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::store::{LifecycleStore, MetadataRecord, ZoneLayout};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: LifecycleStore,
        keys: KeyStore,
        key: VaultKey,
        audit: MemoryAuditSink,
    }

    fn fixture(ids: &[&str]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = LifecycleStore::new(dir.path().join("data"), ZoneLayout::default());
        store.ensure_zones().unwrap();
        let keys = KeyStore::new(dir.path().join("secret.key"));
        let (key, _) = keys.load_or_create().unwrap();

        for id in ids {
            let sealed = integrity::seal(&key, format!("payload-{}", id).as_bytes()).unwrap();
            let mut record = MetadataRecord::new(id, "Simulated-MSI");
            record.vault_hash = Some(Fingerprint::of_bytes(&sealed));
            record.key_id = Some(key.key_id());
            for zone in [Zone::Vault, Zone::Replica] {
                store.write_data(zone, id, &sealed).unwrap();
                store.write_meta(zone, id, &record).unwrap();
            }
        }
        Fixture {
            _dir: dir,
            store,
            keys,
            key,
            audit: MemoryAuditSink::new(),
        }
    }

    #[test]
    fn test_rotation_reseals_everything() {
        let f = fixture(&["P1", "P2"]);
        let ctx = StageContext::new(&f.store, &f.audit);

        let (next, report) = rotate(&ctx, &f.keys, &f.key).unwrap();
        assert_eq!(report.vault_artifacts, 2);
        assert_eq!(report.replica_artifacts, 2);
        assert_eq!(f.keys.load().unwrap().unwrap().key_id(), next.key_id());

        for id in ["P1", "P2"] {
            for zone in [Zone::Vault, Zone::Replica] {
                let sealed = f.store.read_data(zone, id).unwrap();
                assert!(integrity::open(&f.key, &sealed).is_err());
                assert_eq!(
                    integrity::open(&next, &sealed).unwrap(),
                    format!("payload-{}", id).into_bytes()
                );
            }
            let record = f.store.read_meta(Zone::Vault, id).unwrap();
            assert_eq!(record.key_id, Some(next.key_id()));
            assert_eq!(record.vault_hash, f.store.fingerprint(Zone::Vault, id).unwrap());
            assert_eq!(
                f.store.fingerprint(Zone::Replica, id).unwrap(),
                f.store.fingerprint(Zone::Vault, id).unwrap()
            );
        }
    }

    #[test]
    fn test_one_bad_artifact_aborts_everything() {
        let f = fixture(&["P1", "P2"]);
        f.store.write_data(Zone::Replica, "P2", b"not a sealed blob").unwrap();
        let before: Vec<Vec<u8>> = ["P1", "P2"]
            .iter()
            .map(|id| f.store.read_data(Zone::Vault, id).unwrap())
            .collect();
        let ctx = StageContext::new(&f.store, &f.audit);

        let err = rotate(&ctx, &f.keys, &f.key).unwrap_err();
        assert!(matches!(err, RotationError::Reseal { zone: Zone::Replica, .. }));

        assert_eq!(f.keys.load().unwrap().unwrap().key_id(), f.key.key_id());
        for (id, bytes) in ["P1", "P2"].iter().zip(before) {
            assert_eq!(f.store.read_data(Zone::Vault, id).unwrap(), bytes);
            assert!(integrity::open(&f.key, &bytes).is_ok());
        }
        let leftovers = fs::read_dir(f.store.zone_dir(Zone::Vault))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".rotate-"))
            .count();
        assert_eq!(leftovers, 0);
        assert!(f.audit.contains_kind("key.rotation_aborted"));
    }

    #[test]
    fn test_unmatched_record_is_reported_stale() {
        let f = fixture(&["P1"]);
        let mut record = f.store.read_meta(Zone::Replica, "P1").unwrap();
        record.vault_hash = Some(Fingerprint::of_bytes(b"some older artifact"));
        f.store.write_meta(Zone::Replica, "P1", &record).unwrap();
        let ctx = StageContext::new(&f.store, &f.audit);

        let (next, report) = rotate(&ctx, &f.keys, &f.key).unwrap();
        assert_eq!(report.stale_metadata, vec!["replica/P1".to_string()]);
        // the record is left as it was rather than vouching for new bytes
        let untouched = f.store.read_meta(Zone::Replica, "P1").unwrap();
        assert_eq!(untouched.vault_hash, record.vault_hash);
        assert_eq!(
            f.store.read_meta(Zone::Vault, "P1").unwrap().key_id,
            Some(next.key_id())
        );
        assert!(f.audit.contains_kind("key.metadata_stale"));
    }

    #[test]
    fn test_empty_vault_still_rotates_key() {
        let f = fixture(&[]);
        let ctx = StageContext::new(&f.store, &f.audit);
        let (next, report) = rotate(&ctx, &f.keys, &f.key).unwrap();
        assert_eq!(report.vault_artifacts, 0);
        assert_ne!(next.key_id(), f.key.key_id());
    }
}
