//! Orchestrator
//!
//! Sequences stages per product. For every operation it:
//! 1. authorizes the caller for the stage's guarded [`Action`]
//! 2. takes the store lock (shared; exclusive for key rotation) before any
//!    product or key lock
//! 3. checks the product is in the state the stage requires
//! 4. runs the stage
//!
//! Nothing is retried automatically except the post-heal re-audit.

use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use custody_policy::{AccessPolicy, Action, PolicyConfig};

use crate::access::{AccessController, Credentials};
use crate::audit::{
    self, ids, AuditEvent, AuditSink, Component, FanoutSink, JsonlAuditSink, TracingAuditSink,
};
use crate::config::PipelineSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::generator::{self, Generator, SyntheticGenerator};
use crate::integrity::{Fingerprint, KeyOrigin, KeyStore, VaultKey};
use crate::stages::archive::{self, CatalogFilter, CatalogSnapshot};
use crate::stages::resilience::{
    self, AuditOutcome, CatalogReference, ReferenceHashProvider, ReplicaReference,
};
use crate::stages::rotation::{self, RotationReport};
use crate::stages::transform::{RadiometricScaling, Transform};
use crate::stages::{ingest, process, ArtifactRef, StageContext};
use crate::state::ProductStatus;
use crate::store::{
    validate_product_id, FileLock, LifecycleStore, LockMode, MetadataRecord, ProductGuard, Zone,
};

/// Guarded operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    Ingest,
    Process,
    Archive,
    Replicate,
    Audit,
    Retrieve,
    SimulateCorruption,
    RotateKeys,
    Status,
    Catalog,
    KeyDump,
}

impl Stage {
    /// Permission required to run the stage
    pub fn guard(&self) -> Action {
        match self {
            Stage::Generate | Stage::Archive | Stage::Replicate => Action::Write,
            Stage::Ingest | Stage::Process => Action::Process,
            Stage::Audit | Stage::RotateKeys | Stage::KeyDump => Action::ManageKeys,
            Stage::Retrieve | Stage::Status | Stage::Catalog => Action::Read,
            Stage::SimulateCorruption => Action::Delete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Generate => "generate",
            Stage::Ingest => "ingest",
            Stage::Process => "process",
            Stage::Archive => "archive",
            Stage::Replicate => "replicate",
            Stage::Audit => "audit",
            Stage::Retrieve => "retrieve",
            Stage::SimulateCorruption => "simulate_corruption",
            Stage::RotateKeys => "rotate_keys",
            Stage::Status => "status",
            Stage::Catalog => "catalog",
            Stage::KeyDump => "key_dump",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which independent source `audit_and_heal` trusts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceKind {
    /// Fingerprint of the replica copy
    Replica,
    /// `vault_hash` recorded at archive time
    #[default]
    Catalog,
}

/// Where a product currently stands
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub product_id: String,
    pub zone: Zone,
    pub record: MetadataRecord,
    pub replica_present: bool,
}

/// Result of a full pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub product_id: String,
    pub original_hash: Fingerprint,
    pub processed_hash: Fingerprint,
    pub vault_hash: Fingerprint,
    /// `None` when the caller may not audit; the run stops after replication
    pub audit: Option<AuditOutcome>,
}

/// Key material handed out by [`Orchestrator::emergency_key_dump`]
#[derive(Debug, Clone, Serialize)]
pub struct KeyDump {
    pub key_id: String,
    pub encoded: String,
}

fn any_of(statuses: &[ProductStatus]) -> String {
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Stage sequencer over one lifecycle store
pub struct Orchestrator {
    settings: PipelineSettings,
    store: LifecycleStore,
    keys: KeyStore,
    key: RwLock<VaultKey>,
    access: AccessController,
    audit: Arc<dyn AuditSink>,
    generator: Box<dyn Generator>,
    transform: Box<dyn Transform>,
    locks: crate::store::ProductLocks,
}

impl Orchestrator {
    /// Open the store described by `settings`, creating zones and the key on
    /// first use
    pub fn open(settings: PipelineSettings, audit: Arc<dyn AuditSink>) -> PipelineResult<Self> {
        let store = settings.store();
        store.ensure_zones()?;

        let policy_config = match &settings.policy_path {
            Some(path) => PolicyConfig::from_file(path)?,
            None => PolicyConfig::builtin(),
        };
        let access = AccessController::new(AccessPolicy::from_config(&policy_config), audit.clone());

        let keys = KeyStore::new(settings.resolved_key_path());
        let (key, origin) = keys.load_or_create()?;
        if origin == KeyOrigin::Generated {
            audit.record(
                AuditEvent::info(Component::Keys, "key.generated", "New active key generated")
                    .data(json!({ "key_id": key.key_id() })),
            );
        }

        Ok(Self {
            settings,
            store,
            keys,
            key: RwLock::new(key),
            access,
            audit,
            generator: Box::new(SyntheticGenerator::default()),
            transform: Box::new(RadiometricScaling::default()),
            locks: crate::store::ProductLocks::new(),
        })
    }

    /// Open with the standard sinks: the JSONL audit log plus `tracing`
    pub fn open_with_audit_log(settings: PipelineSettings) -> PipelineResult<Self> {
        let log = JsonlAuditSink::open(&settings.resolved_audit_log())?;
        let sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(log), Arc::new(TracingAuditSink)];
        Self::open(settings, Arc::new(FanoutSink::new(sinks)))
    }

    pub fn with_generator(mut self, generator: impl Generator + 'static) -> Self {
        self.generator = Box::new(generator);
        self
    }

    pub fn with_transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transform = Box::new(transform);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &LifecycleStore {
        &self.store
    }

    pub fn access(&self) -> &AccessController {
        &self.access
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    pub fn active_key_id(&self) -> String {
        self.read_key().key_id()
    }

    fn ctx(&self) -> StageContext<'_> {
        StageContext::new(&self.store, self.audit.as_ref())
    }

    fn read_key(&self) -> RwLockReadGuard<'_, VaultKey> {
        self.key.read().unwrap_or_else(|p| p.into_inner())
    }

    fn store_lock(&self, mode: LockMode) -> PipelineResult<FileLock> {
        Ok(FileLock::acquire(
            self.store.base_dir(),
            mode,
            self.settings.lock_timeout(),
        )?)
    }

    fn product_lock(&self, product_id: &str) -> PipelineResult<ProductGuard<'_>> {
        Ok(self
            .locks
            .acquire(product_id, self.settings.lock_timeout())?)
    }

    fn authorize(&self, credentials: &Credentials, stage: Stage) -> PipelineResult<()> {
        self.access.authorize(credentials, stage.guard())?;
        Ok(())
    }

    /// Authorize, validate the id and take the shared store and product locks
    fn enter(
        &self,
        credentials: &Credentials,
        stage: Stage,
        product_id: &str,
    ) -> PipelineResult<(FileLock, ProductGuard<'_>)> {
        self.authorize(credentials, stage)?;
        validate_product_id(product_id)?;
        let store_lock = self.store_lock(LockMode::Shared)?;
        let guard = self.product_lock(product_id)?;
        Ok((store_lock, guard))
    }

    fn prerequisite(
        &self,
        stage: Stage,
        product_id: &str,
        found: Option<ProductStatus>,
        expected: String,
    ) -> PipelineError {
        self.audit.record(
            AuditEvent::warning(
                Component::Orchestrator,
                "orchestrator.prerequisite_failed",
                format!("{} requires {}", stage, expected),
            )
            .product(product_id)
            .data(json!({ "stage": stage, "found": found })),
        );
        PipelineError::Prerequisite {
            stage,
            product_id: product_id.to_string(),
            found,
            expected,
        }
    }

    /// Require the record in `zone` to carry one of `allowed`
    fn require(
        &self,
        stage: Stage,
        product_id: &str,
        zone: Zone,
        allowed: &[ProductStatus],
    ) -> PipelineResult<MetadataRecord> {
        let found = match self.store.current_record(product_id)? {
            Some((z, record)) if z == zone && allowed.contains(&record.status) => {
                return Ok(record)
            }
            Some((_, record)) => Some(record.status),
            None => None,
        };
        Err(self.prerequisite(stage, product_id, found, any_of(allowed)))
    }

    /// Produce a new product in the landing zone
    pub fn generate(
        &self,
        credentials: &Credentials,
        product_id: &str,
        corrupted: bool,
    ) -> PipelineResult<ArtifactRef> {
        let _locks = self.enter(credentials, Stage::Generate, product_id)?;
        if let Some((_, record)) = self.store.current_record(product_id)? {
            return Err(self.prerequisite(
                Stage::Generate,
                product_id,
                Some(record.status),
                "no existing record".to_string(),
            ));
        }
        let product = self.generator.generate(product_id, corrupted);
        Ok(generator::land(&self.ctx(), product_id, &product)?)
    }

    pub fn ingest(&self, credentials: &Credentials, product_id: &str) -> PipelineResult<ArtifactRef> {
        let _locks = self.enter(credentials, Stage::Ingest, product_id)?;
        // landing records are left to the stage, which reports missing files
        // and schema defects precisely; only a product already past landing
        // is refused here
        for zone in [Zone::Vault, Zone::Staging] {
            if self.store.has_meta(zone, product_id) {
                let record = self.store.read_meta(zone, product_id)?;
                return Err(self.prerequisite(
                    Stage::Ingest,
                    product_id,
                    Some(record.status),
                    any_of(&[ProductStatus::Generated]),
                ));
            }
        }
        Ok(ingest::ingest(&self.ctx(), product_id)?)
    }

    pub fn process(&self, credentials: &Credentials, product_id: &str) -> PipelineResult<ArtifactRef> {
        let _locks = self.enter(credentials, Stage::Process, product_id)?;
        self.require(Stage::Process, product_id, Zone::Staging, &[ProductStatus::Ingested])?;
        Ok(process::process(&self.ctx(), product_id, self.transform.as_ref())?)
    }

    pub fn archive(&self, credentials: &Credentials, product_id: &str) -> PipelineResult<ArtifactRef> {
        let _locks = self.enter(credentials, Stage::Archive, product_id)?;
        self.require(Stage::Archive, product_id, Zone::Staging, &[ProductStatus::Processed])?;
        let key = self.read_key();
        Ok(archive::archive(
            &self.ctx(),
            product_id,
            &key,
            &self.settings.archive_settings(),
        )?)
    }

    pub fn replicate(&self, credentials: &Credentials, product_id: &str) -> PipelineResult<ArtifactRef> {
        let _locks = self.enter(credentials, Stage::Replicate, product_id)?;
        self.require(Stage::Replicate, product_id, Zone::Vault, &[ProductStatus::Archived])?;
        Ok(resilience::replicate(&self.ctx(), product_id)?)
    }

    /// Audit the vault artifact against `reference`, healing from the
    /// replica on mismatch. A heal is confirmed by one re-audit.
    pub fn audit_and_heal(
        &self,
        credentials: &Credentials,
        product_id: &str,
        reference: &dyn ReferenceHashProvider,
    ) -> PipelineResult<AuditOutcome> {
        let _locks = self.enter(credentials, Stage::Audit, product_id)?;

        let vaulted = match self.store.current_record(product_id)? {
            Some((Zone::Vault, record)) => {
                if !record.status.is_vaulted() {
                    return Err(self.prerequisite(
                        Stage::Audit,
                        product_id,
                        Some(record.status),
                        any_of(&[ProductStatus::Archived, ProductStatus::Corrupted]),
                    ));
                }
                true
            }
            _ => false,
        };
        // a vault record lost along with its artifact can still be rebuilt
        // from the replica snapshot
        if !vaulted && !self.store.has_meta(Zone::Replica, product_id) {
            return Err(self.prerequisite(
                Stage::Audit,
                product_id,
                None,
                any_of(&[ProductStatus::Archived, ProductStatus::Corrupted]),
            ));
        }

        let ctx = self.ctx();
        let outcome = resilience::audit_and_heal(&ctx, product_id, reference)?;
        if outcome == AuditOutcome::Healed {
            let confirm = resilience::audit_and_heal(&ctx, product_id, reference)?;
            if confirm != AuditOutcome::Healthy {
                return Err(resilience::ResilienceError::HealVerificationFailed(
                    product_id.to_string(),
                )
                .into());
            }
        }
        Ok(outcome)
    }

    /// [`Orchestrator::audit_and_heal`] with a built-in reference source
    pub fn audit(
        &self,
        credentials: &Credentials,
        product_id: &str,
        kind: ReferenceKind,
    ) -> PipelineResult<AuditOutcome> {
        match kind {
            ReferenceKind::Replica => {
                self.audit_and_heal(credentials, product_id, &ReplicaReference::new(&self.store))
            }
            ReferenceKind::Catalog => {
                self.audit_and_heal(credentials, product_id, &CatalogReference::new(&self.store))
            }
        }
    }

    /// Decrypt a copy of the vault artifact to `output`
    pub fn retrieve(
        &self,
        credentials: &Credentials,
        product_id: &str,
        output: &Path,
    ) -> PipelineResult<PathBuf> {
        let _locks = self.enter(credentials, Stage::Retrieve, product_id)?;
        self.require(Stage::Retrieve, product_id, Zone::Vault, &[ProductStatus::Archived])?;
        let key = self.read_key();
        Ok(archive::retrieve(&self.ctx(), product_id, &key, output)?)
    }

    /// Overwrite the vault artifact with garbage (operator drill)
    pub fn simulate_corruption(
        &self,
        credentials: &Credentials,
        product_id: &str,
        garbage: &[u8],
    ) -> PipelineResult<()> {
        let _locks = self.enter(credentials, Stage::SimulateCorruption, product_id)?;
        Ok(resilience::simulate_corruption(&self.ctx(), product_id, garbage)?)
    }

    /// Re-seal every vault and replica artifact under a new active key
    pub fn rotate_keys(&self, credentials: &Credentials) -> PipelineResult<RotationReport> {
        self.authorize(credentials, Stage::RotateKeys)?;
        let _store_lock = self.store_lock(LockMode::Exclusive)?;
        let mut key = self.key.write().unwrap_or_else(|p| p.into_inner());

        let (next, report) = rotation::rotate(&self.ctx(), &self.keys, &key)?;
        *key = next;
        Ok(report)
    }

    pub fn status(&self, credentials: &Credentials, product_id: &str) -> PipelineResult<StatusReport> {
        self.authorize(credentials, Stage::Status)?;
        validate_product_id(product_id)?;
        match self.store.current_record(product_id)? {
            Some((zone, record)) => Ok(StatusReport {
                product_id: product_id.to_string(),
                zone,
                record,
                replica_present: self.store.has_data(Zone::Replica, product_id),
            }),
            None => Err(self.prerequisite(
                Stage::Status,
                product_id,
                None,
                "an existing record".to_string(),
            )),
        }
    }

    /// Vault catalog entries matching `filter`
    pub fn catalog(
        &self,
        credentials: &Credentials,
        filter: &CatalogFilter,
    ) -> PipelineResult<Vec<MetadataRecord>> {
        self.authorize(credentials, Stage::Catalog)?;
        Ok(archive::search(&self.store, filter)?)
    }

    /// Catalog entries matching `filter` with a digest over the export
    pub fn catalog_snapshot(
        &self,
        credentials: &Credentials,
        filter: &CatalogFilter,
    ) -> PipelineResult<CatalogSnapshot> {
        let entries = self.catalog(credentials, filter)?;
        Ok(CatalogSnapshot::new(entries)?)
    }

    /// Hand out the active key material. Recorded as a security incident:
    /// the key must be rotated afterwards.
    pub fn emergency_key_dump(&self, credentials: &Credentials) -> PipelineResult<KeyDump> {
        self.authorize(credentials, Stage::KeyDump)?;
        let key = self.read_key();
        let dump = KeyDump {
            key_id: key.key_id(),
            encoded: key.encode(),
        };
        self.audit.record(
            AuditEvent::critical(
                Component::Keys,
                "key.emergency_dump",
                "Active key material exported; rotate keys immediately",
            )
            .identity(&credentials.identity)
            .data(json!({
                "security_incident": true,
                "rotation_required": true,
                "key_id": dump.key_id,
            })),
        );
        Ok(dump)
    }

    /// Scan the persisted audit log for incidents
    pub fn scan_audit_log(&self) -> Vec<ids::Incident> {
        ids::analyze_log(&self.settings.resolved_audit_log())
    }

    /// Read the persisted audit log back
    pub fn read_audit_log(&self) -> Result<audit::AuditLog, audit::AuditReadError> {
        audit::read_log(&self.settings.resolved_audit_log())
    }

    /// generate → ingest → process → archive → replicate → audit
    pub fn run_pipeline(
        &self,
        credentials: &Credentials,
        product_id: &str,
        corrupted: bool,
    ) -> PipelineResult<RunReport> {
        self.audit.record(
            AuditEvent::info(Component::Orchestrator, "orchestrator.run_start", "Pipeline run started")
                .product(product_id)
                .identity(&credentials.identity),
        );

        let result = self.run_stages(credentials, product_id, corrupted);
        let event = match &result {
            Ok(report) => AuditEvent::info(
                Component::Orchestrator,
                "orchestrator.run_complete",
                match report.audit {
                    Some(outcome) => format!("Pipeline run complete: {}", outcome),
                    None => "Pipeline run complete: not audited".to_string(),
                },
            ),
            Err(e) => AuditEvent::error(
                Component::Orchestrator,
                "orchestrator.run_failed",
                format!("Pipeline run failed: {}", e),
            )
            .data(json!({ "category": e.category() })),
        };
        self.audit
            .record(event.product(product_id).identity(&credentials.identity));
        result
    }

    fn run_stages(
        &self,
        credentials: &Credentials,
        product_id: &str,
        corrupted: bool,
    ) -> PipelineResult<RunReport> {
        let role = self.access.authenticate(credentials)?;
        let may_audit = self
            .access
            .policy()
            .decide(role, Stage::Audit.guard())
            .is_granted();

        self.generate(credentials, product_id, corrupted)?;
        let ingested = self.ingest(credentials, product_id)?;
        let processed = self.process(credentials, product_id)?;
        let archived = self.archive(credentials, product_id)?;
        self.replicate(credentials, product_id)?;

        let audit = if may_audit {
            let outcome = self.audit(credentials, product_id, ReferenceKind::Catalog)?;
            if outcome == AuditOutcome::Unrecoverable {
                return Err(PipelineError::Unrecoverable(product_id.to_string()));
            }
            Some(outcome)
        } else {
            self.audit.record(
                AuditEvent::info(
                    Component::Orchestrator,
                    "orchestrator.audit_skipped",
                    format!("Final audit skipped: role {} lacks {}", role, Stage::Audit.guard()),
                )
                .product(product_id)
                .identity(&credentials.identity),
            );
            None
        };

        Ok(RunReport {
            product_id: product_id.to_string(),
            original_hash: ingested.fingerprint,
            processed_hash: processed.fingerprint,
            vault_hash: archived.fingerprint,
            audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use tempfile::TempDir;

    fn orchestrator() -> (TempDir, Orchestrator, Arc<MemoryAuditSink>) {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let settings = PipelineSettings::with_base_dir(dir.path().join("data"));
        let orch = Orchestrator::open(settings, audit.clone()).unwrap();
        (dir, orch, audit)
    }

    #[test]
    fn test_guard_table() {
        assert_eq!(Stage::Generate.guard(), Action::Write);
        assert_eq!(Stage::Ingest.guard(), Action::Process);
        assert_eq!(Stage::Process.guard(), Action::Process);
        assert_eq!(Stage::Archive.guard(), Action::Write);
        assert_eq!(Stage::Replicate.guard(), Action::Write);
        assert_eq!(Stage::Audit.guard(), Action::ManageKeys);
        assert_eq!(Stage::Retrieve.guard(), Action::Read);
        assert_eq!(Stage::RotateKeys.guard(), Action::ManageKeys);
        assert_eq!(Stage::Catalog.guard(), Action::Read);
    }

    #[test]
    fn test_open_creates_zones_and_key() {
        let (_dir, orch, audit) = orchestrator();
        for zone in Zone::ALL {
            assert!(orch.store().zone_dir(zone).is_dir());
        }
        assert!(orch.key_store().path().is_file());
        assert!(audit.contains_kind("key.generated"));
    }

    #[test]
    fn test_out_of_order_stage_is_prerequisite_error() {
        let (_dir, orch, _audit) = orchestrator();
        let bob = Credentials::identity("bob_analyst");
        orch.generate(&bob, "P1", false).unwrap();

        let err = orch.process(&bob, "P1").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Prerequisite {
                stage: Stage::Process,
                found: Some(ProductStatus::Generated),
                ..
            }
        ));
    }

    #[test]
    fn test_denied_before_prerequisites() {
        let (_dir, orch, audit) = orchestrator();
        let charlie = Credentials::identity("charlie_user");
        let err = orch.process(&charlie, "nonexistent").unwrap_err();
        assert!(matches!(err, PipelineError::Access(_)));
        assert!(!audit.contains_kind("orchestrator.prerequisite_failed"));
    }

    #[test]
    fn test_invalid_product_id() {
        let (_dir, orch, _audit) = orchestrator();
        let bob = Credentials::identity("bob_analyst");
        let err = orch.generate(&bob, "../escape", false).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Validation);
    }

    #[test]
    fn test_emergency_key_dump_is_flagged() {
        let (_dir, orch, audit) = orchestrator();
        let admin = Credentials::identity("emanuele_admin");
        let dump = orch.emergency_key_dump(&admin).unwrap();
        assert_eq!(dump.key_id, orch.active_key_id());

        let event = &audit.of_kind("key.emergency_dump")[0];
        let data = event.data.as_ref().unwrap();
        assert_eq!(data["security_incident"], true);
        assert_eq!(data["rotation_required"], true);
        assert_eq!(data["key_id"], dump.key_id.as_str());
        // the material goes to the caller only, never into the log
        assert!(!event.to_line().unwrap().contains(&dump.encoded));

        let bob = Credentials::identity("bob_analyst");
        assert!(orch.emergency_key_dump(&bob).is_err());
    }
}
