//! EO Custody - chain-of-custody integrity engine for an Earth-observation
//! data pipeline
//!
//! Products move landing → staging → vault. Each stage re-verifies the
//! fingerprint the previous stage recorded before touching content; archived
//! artifacts are sealed with authenticated encryption, replicated, and
//! healed from the replica when an audit finds a mismatch. Every stage is
//! guarded by a static role policy (see the `custody-policy` crate).

pub mod access;
pub mod audit;
pub mod config;
pub mod error;
pub mod generator;
pub mod integrity;
pub mod orchestrator;
pub mod stages;
pub mod state;
pub mod store;

pub use access::{AccessController, AccessError, Credentials};
pub use audit::{AuditEvent, AuditSink, MemoryAuditSink, Severity};
pub use config::{EffectiveConfig, PipelineSettings};
pub use error::{ErrorCategory, PipelineError, PipelineResult};
pub use integrity::{Fingerprint, VaultKey};
pub use orchestrator::{Orchestrator, ReferenceKind, RunReport, Stage, StatusReport};
pub use stages::resilience::{AuditOutcome, ReferenceHashProvider};
pub use state::ProductStatus;
pub use store::{LifecycleStore, MetadataRecord, Zone};

pub use custody_policy::{Action, Role};
