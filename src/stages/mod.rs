//! Pipeline stages
//!
//! Each stage is a function over a [`StageContext`]: it fails locally with a
//! typed error and never leaves persisted state half-updated. Authorization
//! and prerequisite checks belong to the orchestrator, not to the stages.

pub mod archive;
pub mod ingest;
pub mod process;
pub mod resilience;
pub mod rotation;
pub mod transform;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::audit::{AuditEvent, AuditSink};
use crate::integrity::Fingerprint;
use crate::store::{LifecycleStore, Zone};

/// Shared collaborators for stage functions
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub store: &'a LifecycleStore,
    pub audit: &'a dyn AuditSink,
}

impl<'a> StageContext<'a> {
    pub fn new(store: &'a LifecycleStore, audit: &'a dyn AuditSink) -> Self {
        Self { store, audit }
    }

    pub(crate) fn emit(&self, event: AuditEvent) {
        self.audit.record(event);
    }
}

/// Reference to the artifact a stage produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub product_id: String,
    pub zone: Zone,
    pub path: PathBuf,
    /// Fingerprint of the artifact bytes as written
    pub fingerprint: Fingerprint,
}
