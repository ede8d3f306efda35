//! Top-level error type
//!
//! Stage errors keep their own enums; [`PipelineError`] wraps them and sorts
//! every failure into an [`ErrorCategory`] that decides logging severity and
//! the CLI exit code.

use serde::Serialize;
use std::io;

use custody_policy::PolicyError;

use crate::access::AccessError;
use crate::config::ConfigError;
use crate::integrity::KeyError;
use crate::orchestrator::Stage;
use crate::stages::archive::{ArchiveError, CanonicalizationError};
use crate::stages::ingest::IngestError;
use crate::stages::process::ProcessError;
use crate::stages::resilience::ResilienceError;
use crate::stages::rotation::RotationError;
use crate::state::ProductStatus;
use crate::store::{LockError, StoreError};

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing or malformed input; resubmit
    Validation,
    /// Fingerprint mismatch; never retried silently
    Integrity,
    /// Encryption or decryption failure
    Crypto,
    /// Configuration or policy table defect
    Config,
    /// Corruption with no surviving replica
    Unrecoverable,
    /// Caller not permitted
    Authorization,
    /// Product not in the state the operation requires
    Prerequisite,
    /// Disk, lock or other environment failure
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::Crypto => "crypto",
            ErrorCategory::Config => "config",
            ErrorCategory::Unrecoverable => "unrecoverable",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::Prerequisite => "prerequisite",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

/// Errors surfaced by the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("{stage} not possible for {product_id}: status is {}, requires {expected}",
        .found.map(|s| s.as_str()).unwrap_or("absent"))]
    Prerequisite {
        stage: Stage,
        product_id: String,
        found: Option<ProductStatus>,
        expected: String,
    },

    #[error("ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("processing failed: {0}")]
    Process(#[from] ProcessError),

    #[error("archiving failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("resilience failure: {0}")]
    Resilience(#[from] ResilienceError),

    #[error("key rotation failed: {0}")]
    Rotation(#[from] RotationError),

    #[error("no surviving good copy of {0}; manual recovery required")]
    Unrecoverable(String),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Catalog(#[from] CanonicalizationError),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        use ErrorCategory::*;

        match self {
            PipelineError::Config(_) | PipelineError::Policy(_) => Config,
            PipelineError::Access(AccessError::Denied) => Authorization,
            PipelineError::Access(AccessError::Misconfigured(_)) => Config,
            PipelineError::Prerequisite { .. } => Prerequisite,

            PipelineError::Ingest(e) => match e {
                IngestError::Missing { .. } | IngestError::SchemaInvalid { .. } => Validation,
                IngestError::Status(_) => Prerequisite,
                IngestError::Store(e) => store_category(e),
            },
            PipelineError::Process(e) => match e {
                ProcessError::IntegrityMismatch { .. } | ProcessError::NoBaseline(_) => Integrity,
                ProcessError::Missing(_) | ProcessError::QcFailed { .. } => Validation,
                ProcessError::Status(_) => Prerequisite,
                ProcessError::Store(e) => store_category(e),
            },
            PipelineError::Archive(e) => match e {
                ArchiveError::Missing { .. } => Validation,
                ArchiveError::IntegrityMismatch { .. } => Integrity,
                ArchiveError::EncryptionFailed { .. } | ArchiveError::Crypto { .. } => Crypto,
                ArchiveError::Status(_) => Prerequisite,
                ArchiveError::Store(e) => store_category(e),
            },
            PipelineError::Resilience(e) => match e {
                ResilienceError::NothingToProtect(_) => Prerequisite,
                ResilienceError::VaultMismatch { .. }
                | ResilienceError::NoReference(_)
                | ResilienceError::HealVerificationFailed(_) => Integrity,
                ResilienceError::Store(e) => store_category(e),
            },
            PipelineError::Rotation(e) => match e {
                RotationError::Reseal { .. } => Crypto,
                RotationError::Key(KeyError::Corrupt(_)) => Crypto,
                RotationError::Commit { .. } | RotationError::Key(_) => Infrastructure,
                RotationError::Store(e) => store_category(e),
            },
            PipelineError::Unrecoverable(_) => Unrecoverable,
            PipelineError::Key(KeyError::Corrupt(_)) => Crypto,
            PipelineError::Key(_) => Infrastructure,
            PipelineError::Store(e) => store_category(e),
            PipelineError::Lock(_) | PipelineError::Io(_) | PipelineError::Catalog(_) => {
                Infrastructure
            }
        }
    }

    /// CLI process exit code
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Config => 1,
            ErrorCategory::Validation => 10,
            ErrorCategory::Authorization => 13,
            ErrorCategory::Prerequisite => 40,
            ErrorCategory::Integrity => 70,
            ErrorCategory::Crypto => 71,
            ErrorCategory::Infrastructure => 74,
            ErrorCategory::Unrecoverable => 75,
        }
    }
}

fn store_category(e: &StoreError) -> ErrorCategory {
    match e {
        StoreError::InvalidProductId(_) => ErrorCategory::Validation,
        _ => ErrorCategory::Infrastructure,
    }
}

/// Result type for orchestrated operations
pub type PipelineResult<T> = Result<T, PipelineError>;
