//! Product lifecycle state machine
//!
//! GENERATED → INGESTED → PROCESSED → ARCHIVED, with ARCHIVED ⇄ CORRUPTED
//! while the resilience stage demotes and restores a vault artifact.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductStatus {
    /// Landed by the generator, not yet validated
    Generated,
    /// Validated and fingerprinted in staging
    Ingested,
    /// Transformed and re-fingerprinted in staging
    Processed,
    /// Encrypted at rest in the vault
    Archived,
    /// Vault artifact failed its integrity audit
    Corrupted,
}

/// Errors for status transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ProductStatus,
        to: ProductStatus,
    },
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Generated => "GENERATED",
            ProductStatus::Ingested => "INGESTED",
            ProductStatus::Processed => "PROCESSED",
            ProductStatus::Archived => "ARCHIVED",
            ProductStatus::Corrupted => "CORRUPTED",
        }
    }

    /// Check if transition from this status to target is valid
    pub fn can_transition_to(&self, target: ProductStatus) -> bool {
        match (self, target) {
            // Forward pipeline
            (ProductStatus::Generated, ProductStatus::Ingested) => true,
            (ProductStatus::Ingested, ProductStatus::Processed) => true,
            (ProductStatus::Processed, ProductStatus::Archived) => true,

            // Resilience demotion and restoration
            (ProductStatus::Archived, ProductStatus::Corrupted) => true,
            (ProductStatus::Corrupted, ProductStatus::Archived) => true,

            _ => false,
        }
    }

    /// Transition, returning the new status or an error
    pub fn transition(self, target: ProductStatus) -> Result<ProductStatus, StatusError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(StatusError::InvalidTransition {
                from: self,
                to: target,
            })
        }
    }

    /// Whether a vault artifact exists at this status
    pub fn is_vaulted(&self) -> bool {
        matches!(self, ProductStatus::Archived | ProductStatus::Corrupted)
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProductStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GENERATED" => Ok(ProductStatus::Generated),
            "INGESTED" => Ok(ProductStatus::Ingested),
            "PROCESSED" => Ok(ProductStatus::Processed),
            "ARCHIVED" => Ok(ProductStatus::Archived),
            "CORRUPTED" => Ok(ProductStatus::Corrupted),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}
