//! Structured authentication and authorization outcomes.
//!
//! Outcomes carry full internal detail for the audit trail. Callers facing the
//! outside world collapse every failure into one opaque denial.

use serde::{Deserialize, Serialize};

use crate::{Action, Role};

/// A policy table defect. Always denies, but is reported separately from a
/// legitimate authorization denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Misconfiguration {
    /// Identity is bound to a role name that does not exist.
    UnknownRole { identity: String, role: String },
    /// Role exists but has no entry in the permission table.
    MissingRoleDefinition { role: Role },
    /// Role definition lists action names that do not exist.
    MalformedRoleDefinition { role: Role, invalid: Vec<String> },
    /// Permission table entry whose key is not a known role.
    OrphanRoleDefinition { name: String },
}

impl std::fmt::Display for Misconfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Misconfiguration::UnknownRole { identity, role } => {
                write!(f, "identity '{}' bound to unknown role '{}'", identity, role)
            }
            Misconfiguration::MissingRoleDefinition { role } => {
                write!(f, "role '{}' has no permission table entry", role)
            }
            Misconfiguration::MalformedRoleDefinition { role, invalid } => {
                write!(
                    f,
                    "role '{}' lists invalid permissions: {}",
                    role,
                    invalid.join(", ")
                )
            }
            Misconfiguration::OrphanRoleDefinition { name } => {
                write!(f, "permission table entry '{}' is not a known role", name)
            }
        }
    }
}

/// Result of resolving an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(Role),
    /// Identity not present in the directory.
    UnknownIdentity,
    /// Identity present but mapped to the disabled sentinel.
    Disabled,
    /// Secret did not match the stored hash.
    BadSecret,
    /// Secret supplied but the identity has no stored credential.
    NoCredential,
    /// Identity has a stored credential but no secret was supplied.
    SecretRequired,
    Misconfigured(Misconfiguration),
}

impl AuthOutcome {
    pub fn role(&self) -> Option<Role> {
        match self {
            AuthOutcome::Authenticated(role) => Some(*role),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthOutcome::Authenticated(_))
    }

    /// Internal audit label. Distinct per failure path.
    pub fn label(&self) -> &'static str {
        match self {
            AuthOutcome::Authenticated(_) => "success",
            AuthOutcome::UnknownIdentity => "unknown_identity",
            AuthOutcome::Disabled => "disabled",
            AuthOutcome::BadSecret => "bad_secret",
            AuthOutcome::NoCredential => "no_credential",
            AuthOutcome::SecretRequired => "secret_required",
            AuthOutcome::Misconfigured(_) => "misconfigured",
        }
    }
}

/// Result of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Granted { role: Role, action: Action },
    /// Authenticated, but the role lacks the permission.
    Denied { role: Role, action: Action },
    /// Identity could not be resolved to a usable role.
    Unauthenticated(AuthOutcome),
    Misconfigured(Misconfiguration),
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted { .. })
    }
}
