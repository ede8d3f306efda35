//! Role and action vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operator role.
///
/// `Disabled` is the sentinel for accounts that exist in the directory but
/// hold no privileges. It never reaches a permission lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Analyst,
    Viewer,
    Disabled,
}

impl Role {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Analyst => "analyst",
            Role::Viewer => "viewer",
            Role::Disabled => "disabled",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "analyst" => Ok(Role::Analyst),
            // "user" is the legacy directory name for read-only consumers
            "viewer" | "user" => Ok(Role::Viewer),
            "disabled" | "none" => Ok(Role::Disabled),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Guarded action. Ordering follows the permission table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Process,
    Delete,
    ManageKeys,
}

impl Action {
    /// All actions in table order.
    pub const ALL: [Action; 5] = [
        Action::Read,
        Action::Write,
        Action::Process,
        Action::Delete,
        Action::ManageKeys,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Process => "process",
            Action::Delete => "delete",
            Action::ManageKeys => "manage_keys",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action: {s}"))
    }
}
