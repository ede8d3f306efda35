//! Policy table configuration.
//!
//! The table is loaded once at startup (built-in or TOML) and compiled into an
//! immutable [`crate::AccessPolicy`]. Raw strings are kept here so that a
//! malformed entry survives parsing and can be reported as a misconfiguration
//! instead of failing the whole load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::PolicyError;

/// A role definition as written in the policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleDefinition {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Permitted action names, in table order.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A directory entry for one identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserEntry {
    /// Role name (resolved against [`crate::Role`]).
    pub role: String,

    /// Argon2 PHC string. Identities without one cannot use secret-based login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

/// Static role/permission table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Role name -> definition.
    #[serde(default)]
    pub roles: BTreeMap<String, RoleDefinition>,

    /// Identity -> directory entry.
    #[serde(default)]
    pub users: BTreeMap<String, UserEntry>,
}

impl PolicyConfig {
    /// The mission directory shipped with the pipeline.
    pub fn builtin() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(
            "admin".to_string(),
            RoleDefinition {
                description: "Full system control".to_string(),
                permissions: vec![
                    "read".to_string(),
                    "write".to_string(),
                    "delete".to_string(),
                    "manage_keys".to_string(),
                ],
            },
        );
        roles.insert(
            "analyst".to_string(),
            RoleDefinition {
                description: "Data processing and quality control".to_string(),
                permissions: vec![
                    "read".to_string(),
                    "write".to_string(),
                    "process".to_string(),
                ],
            },
        );
        roles.insert(
            "viewer".to_string(),
            RoleDefinition {
                description: "End user consuming products".to_string(),
                permissions: vec!["read".to_string()],
            },
        );

        let mut users = BTreeMap::new();
        for (name, role) in [
            ("emanuele_admin", "admin"),
            ("bob_analyst", "analyst"),
            ("charlie_user", "viewer"),
            ("eve_hacker", "disabled"),
        ] {
            users.insert(
                name.to_string(),
                UserEntry {
                    role: role.to_string(),
                    password_hash: None,
                },
            );
        }

        Self { roles, users }
    }

    /// Parse a TOML policy document.
    pub fn from_toml(contents: &str) -> Result<Self, PolicyError> {
        toml::from_str(contents).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    /// Load a TOML policy file.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| PolicyError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }
}
