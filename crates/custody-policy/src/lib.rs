//! Deny-by-default role policy for the custody pipeline.
//!
//! Identities resolve to a [`Role`] through a static directory; roles resolve
//! to a fixed set of [`Action`]s. The table is compiled once from a
//! [`PolicyConfig`] and never mutated afterwards. Every check re-resolves
//! identity -> role -> permissions, so checks are stateless and idempotent.

mod config;
mod credentials;
mod outcome;
mod role;

pub use config::{PolicyConfig, RoleDefinition, UserEntry};
pub use credentials::{hash_secret, verify_secret};
pub use outcome::{AuthOutcome, Decision, Misconfiguration};
pub use role::{Action, Role};

use std::collections::{BTreeMap, BTreeSet};

/// Errors while loading policy material.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy I/O error: {0}")]
    Io(String),

    #[error("policy parse error: {0}")]
    Parse(String),

    #[error("credential error: {0}")]
    Credential(String),
}

#[derive(Debug, Clone)]
enum Grant {
    Allowed(BTreeSet<Action>),
    Malformed(Vec<String>),
}

#[derive(Debug, Clone)]
struct Binding {
    role: Result<Role, String>,
    password_hash: Option<String>,
}

/// Compiled, immutable access policy.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    grants: BTreeMap<Role, Grant>,
    users: BTreeMap<String, Binding>,
    load_issues: Vec<Misconfiguration>,
}

impl AccessPolicy {
    /// Compile a policy table. Defects are retained, not rejected: they deny
    /// at check time and are listed by [`AccessPolicy::load_issues`].
    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut grants = BTreeMap::new();
        let mut load_issues = Vec::new();

        for (name, definition) in &config.roles {
            let role = match name.parse::<Role>() {
                Ok(Role::Disabled) | Err(_) => {
                    load_issues.push(Misconfiguration::OrphanRoleDefinition { name: name.clone() });
                    continue;
                }
                Ok(role) => role,
            };

            let mut allowed = BTreeSet::new();
            let mut invalid = Vec::new();
            for permission in &definition.permissions {
                match permission.parse::<Action>() {
                    Ok(action) => {
                        allowed.insert(action);
                    }
                    Err(_) => invalid.push(permission.clone()),
                }
            }

            let grant = if invalid.is_empty() {
                Grant::Allowed(allowed)
            } else {
                load_issues.push(Misconfiguration::MalformedRoleDefinition {
                    role,
                    invalid: invalid.clone(),
                });
                Grant::Malformed(invalid)
            };
            grants.insert(role, grant);
        }

        let users = config
            .users
            .iter()
            .map(|(identity, entry)| {
                let role = entry.role.parse::<Role>().map_err(|_| entry.role.clone());
                if let Err(ref raw) = role {
                    load_issues.push(Misconfiguration::UnknownRole {
                        identity: identity.clone(),
                        role: raw.clone(),
                    });
                }
                (
                    identity.clone(),
                    Binding {
                        role,
                        password_hash: entry.password_hash.clone(),
                    },
                )
            })
            .collect();

        Self {
            grants,
            users,
            load_issues,
        }
    }

    /// Policy compiled from [`PolicyConfig::builtin`].
    pub fn builtin() -> Self {
        Self::from_config(&PolicyConfig::builtin())
    }

    /// Defects detected while compiling the table.
    pub fn load_issues(&self) -> &[Misconfiguration] {
        &self.load_issues
    }

    /// Known identities, sorted.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(String::as_str)
    }

    /// Resolve an identity to a role without a secret. Identities with a
    /// stored password hash never resolve this way.
    pub fn authenticate(&self, identity: &str) -> AuthOutcome {
        match self.users.get(identity) {
            None => AuthOutcome::UnknownIdentity,
            Some(binding) if binding.password_hash.is_some() => AuthOutcome::SecretRequired,
            Some(binding) => Self::resolve_binding(identity, binding),
        }
    }

    /// Resolve an identity and verify its secret against the stored hash.
    pub fn authenticate_with_secret(&self, identity: &str, secret: &str) -> AuthOutcome {
        let binding = match self.users.get(identity) {
            Some(binding) => binding,
            None => {
                credentials::verify_against_decoy(secret);
                return AuthOutcome::UnknownIdentity;
            }
        };

        let stored = match binding.password_hash.as_deref() {
            Some(stored) => stored,
            None => {
                credentials::verify_against_decoy(secret);
                return AuthOutcome::NoCredential;
            }
        };

        if !verify_secret(secret, stored) {
            return AuthOutcome::BadSecret;
        }

        Self::resolve_binding(identity, binding)
    }

    fn resolve_binding(identity: &str, binding: &Binding) -> AuthOutcome {
        match &binding.role {
            Ok(Role::Disabled) => AuthOutcome::Disabled,
            Ok(role) => AuthOutcome::Authenticated(*role),
            Err(raw) => AuthOutcome::Misconfigured(Misconfiguration::UnknownRole {
                identity: identity.to_string(),
                role: raw.clone(),
            }),
        }
    }

    /// Decide whether a resolved role may perform `action`.
    pub fn decide(&self, role: Role, action: Action) -> Decision {
        if role == Role::Disabled {
            return Decision::Unauthenticated(AuthOutcome::Disabled);
        }
        match self.grants.get(&role) {
            None => Decision::Misconfigured(Misconfiguration::MissingRoleDefinition { role }),
            Some(Grant::Malformed(invalid)) => {
                Decision::Misconfigured(Misconfiguration::MalformedRoleDefinition {
                    role,
                    invalid: invalid.clone(),
                })
            }
            Some(Grant::Allowed(actions)) if actions.contains(&action) => {
                Decision::Granted { role, action }
            }
            Some(Grant::Allowed(_)) => Decision::Denied { role, action },
        }
    }

    /// Resolve identity and decide in one step.
    pub fn authorize(&self, identity: &str, action: Action) -> Decision {
        self.decide_outcome(self.authenticate(identity), action)
    }

    /// Decide from an already computed authentication outcome.
    pub fn decide_outcome(&self, outcome: AuthOutcome, action: Action) -> Decision {
        match outcome {
            AuthOutcome::Authenticated(role) => self.decide(role, action),
            AuthOutcome::Misconfigured(m) => Decision::Misconfigured(m),
            other => Decision::Unauthenticated(other),
        }
    }

    /// Permissions of a role, if it has a well-formed definition.
    pub fn permissions(&self, role: Role) -> Option<&BTreeSet<Action>> {
        match self.grants.get(&role) {
            Some(Grant::Allowed(actions)) => Some(actions),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_authenticate() {
        let policy = AccessPolicy::builtin();
        assert_eq!(
            policy.authenticate("bob_analyst"),
            AuthOutcome::Authenticated(Role::Analyst)
        );
        assert_eq!(policy.authenticate("eve_hacker"), AuthOutcome::Disabled);
        assert_eq!(policy.authenticate("mallory"), AuthOutcome::UnknownIdentity);
        assert!(policy.load_issues().is_empty());
    }

    #[test]
    fn test_builtin_authorize() {
        let policy = AccessPolicy::builtin();
        assert!(policy.authorize("bob_analyst", Action::Process).is_granted());
        assert_eq!(
            policy.authorize("charlie_user", Action::Process),
            Decision::Denied {
                role: Role::Viewer,
                action: Action::Process
            }
        );
        // admin manages keys but does not run science processing
        assert!(policy.authorize("emanuele_admin", Action::ManageKeys).is_granted());
        assert!(!policy.authorize("emanuele_admin", Action::Process).is_granted());
    }

    #[test]
    fn test_unknown_identity_denied_everything() {
        let policy = AccessPolicy::builtin();
        for action in Action::ALL {
            assert_eq!(
                policy.authorize("nobody", action),
                Decision::Unauthenticated(AuthOutcome::UnknownIdentity)
            );
        }
    }

    #[test]
    fn test_disabled_short_circuits() {
        let policy = AccessPolicy::builtin();
        for action in Action::ALL {
            assert_eq!(
                policy.authorize("eve_hacker", action),
                Decision::Unauthenticated(AuthOutcome::Disabled)
            );
        }
    }

    #[test]
    fn test_missing_role_definition_is_misconfiguration() {
        let mut config = PolicyConfig::builtin();
        config.roles.remove("viewer");
        let policy = AccessPolicy::from_config(&config);

        assert_eq!(
            policy.authorize("charlie_user", Action::Read),
            Decision::Misconfigured(Misconfiguration::MissingRoleDefinition { role: Role::Viewer })
        );
    }

    #[test]
    fn test_malformed_role_definition_fails_closed() {
        let mut config = PolicyConfig::builtin();
        config
            .roles
            .get_mut("analyst")
            .unwrap()
            .permissions
            .push("launch_rockets".to_string());
        let policy = AccessPolicy::from_config(&config);

        // valid permissions on the same role are not honoured either
        let decision = policy.authorize("bob_analyst", Action::Read);
        assert!(matches!(
            decision,
            Decision::Misconfigured(Misconfiguration::MalformedRoleDefinition { .. })
        ));
        assert_eq!(policy.load_issues().len(), 1);
        assert!(policy.permissions(Role::Analyst).is_none());
    }

    #[test]
    fn test_unknown_role_name_binding() {
        let mut config = PolicyConfig::builtin();
        config.users.insert(
            "zed".to_string(),
            UserEntry {
                role: "superuser".to_string(),
                password_hash: None,
            },
        );
        let policy = AccessPolicy::from_config(&config);
        assert!(matches!(
            policy.authenticate("zed"),
            AuthOutcome::Misconfigured(Misconfiguration::UnknownRole { .. })
        ));
        assert!(matches!(
            policy.authorize("zed", Action::Read),
            Decision::Misconfigured(_)
        ));
    }

    #[test]
    fn test_orphan_role_definition_reported() {
        let mut config = PolicyConfig::builtin();
        config
            .roles
            .insert("superuser".to_string(), RoleDefinition::default());
        let policy = AccessPolicy::from_config(&config);
        assert_eq!(
            policy.load_issues(),
            &[Misconfiguration::OrphanRoleDefinition {
                name: "superuser".to_string()
            }]
        );
    }

    #[test]
    fn test_secret_paths_are_distinct_internally() {
        let mut config = PolicyConfig::builtin();
        config.users.get_mut("bob_analyst").unwrap().password_hash =
            Some(hash_secret("calibrate").unwrap());
        let policy = AccessPolicy::from_config(&config);

        assert_eq!(
            policy.authenticate_with_secret("bob_analyst", "calibrate"),
            AuthOutcome::Authenticated(Role::Analyst)
        );
        assert_eq!(
            policy.authenticate_with_secret("bob_analyst", "guess"),
            AuthOutcome::BadSecret
        );
        assert_eq!(
            policy.authenticate_with_secret("ghost", "guess"),
            AuthOutcome::UnknownIdentity
        );
        assert_eq!(
            policy.authenticate_with_secret("charlie_user", "guess"),
            AuthOutcome::NoCredential
        );
    }

    #[test]
    fn test_protected_identity_needs_secret() {
        let mut config = PolicyConfig::builtin();
        config.users.get_mut("bob_analyst").unwrap().password_hash =
            Some(hash_secret("calibrate").unwrap());
        let policy = AccessPolicy::from_config(&config);

        assert_eq!(policy.authenticate("bob_analyst"), AuthOutcome::SecretRequired);
        assert_eq!(
            policy.authorize("bob_analyst", Action::Read),
            Decision::Unauthenticated(AuthOutcome::SecretRequired)
        );
        // identities without a hash are unaffected
        assert_eq!(
            policy.authenticate("charlie_user"),
            AuthOutcome::Authenticated(Role::Viewer)
        );
    }

    #[test]
    fn test_checks_are_idempotent() {
        let policy = AccessPolicy::builtin();
        let first = policy.authorize("bob_analyst", Action::Write);
        let second = policy.authorize("bob_analyst", Action::Write);
        assert_eq!(first, second);
    }
}
