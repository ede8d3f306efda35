//! Authentication and authorization with audit trail
//!
//! Wraps the pure [`AccessPolicy`] and records every attempt. Internally each
//! failure path gets its own event kind (`auth.unknown_identity`,
//! `auth.bad_secret`, ...); externally every failure is the same
//! [`AccessError::Denied`], so callers cannot tell which identities exist.
//! A broken policy table is the one exception: it surfaces as
//! [`AccessError::Misconfigured`], because it needs an operator, not a retry.

use serde_json::json;
use std::fmt;
use std::sync::Arc;

use custody_policy::{AccessPolicy, Action, AuthOutcome, Decision, Misconfiguration, Role};

use crate::audit::{AuditEvent, AuditSink, Component};

/// Caller-supplied identity, optionally with a password
#[derive(Clone)]
pub struct Credentials {
    pub identity: String,
    pub secret: Option<String>,
}

impl Credentials {
    /// Identity only; resolved against the directory without a secret
    pub fn identity(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: None,
        }
    }

    pub fn with_secret(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: Some(secret.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Externally visible access failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("access denied")]
    Denied,

    #[error("access policy misconfigured: {0}")]
    Misconfigured(String),
}

/// Audited access checks over a compiled policy
pub struct AccessController {
    policy: AccessPolicy,
    audit: Arc<dyn AuditSink>,
}

impl AccessController {
    /// Wrap `policy`, reporting any defects found while compiling it
    pub fn new(policy: AccessPolicy, audit: Arc<dyn AuditSink>) -> Self {
        for issue in policy.load_issues() {
            audit.record(AuditEvent::error(
                Component::Access,
                "policy.misconfigured",
                format!("Policy table defect: {}", issue),
            ));
        }
        Self { policy, audit }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Resolve credentials to a role
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Role, AccessError> {
        let identity = credentials.identity.as_str();
        let outcome = match credentials.secret.as_deref() {
            Some(secret) => self.policy.authenticate_with_secret(identity, secret),
            None => self.policy.authenticate(identity),
        };

        let event = match &outcome {
            AuthOutcome::Authenticated(role) => AuditEvent::info(
                Component::Auth,
                "auth.success",
                format!("User '{}' authenticated as {}", identity, role),
            )
            .data(json!({ "role": role })),
            AuthOutcome::Misconfigured(issue) => self.misconfigured_event(issue),
            failure => AuditEvent::warning(
                Component::Auth,
                &format!("auth.{}", failure.label()),
                format!("Authentication failed for '{}'", identity),
            ),
        };
        self.audit.record(event.identity(identity));

        match outcome {
            AuthOutcome::Authenticated(role) => Ok(role),
            AuthOutcome::Misconfigured(issue) => Err(AccessError::Misconfigured(issue.to_string())),
            _ => Err(AccessError::Denied),
        }
    }

    /// Authenticate, then check that the role grants `action`
    pub fn authorize(&self, credentials: &Credentials, action: Action) -> Result<Role, AccessError> {
        let identity = credentials.identity.as_str();
        let role = self.authenticate(credentials)?;

        match self.policy.decide(role, action) {
            Decision::Granted { role, action } => {
                self.audit.record(
                    AuditEvent::info(
                        Component::Access,
                        "access.granted",
                        format!("'{}' ({}) granted {}", identity, role, action),
                    )
                    .identity(identity)
                    .data(json!({ "role": role, "action": action })),
                );
                Ok(role)
            }
            Decision::Denied { role, action } => {
                self.audit.record(
                    AuditEvent::warning(
                        Component::Access,
                        "access.denied",
                        format!("'{}' ({}) lacks permission '{}'", identity, role, action),
                    )
                    .identity(identity)
                    .data(json!({ "role": role, "action": action })),
                );
                Err(AccessError::Denied)
            }
            Decision::Misconfigured(issue) => {
                self.audit
                    .record(self.misconfigured_event(&issue).identity(identity));
                Err(AccessError::Misconfigured(issue.to_string()))
            }
            Decision::Unauthenticated(_) => Err(AccessError::Denied),
        }
    }

    /// Boolean form of [`AccessController::authorize`]
    pub fn is_authorized(&self, credentials: &Credentials, action: Action) -> bool {
        self.authorize(credentials, action).is_ok()
    }

    fn misconfigured_event(&self, issue: &Misconfiguration) -> AuditEvent {
        AuditEvent::error(
            Component::Access,
            "policy.misconfigured",
            format!("Denied by misconfigured policy: {}", issue),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use custody_policy::{hash_secret, PolicyConfig};

    fn controller(config: &PolicyConfig) -> (AccessController, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let controller = AccessController::new(AccessPolicy::from_config(config), audit.clone());
        (controller, audit)
    }

    #[test]
    fn test_builtin_roles() {
        let (access, audit) = controller(&PolicyConfig::builtin());

        let bob = Credentials::identity("bob_analyst");
        assert_eq!(access.authorize(&bob, Action::Process), Ok(Role::Analyst));
        assert_eq!(
            access.authorize(&Credentials::identity("charlie_user"), Action::Process),
            Err(AccessError::Denied)
        );
        assert!(!access.is_authorized(&Credentials::identity("emanuele_admin"), Action::Process));
        assert!(access.is_authorized(&Credentials::identity("emanuele_admin"), Action::ManageKeys));

        assert_eq!(audit.of_kind("access.granted").len(), 2);
        assert_eq!(audit.of_kind("access.denied").len(), 2);
    }

    #[test]
    fn test_failures_are_indistinguishable_externally() {
        let (access, audit) = controller(&PolicyConfig::builtin());

        let unknown = access.authorize(&Credentials::identity("mallory"), Action::Read);
        let disabled = access.authorize(&Credentials::identity("eve_hacker"), Action::Read);
        assert_eq!(unknown, Err(AccessError::Denied));
        assert_eq!(unknown, disabled);

        assert!(audit.contains_kind("auth.unknown_identity"));
        assert!(audit.contains_kind("auth.disabled"));
        let events = audit.of_kind("auth.disabled");
        assert_eq!(events[0].identity.as_deref(), Some("eve_hacker"));
    }

    #[test]
    fn test_password_paths() {
        let mut config = PolicyConfig::builtin();
        config.users.get_mut("bob_analyst").unwrap().password_hash =
            Some(hash_secret("correct horse").unwrap());
        let (access, audit) = controller(&config);

        assert!(access
            .authenticate(&Credentials::with_secret("bob_analyst", "correct horse"))
            .is_ok());
        let wrong = access.authenticate(&Credentials::with_secret("bob_analyst", "guess"));
        let ghost = access.authenticate(&Credentials::with_secret("ghost", "guess"));
        let no_hash = access.authenticate(&Credentials::with_secret("charlie_user", "guess"));
        assert_eq!(wrong, Err(AccessError::Denied));
        assert_eq!(wrong, ghost);
        assert_eq!(wrong, no_hash);

        assert!(audit.contains_kind("auth.bad_secret"));
        assert!(audit.contains_kind("auth.unknown_identity"));
        assert!(audit.contains_kind("auth.no_credential"));
        for event in audit.events() {
            let line = event.to_line().unwrap();
            assert!(!line.contains("correct horse"));
            assert!(!line.contains("guess"));
        }
    }

    #[test]
    fn test_missing_role_definition_is_misconfiguration() {
        let mut config = PolicyConfig::builtin();
        config.roles.remove("analyst");
        let (access, audit) = controller(&config);

        let result = access.authorize(&Credentials::identity("bob_analyst"), Action::Read);
        assert!(matches!(result, Err(AccessError::Misconfigured(_))));
        assert!(audit.contains_kind("policy.misconfigured"));
        assert!(!audit.contains_kind("access.denied"));
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials::with_secret("bob_analyst", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
