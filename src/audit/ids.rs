//! Intrusion detection over the audit stream
//!
//! A lightweight log hunter: scans recorded events for known threat
//! signatures and reports incidents. Detection is per identity for the
//! brute-force rule, so interleaved traffic from other operators does not
//! reset a counter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::{read_log, AuditEvent, AuditReadError};

/// Consecutive failures per identity that trigger a brute-force incident
pub const BRUTE_FORCE_THRESHOLD: u32 = 3;

/// Event kinds counted as authentication/authorization failures
const FAILURE_KINDS: &[&str] = &[
    "auth.unknown_identity",
    "auth.bad_secret",
    "auth.no_credential",
    "auth.secret_required",
    "auth.disabled",
    "access.denied",
];

/// Incident severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub severity: IncidentSeverity,
    #[serde(rename = "type")]
    pub incident_type: String,
    pub details: String,
    /// Event that triggered the incident, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl Incident {
    fn new(severity: IncidentSeverity, incident_type: &str, details: String) -> Self {
        Self {
            severity,
            incident_type: incident_type.to_string(),
            details,
            event_id: None,
        }
    }

    fn from_event(mut self, event: &AuditEvent) -> Self {
        self.event_id = Some(event.id.clone());
        self
    }
}

/// Scan a sequence of events
pub fn analyze(events: &[AuditEvent]) -> Vec<Incident> {
    let mut incidents = Vec::new();
    let mut consecutive: HashMap<&str, u32> = HashMap::new();

    for event in events {
        let who = event.identity.as_deref().unwrap_or("<anonymous>");

        if event.kind == "auth.disabled" {
            incidents.push(
                Incident::new(
                    IncidentSeverity::High,
                    "Insider Threat",
                    format!("Activity from disabled account '{}': {}", who, event.message),
                )
                .from_event(event),
            );
        }

        if FAILURE_KINDS.contains(&event.kind.as_str()) {
            let count = consecutive.entry(who).or_insert(0);
            *count += 1;
            if *count >= BRUTE_FORCE_THRESHOLD {
                incidents.push(
                    Incident::new(
                        IncidentSeverity::Critical,
                        "Brute Force Attack",
                        format!(
                            "{} consecutive authentication failures for '{}'",
                            count, who
                        ),
                    )
                    .from_event(event),
                );
                *count = 0;
            }
        } else if event.kind == "access.granted" {
            consecutive.insert(who, 0);
        }

        if event.kind == "access.denied" {
            incidents.push(
                Incident::new(
                    IncidentSeverity::Medium,
                    "Privilege Escalation Attempt",
                    format!("'{}' attempted an action without permission: {}", who, event.message),
                )
                .from_event(event),
            );
        }

        if event.kind == "resilience.corruption_detected" {
            incidents.push(
                Incident::new(
                    IncidentSeverity::Critical,
                    "Data Integrity Breach",
                    format!(
                        "Vault corruption confirmed for {}",
                        event.product_id.as_deref().unwrap_or("<unknown product>")
                    ),
                )
                .from_event(event),
            );
        }

        if event.kind == "key.emergency_dump" {
            incidents.push(
                Incident::new(
                    IncidentSeverity::Critical,
                    "Key Exposure",
                    "Active key material was dumped; rotate immediately".to_string(),
                )
                .from_event(event),
            );
        }
    }

    incidents
}

/// Scan a JSONL audit log on disk
pub fn analyze_log(path: &Path) -> Vec<Incident> {
    if !path.exists() {
        return vec![Incident::new(
            IncidentSeverity::Low,
            "System Check",
            "Audit log not found. System may be fresh.".to_string(),
        )];
    }

    let log = match read_log(path) {
        Ok(log) => log,
        Err(AuditReadError::Io(e)) => {
            return vec![Incident::new(
                IncidentSeverity::Critical,
                "IDS Failure",
                format!("Could not read audit log: {}", e),
            )]
        }
    };

    let mut incidents = analyze(&log.events);
    if log.malformed_lines > 0 {
        incidents.push(Incident::new(
            IncidentSeverity::Medium,
            "Log Integrity",
            format!("{} audit lines could not be parsed", log.malformed_lines),
        ));
    }
    incidents
}
