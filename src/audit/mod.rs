//! Security audit event stream
//!
//! One structured JSON object per line for every security-relevant event:
//! authentication attempts, authorization decisions, stage start/success/
//! failure, corruption detection and heal outcomes. Components receive an
//! [`AuditSink`] rather than reaching for global state.
//!
//! Consumers (SIEM, operator console, [`ids`]) treat the stream as append-only.

pub mod ids;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Schema identifier stamped on every event line
pub const EVENT_SCHEMA_ID: &str = "eo-custody/audit_event@1";

/// Severity of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Emitting component tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Auth,
    Access,
    Generator,
    Ingest,
    Process,
    Archive,
    Resilience,
    Keys,
    Orchestrator,
    Ids,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Auth => "auth",
            Component::Access => "access",
            Component::Generator => "generator",
            Component::Ingest => "ingest",
            Component::Process => "process",
            Component::Archive => "archive",
            Component::Resilience => "resilience",
            Component::Keys => "keys",
            Component::Orchestrator => "orchestrator",
            Component::Ids => "ids",
        }
    }
}

/// A single audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Schema identifier
    pub schema_id: String,

    /// Event identifier (ULID, sortable)
    pub id: String,

    /// When the event was recorded
    pub ts: DateTime<Utc>,

    pub component: Component,

    pub severity: Severity,

    /// Machine-readable event kind (e.g. `ingest.success`)
    pub kind: String,

    /// Human-readable message
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,

    /// Identity attempted or acting. Never a secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Additional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        component: Component,
        severity: Severity,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            schema_id: EVENT_SCHEMA_ID.to_string(),
            id: ulid::Ulid::new().to_string().to_lowercase(),
            ts: Utc::now(),
            component,
            severity,
            kind: kind.into(),
            message: message.into(),
            product_id: None,
            identity: None,
            data: None,
        }
    }

    pub fn info(component: Component, kind: &str, message: impl Into<String>) -> Self {
        Self::new(component, Severity::Info, kind, message)
    }

    pub fn warning(component: Component, kind: &str, message: impl Into<String>) -> Self {
        Self::new(component, Severity::Warning, kind, message)
    }

    pub fn error(component: Component, kind: &str, message: impl Into<String>) -> Self {
        Self::new(component, Severity::Error, kind, message)
    }

    pub fn critical(component: Component, kind: &str, message: impl Into<String>) -> Self {
        Self::new(component, Severity::Critical, kind, message)
    }

    pub fn product(mut self, product_id: &str) -> Self {
        self.product_id = Some(product_id.to_string());
        self
    }

    pub fn identity(mut self, identity: &str) -> Self {
        self.identity = Some(identity.to_string());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Append-only destination for audit events.
///
/// Recording never fails from the caller's point of view: a sink that cannot
/// persist an event reports the problem through `tracing` and carries on.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    fn record(&self, event: AuditEvent) {
        (**self).record(event)
    }
}

/// JSONL file sink. Opens the log in append mode.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) {
        let line = match event.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(kind = %event.kind, "audit event serialization failed: {}", e);
                return;
            }
        };
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
            tracing::error!(path = %self.path.display(), "audit log write failed: {}", e);
        }
    }
}

/// In-memory sink, for inspection and tests
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events with a given kind
    pub fn of_kind(&self, kind: &str) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }

    pub fn contains_kind(&self, kind: &str) -> bool {
        self.events().iter().any(|e| e.kind == kind)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Mirrors audit events into the diagnostic `tracing` output
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let component = event.component.as_str();
        let product = event.product_id.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Info => {
                tracing::info!(component, kind = %event.kind, product, "{}", event.message)
            }
            Severity::Warning => {
                tracing::warn!(component, kind = %event.kind, product, "{}", event.message)
            }
            Severity::Error | Severity::Critical => {
                tracing::error!(component, kind = %event.kind, product, severity = ?event.severity, "{}", event.message)
            }
        }
    }
}

/// Tee to several sinks
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutSink {
    fn record(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

/// Errors reading an audit log back
#[derive(Debug, thiserror::Error)]
pub enum AuditReadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed audit log: well-formed events plus the count of unparseable lines
#[derive(Debug, Default)]
pub struct AuditLog {
    pub events: Vec<AuditEvent>,
    pub malformed_lines: usize,
}

/// Read a JSONL audit log
pub fn read_log(path: &Path) -> Result<AuditLog, AuditReadError> {
    let reader = BufReader::new(File::open(path)?);
    let mut log = AuditLog::default();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => log.events.push(event),
            Err(_) => log.malformed_lines += 1,
        }
    }
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_event_builder() {
        let event = AuditEvent::warning(Component::Ingest, "ingest.missing", "files missing")
            .product("P1")
            .identity("bob_analyst");
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(event.product_id.as_deref(), Some("P1"));
        assert_eq!(event.identity.as_deref(), Some("bob_analyst"));
        assert_eq!(event.schema_id, EVENT_SCHEMA_ID);
        assert_eq!(event.id.len(), 26);
    }

    #[test]
    fn test_line_shape() {
        let event = AuditEvent::info(Component::Archive, "archive.success", "stored");
        let line = event.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"component\":\"archive\""));
        assert!(line.contains("\"severity\":\"INFO\""));
        assert!(!line.contains("product_id"));
    }

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("audit.log");

        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(AuditEvent::info(Component::Auth, "auth.success", "one"));
        sink.record(AuditEvent::info(Component::Auth, "auth.success", "two"));
        drop(sink);

        // reopening must not truncate
        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(AuditEvent::info(Component::Auth, "auth.success", "three"));

        let log = read_log(&path).unwrap();
        assert_eq!(log.events.len(), 3);
        assert_eq!(log.events[2].message, "three");
        assert_eq!(log.malformed_lines, 0);
    }

    #[test]
    fn test_read_log_counts_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.log");
        let good = AuditEvent::info(Component::Ids, "ids.scan", "ok").to_line().unwrap();
        fs::write(&path, format!("{}\nnot json\n\n", good)).unwrap();

        let log = read_log(&path).unwrap();
        assert_eq!(log.events.len(), 1);
        assert_eq!(log.malformed_lines, 1);
    }

    #[test]
    fn test_fanout_reaches_all() {
        let a = Arc::new(MemoryAuditSink::new());
        let b = Arc::new(MemoryAuditSink::new());
        let fanout = FanoutSink::new(vec![a.clone() as Arc<dyn AuditSink>, b.clone()]);
        fanout.record(AuditEvent::info(Component::Keys, "key.loaded", "k"));
        assert!(a.contains_kind("key.loaded"));
        assert!(b.contains_kind("key.loaded"));
    }
}
