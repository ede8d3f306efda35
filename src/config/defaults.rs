//! Built-in defaults (layer 1) and the typed settings they populate

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stages::archive::{ArchiveSettings, StaleCleartextPolicy};
use crate::store::{LifecycleStore, ZoneLayout};

/// Typed pipeline settings, produced from the merged config layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    /// Root of the zone tree (default: "simulation_data")
    pub base_dir: PathBuf,

    /// Zone directory names under `base_dir`
    pub zones: ZoneLayout,

    /// Active key file; relative paths resolve against `base_dir`
    pub key_path: PathBuf,

    /// JSONL audit log; relative paths resolve against `base_dir`
    pub audit_log: PathBuf,

    /// Remove staging cleartext after archiving (default: true)
    pub purge_staging: bool,

    /// Reporting of a failed purge (default: incident)
    pub stale_cleartext_policy: StaleCleartextPolicy,

    /// Label attached to archived records (default: "CONFIDENTIAL")
    pub confidentiality_label: String,

    /// Lock wait limit in milliseconds (default: 5000)
    pub lock_timeout_ms: u64,

    /// Access policy TOML; the built-in table when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_path: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("simulation_data"),
            zones: ZoneLayout::default(),
            key_path: PathBuf::from("secret.key"),
            audit_log: PathBuf::from("audit.log"),
            purge_staging: true,
            stale_cleartext_policy: StaleCleartextPolicy::Incident,
            confidentiality_label: "CONFIDENTIAL".to_string(),
            lock_timeout_ms: 5000,
            policy_path: None,
        }
    }
}

impl PipelineSettings {
    /// Defaults rooted at `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn resolved_key_path(&self) -> PathBuf {
        self.resolve(&self.key_path)
    }

    pub fn resolved_audit_log(&self) -> PathBuf {
        self.resolve(&self.audit_log)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn store(&self) -> LifecycleStore {
        LifecycleStore::new(&self.base_dir, self.zones.clone())
    }

    pub fn archive_settings(&self) -> ArchiveSettings {
        ArchiveSettings {
            purge_staging: self.purge_staging,
            confidentiality_label: self.confidentiality_label.clone(),
            stale_cleartext_policy: self.stale_cleartext_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let defaults = PipelineSettings::default();
        assert_eq!(defaults.base_dir, PathBuf::from("simulation_data"));
        assert_eq!(defaults.zones.vault, "secure_archive");
        assert!(defaults.purge_staging);
        assert_eq!(defaults.stale_cleartext_policy, StaleCleartextPolicy::Incident);
        assert_eq!(defaults.lock_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_to_value() {
        let value = PipelineSettings::default().to_value();
        assert_eq!(value["zones"]["replica"], "backup_storage");
        assert_eq!(value["stale_cleartext_policy"], "incident");
        assert!(value.get("policy_path").is_none());
    }

    #[test]
    fn test_relative_paths_resolve_under_base() {
        let settings = PipelineSettings::with_base_dir("/srv/eo");
        assert_eq!(settings.resolved_key_path(), PathBuf::from("/srv/eo/secret.key"));

        let absolute = PipelineSettings {
            audit_log: PathBuf::from("/var/log/custody.log"),
            ..settings
        };
        assert_eq!(
            absolute.resolved_audit_log(),
            PathBuf::from("/var/log/custody.log")
        );
    }
}
