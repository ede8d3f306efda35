//! Effective configuration with full provenance
//!
//! The effective config captures the merged layers, where each came from,
//! and the typed [`PipelineSettings`] derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::defaults::PipelineSettings;
use super::merge::merge_layers;

/// Schema version for effective_config
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "eo-custody/effective_config@1";

/// Host config location relative to `$HOME`
pub const HOST_CONFIG_RELATIVE: &str = ".config/eo-custody/config.toml";

/// Project config file name, looked up in the working directory
pub const PROJECT_CONFIG_FILE: &str = "eo-custody.toml";

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Project,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Effective configuration with full provenance
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub schema_version: u32,

    pub schema_id: String,

    pub created_at: DateTime<Utc>,

    /// The merged configuration object, secrets redacted
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,

    /// Redacted key paths
    pub redactions: Vec<String>,

    #[serde(skip)]
    pub settings: PipelineSettings,
}

/// Keys that contain secrets and should be redacted
const SECRET_KEYS: &[&str] = &["password", "token", "secret", "private_key", "credential"];

/// Upper bound for `lock_timeout_ms`
const MAX_LOCK_TIMEOUT_MS: u64 = 600_000;

impl EffectiveConfig {
    /// Build effective config from layers
    pub fn build(
        host_config_path: Option<&Path>,
        project_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![PipelineSettings::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        for (origin, path) in [
            (ConfigOrigin::Host, host_config_path),
            (ConfigOrigin::Project, project_config_path),
        ] {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            let (value, digest) = Self::load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let mut merged = merge_layers(layers);

        let settings: PipelineSettings = serde_json::from_value(merged.clone())
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Self::validate(&settings)?;

        let redactions = Self::redact_secrets(&mut merged);

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config: merged,
            sources,
            redactions,
            settings,
        })
    }

    /// Build from the standard locations: `$HOME` host file, then the
    /// project file in `cwd`
    pub fn discover(
        explicit: Option<&Path>,
        cwd: &Path,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let host = default_host_config_path();
        let project = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.join(PROJECT_CONFIG_FILE));
        if explicit.is_some() && !project.exists() {
            return Err(ConfigError::IoError(format!(
                "config file not found: {}",
                project.display()
            )));
        }
        Self::build(host.as_deref(), Some(&project), cli_overrides)
    }

    /// Load and parse a TOML file, returning the value and digest
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;
        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

        Ok((Self::toml_to_json(toml_value), digest))
    }

    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Self::toml_to_json).collect())
            }
            toml::Value::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect(),
            ),
        }
    }

    /// Redact secrets in the config, returning list of redacted paths
    fn redact_secrets(value: &mut Value) -> Vec<String> {
        let mut redactions = Vec::new();
        Self::redact_recursive(value, String::new(), &mut redactions);
        redactions
    }

    fn redact_recursive(value: &mut Value, path: String, redactions: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let current_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", path, key)
                    };

                    let is_secret = SECRET_KEYS.iter().any(|s| key_lower.contains(s));
                    if is_secret && !val.is_object() && !val.is_array() && !val.is_null() {
                        *val = Value::String("[REDACTED]".to_string());
                        redactions.push(current_path);
                    } else {
                        Self::redact_recursive(val, current_path, redactions);
                    }
                }
            }
            Value::Array(arr) => {
                for (i, val) in arr.iter_mut().enumerate() {
                    Self::redact_recursive(val, format!("{}[{}]", path, i), redactions);
                }
            }
            _ => {}
        }
    }

    fn validate(settings: &PipelineSettings) -> Result<(), ConfigError> {
        if settings.lock_timeout_ms == 0 || settings.lock_timeout_ms > MAX_LOCK_TIMEOUT_MS {
            return Err(ConfigError::ValidationError(format!(
                "lock_timeout_ms must be in (0, {}]",
                MAX_LOCK_TIMEOUT_MS
            )));
        }

        if settings.confidentiality_label.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "confidentiality_label must not be empty".to_string(),
            ));
        }

        let zones = &settings.zones;
        let names = [&zones.landing, &zones.staging, &zones.vault, &zones.replica];
        for name in names {
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(ConfigError::ValidationError(format!(
                    "zone directory name {:?} must be a single path component",
                    name
                )));
            }
        }
        for (i, a) in names.iter().enumerate() {
            if names[i + 1..].contains(a) {
                return Err(ConfigError::ValidationError(format!(
                    "zone directory {:?} is used by more than one zone",
                    a
                )));
            }
        }

        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Get a config value by path (dot-separated)
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }
}

/// `$HOME/.config/eo-custody/config.toml`, if `$HOME` is set
pub fn default_host_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(HOST_CONFIG_RELATIVE))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::archive::StaleCleartextPolicy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_build_with_defaults_only() {
        let config = EffectiveConfig::build(None, None, None).unwrap();
        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert_eq!(config.settings, PipelineSettings::default());
        assert_eq!(config.get_str("zones.vault"), Some("secure_archive"));
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_layers_and_provenance() {
        let mut host = NamedTempFile::new().unwrap();
        writeln!(host, "confidentiality_label = \"RESTRICTED\"").unwrap();
        writeln!(host, "[zones]").unwrap();
        writeln!(host, "replica = \"dr_site\"").unwrap();
        let mut project = NamedTempFile::new().unwrap();
        writeln!(project, "stale_cleartext_policy = \"warn\"").unwrap();

        let cli = serde_json::json!({ "confidentiality_label": "SECRET-EO" });
        let config =
            EffectiveConfig::build(Some(host.path()), Some(project.path()), Some(cli)).unwrap();

        let settings = &config.settings;
        assert_eq!(settings.confidentiality_label, "SECRET-EO");
        assert_eq!(settings.zones.replica, "dr_site");
        assert_eq!(settings.zones.vault, "secure_archive");
        assert_eq!(settings.stale_cleartext_policy, StaleCleartextPolicy::Warn);

        let origins: Vec<_> = config.sources.iter().map(|s| s.origin.clone()).collect();
        assert_eq!(
            origins,
            vec![
                ConfigOrigin::Builtin,
                ConfigOrigin::Host,
                ConfigOrigin::Project,
                ConfigOrigin::Cli
            ]
        );
        assert_eq!(config.sources[1].digest.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let config =
            EffectiveConfig::build(Some(Path::new("/nonexistent/eo.toml")), None, None).unwrap();
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn test_validation_lock_timeout() {
        let cli = serde_json::json!({ "lock_timeout_ms": 0 });
        let err = EffectiveConfig::build(None, None, Some(cli)).unwrap_err();
        assert!(err.to_string().contains("lock_timeout_ms"));
    }

    #[test]
    fn test_validation_duplicate_zone() {
        let cli = serde_json::json!({ "zones": { "replica": "secure_archive" } });
        let err = EffectiveConfig::build(None, None, Some(cli)).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let cli = serde_json::json!({ "purge_stagng": false });
        assert!(EffectiveConfig::build(None, None, Some(cli)).is_err());
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "base_dir = ").unwrap();
        assert!(matches!(
            EffectiveConfig::build(Some(file.path()), None, None),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_secret_redaction() {
        let mut value = serde_json::json!({
            "auth": { "password": "hunter2", "user": "bob" },
            "key_path": "secret.key"
        });
        let redactions = EffectiveConfig::redact_secrets(&mut value);
        assert_eq!(value["auth"]["password"], "[REDACTED]");
        assert_eq!(value["auth"]["user"], "bob");
        assert_eq!(value["key_path"], "secret.key");
        assert_eq!(redactions, vec!["auth.password".to_string()]);
    }
}
