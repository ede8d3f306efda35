//! Lifecycle store
//!
//! Four named zones under one base directory, each holding
//! `<product_id>.<data_ext>` + `<product_id>.json` pairs:
//!
//! | zone     | directory             | data ext |
//! |----------|-----------------------|----------|
//! | landing  | `ingest_landing_zone` | `raw`    |
//! | staging  | `processing_staging`  | `raw`    |
//! | vault    | `secure_archive`      | `enc`    |
//! | replica  | `backup_storage`      | `enc`    |
//!
//! Every write goes through a temporary sibling and a rename, so readers
//! never observe a truncated artifact.

mod lock;
mod metadata;

pub use lock::{FileLock, LockError, LockMode, ProductGuard, ProductLocks};
pub use metadata::{MetadataRecord, SchemaError, MANDATORY_FIELDS};

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::integrity::Fingerprint;

/// Metadata file extension (all zones)
pub const META_EXT: &str = "json";

/// Cleartext data extension (landing, staging)
pub const PLAIN_EXT: &str = "raw";

/// Ciphertext data extension (vault, replica)
pub const SEALED_EXT: &str = "enc";

/// Storage zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Landing,
    Staging,
    Vault,
    Replica,
}

impl Zone {
    pub const ALL: [Zone; 4] = [Zone::Landing, Zone::Staging, Zone::Vault, Zone::Replica];

    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Landing => "landing",
            Zone::Staging => "staging",
            Zone::Vault => "vault",
            Zone::Replica => "replica",
        }
    }

    /// Data extension; distinct for encrypted zones
    pub fn data_ext(&self) -> &'static str {
        match self {
            Zone::Landing | Zone::Staging => PLAIN_EXT,
            Zone::Vault | Zone::Replica => SEALED_EXT,
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, Zone::Vault | Zone::Replica)
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory names of the four zones, relative to the base directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneLayout {
    pub landing: String,
    pub staging: String,
    pub vault: String,
    pub replica: String,
}

impl Default for ZoneLayout {
    fn default() -> Self {
        Self {
            landing: "ingest_landing_zone".to_string(),
            staging: "processing_staging".to_string(),
            vault: "secure_archive".to_string(),
            replica: "backup_storage".to_string(),
        }
    }
}

impl ZoneLayout {
    pub fn dir_name(&self, zone: Zone) -> &str {
        match zone {
            Zone::Landing => &self.landing,
            Zone::Staging => &self.staging,
            Zone::Vault => &self.vault,
            Zone::Replica => &self.replica,
        }
    }
}

/// Errors for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("metadata JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid product id: {0}")]
    InvalidProductId(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the underlying cause is a missing file
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Validate a product identifier.
///
/// Identifiers name files inside zone directories, so they MUST be
/// filesystem-safe: `^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$`, no `..`.
pub fn validate_product_id(id: &str) -> StoreResult<()> {
    if id.is_empty() || id.len() > 128 {
        return Err(StoreError::InvalidProductId(format!(
            "identifier must be 1-128 characters, got {}",
            id.len()
        )));
    }

    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => {
            return Err(StoreError::InvalidProductId(
                "identifier must start with alphanumeric character".to_string(),
            ))
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.' {
            return Err(StoreError::InvalidProductId(format!(
                "identifier contains invalid character: {:?}",
                c
            )));
        }
    }

    if id.contains("..") {
        return Err(StoreError::InvalidProductId(
            "identifier must not contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Write bytes atomically: temp sibling, fsync, rename over target
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(
        ".{}.tmp-{}",
        file_name,
        ulid::Ulid::new().to_string().to_lowercase()
    ));

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        io::Write::write_all(&mut file, bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// File-tree store over the four zones
#[derive(Debug, Clone)]
pub struct LifecycleStore {
    base_dir: PathBuf,
    layout: ZoneLayout,
}

impl LifecycleStore {
    pub fn new(base_dir: impl Into<PathBuf>, layout: ZoneLayout) -> Self {
        Self {
            base_dir: base_dir.into(),
            layout,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create all zone directories
    pub fn ensure_zones(&self) -> StoreResult<()> {
        for zone in Zone::ALL {
            let dir = self.zone_dir(zone);
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn zone_dir(&self, zone: Zone) -> PathBuf {
        self.base_dir.join(self.layout.dir_name(zone))
    }

    pub fn data_path(&self, zone: Zone, product_id: &str) -> PathBuf {
        self.zone_dir(zone)
            .join(format!("{}.{}", product_id, zone.data_ext()))
    }

    pub fn meta_path(&self, zone: Zone, product_id: &str) -> PathBuf {
        self.zone_dir(zone).join(format!("{}.{}", product_id, META_EXT))
    }

    /// Zone-relative logical location, as recorded in metadata
    pub fn logical_path(&self, zone: Zone, product_id: &str) -> String {
        format!(
            "{}/{}.{}",
            self.layout.dir_name(zone),
            product_id,
            zone.data_ext()
        )
    }

    pub fn has_data(&self, zone: Zone, product_id: &str) -> bool {
        self.data_path(zone, product_id).is_file()
    }

    pub fn has_meta(&self, zone: Zone, product_id: &str) -> bool {
        self.meta_path(zone, product_id).is_file()
    }

    pub fn read_data(&self, zone: Zone, product_id: &str) -> StoreResult<Vec<u8>> {
        let path = self.data_path(zone, product_id);
        fs::read(&path).map_err(|e| StoreError::io(&path, e))
    }

    pub fn write_data(&self, zone: Zone, product_id: &str, bytes: &[u8]) -> StoreResult<PathBuf> {
        let dir = self.zone_dir(zone);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = self.data_path(zone, product_id);
        atomic_write(&path, bytes).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    pub fn read_meta_raw(&self, zone: Zone, product_id: &str) -> StoreResult<String> {
        let path = self.meta_path(zone, product_id);
        fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))
    }

    pub fn read_meta(&self, zone: Zone, product_id: &str) -> StoreResult<MetadataRecord> {
        let path = self.meta_path(zone, product_id);
        let json = self.read_meta_raw(zone, product_id)?;
        MetadataRecord::from_json(&json).map_err(|source| StoreError::Json { path, source })
    }

    pub fn write_meta(
        &self,
        zone: Zone,
        product_id: &str,
        record: &MetadataRecord,
    ) -> StoreResult<PathBuf> {
        let dir = self.zone_dir(zone);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = self.meta_path(zone, product_id);
        let json = record.to_json().map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        atomic_write(&path, json.as_bytes()).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    /// Fingerprint of a zone's data artifact; `None` when absent
    pub fn fingerprint(&self, zone: Zone, product_id: &str) -> StoreResult<Option<Fingerprint>> {
        let path = self.data_path(zone, product_id);
        Fingerprint::of_file_if_present(&path).map_err(|e| StoreError::io(&path, e))
    }

    /// Remove a file if present. Returns whether something was removed.
    pub fn remove_data(&self, zone: Zone, product_id: &str) -> StoreResult<bool> {
        remove_if_present(&self.data_path(zone, product_id))
    }

    pub fn remove_meta(&self, zone: Zone, product_id: &str) -> StoreResult<bool> {
        remove_if_present(&self.meta_path(zone, product_id))
    }

    /// Product ids with a data artifact in `zone`, sorted
    pub fn list_products(&self, zone: Zone) -> StoreResult<Vec<String>> {
        let dir = self.zone_dir(zone);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let suffix = format!(".{}", zone.data_ext());
        let mut ids = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry.map_err(|e| {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk error"));
                StoreError::io(&dir, source)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(&suffix) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// The zone holding the product's authoritative record and that record.
    ///
    /// Later zones win: vault, then staging, then landing. The replica is
    /// never authoritative.
    pub fn current_record(&self, product_id: &str) -> StoreResult<Option<(Zone, MetadataRecord)>> {
        for zone in [Zone::Vault, Zone::Staging, Zone::Landing] {
            if self.has_meta(zone, product_id) {
                return Ok(Some((zone, self.read_meta(zone, product_id)?)));
            }
        }
        Ok(None)
    }
}

fn remove_if_present(path: &Path) -> StoreResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
