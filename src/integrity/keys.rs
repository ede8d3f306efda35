//! Key material persistence
//!
//! Exactly one active key lives at the configured path, outside the product
//! tree, readable only by the owner. First run generates it; nothing blocks
//! on manual setup.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::cipher::{CryptoError, VaultKey};

/// Errors from key storage
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("stored key is unusable: {0}")]
    Corrupt(#[from] CryptoError),
}

/// Result type for key storage
pub type KeyResult<T> = Result<T, KeyError>;

/// Whether `load_or_create` found or generated the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Loaded,
    Generated,
}

/// Single-secret key store at a fixed path
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> KeyError {
        KeyError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Load the active key, if one is persisted
    pub fn load(&self) -> KeyResult<Option<VaultKey>> {
        match fs::read_to_string(&self.path) {
            Ok(encoded) => Ok(Some(VaultKey::from_encoded(&encoded)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Return the active key, generating and persisting one on first use
    pub fn load_or_create(&self) -> KeyResult<(VaultKey, KeyOrigin)> {
        if let Some(key) = self.load()? {
            return Ok((key, KeyOrigin::Loaded));
        }
        let key = VaultKey::generate();
        self.persist(&key)?;
        tracing::info!(path = %self.path.display(), key_id = %key.key_id(), "generated new vault key");
        Ok((key, KeyOrigin::Generated))
    }

    /// Atomically replace the active key (write-then-rename, owner-only mode)
    pub fn persist(&self, key: &VaultKey) -> KeyResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
            }
        }

        let temp_path = self.path.with_extension(format!(
            "pending-{}",
            ulid::Ulid::new().to_string().to_lowercase()
        ));
        let write = || -> io::Result<()> {
            let mut file = restricted_create(&temp_path)?;
            file.write_all(key.encode().as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&temp_path);
            return Err(self.io_err(e));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restricted_create(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn restricted_create(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_run_generates() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path().join("keys").join("secret.key"));

        assert!(store.load().unwrap().is_none());
        let (key, origin) = store.load_or_create().unwrap();
        assert_eq!(origin, KeyOrigin::Generated);

        let (again, origin) = store.load_or_create().unwrap();
        assert_eq!(origin, KeyOrigin::Loaded);
        assert_eq!(again.key_id(), key.key_id());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path().join("secret.key"));
        store.load_or_create().unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_persist_replaces() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path().join("secret.key"));
        let (old, _) = store.load_or_create().unwrap();

        let new = VaultKey::generate();
        store.persist(&new).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.key_id(), new.key_id());
        assert_ne!(loaded.key_id(), old.key_id());

        // no pending files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_corrupt_key_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.key");
        fs::write(&path, "not base64 at all!").unwrap();
        let store = KeyStore::new(&path);
        assert!(matches!(store.load(), Err(KeyError::Corrupt(_))));
    }
}
