//! Credential storage
//!
//! Secrets such as proxy passwords are kept apart from the configuration and
//! the session log, addressed by key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::error::TunnelError;

/// Credential store errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Credential file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Credential '{0}' is not valid base64")]
    InvalidEncoding(String),
}

impl From<CredentialError> for TunnelError {
    fn from(e: CredentialError) -> Self {
        TunnelError::Authentication(e.to_string())
    }
}

/// Key to opaque bytes
pub trait CredentialStore: Send + Sync {
    fn save(&self, key: &str, secret: &[u8]) -> Result<(), CredentialError>;

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CredentialError>;

    /// Returns `true` if the key existed
    fn delete(&self, key: &str) -> Result<bool, CredentialError>;
}

/// Credentials kept in memory only
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&self, key: &str, secret: &[u8]) -> Result<(), CredentialError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), secret.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn delete(&self, key: &str) -> Result<bool, CredentialError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }
}

impl fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("MemoryCredentialStore")
            .field("entries", &len)
            .finish()
    }
}

/// Credentials in a JSON file of base64 values.
///
/// The file is rewritten atomically on every change and restricted to the
/// owner on unix.
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, CredentialError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| CredentialError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), CredentialError> {
        let json = serde_json::to_vec_pretty(map).map_err(|e| CredentialError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        veil_stats::write_atomic_private(&self.path, &json)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn save(&self, key: &str, secret: &[u8]) -> Result<(), CredentialError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        map.insert(key.to_string(), BASE64.encode(secret));
        self.write_map(&map)?;
        info!("Stored credential '{}'", key);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.read_map()?.get(key) {
            Some(encoded) => BASE64
                .decode(encoded)
                .map(Some)
                .map_err(|_| CredentialError::InvalidEncoding(key.to_string())),
            None => {
                debug!("Credential '{}' not found", key);
                Ok(None)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<bool, CredentialError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        if map.remove(key).is_none() {
            return Ok(false);
        }
        self.write_map(&map)?;
        info!("Deleted credential '{}'", key);
        Ok(true)
    }
}

impl fmt::Debug for FileCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCredentialStore")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.load("proxy").unwrap(), None);

        store.save("proxy", b"hunter2").unwrap();
        assert_eq!(store.load("proxy").unwrap(), Some(b"hunter2".to_vec()));

        assert!(store.delete("proxy").unwrap());
        assert!(!store.delete("proxy").unwrap());
        assert_eq!(format!("{:?}", store), "MemoryCredentialStore { entries: 0 }");
    }

    #[test]
    fn test_file_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets").join("credentials.json");

        let store = FileCredentialStore::new(&path);
        assert_eq!(store.load("proxy").unwrap(), None);
        store.save("proxy", &[0, 159, 146, 150]).unwrap();
        store.save("other", b"x").unwrap();

        let reopened = FileCredentialStore::new(&path);
        assert_eq!(reopened.load("proxy").unwrap(), Some(vec![0, 159, 146, 150]));

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains(&BASE64.encode([0u8, 159, 146, 150])));
        assert!(!path.with_file_name("credentials.json.tmp").exists());

        assert!(reopened.delete("proxy").unwrap());
        assert_eq!(store.load("proxy").unwrap(), None);
        assert_eq!(store.load("other").unwrap(), Some(b"x".to_vec()));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        let store = FileCredentialStore::new(&path);
        store.save("k", b"v").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // Rewriting over an existing file keeps it owner-only
        store.save("other", b"w").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        assert!(store.delete("k").unwrap());
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "not json").unwrap();

        let store = FileCredentialStore::new(&path);
        assert!(matches!(
            store.load("k"),
            Err(CredentialError::Corrupt { .. })
        ));
        let error: TunnelError = store.load("k").unwrap_err().into();
        assert_eq!(error.kind(), "authenticationError");
    }
}
