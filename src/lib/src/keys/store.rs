//! Persistence for the signing identity record

use super::PublicKey;
use crate::error::PSError;
use crate::secure_file;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const RECORD_VERSION: u32 = 1;

/// Lifecycle of one key in the identity history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// The active signing key
    Current,
    /// Replaced by rotation; public half kept for old manifests
    Superseded,
    /// Private half destroyed by an authorized deletion
    Destroyed,
    /// The keystore no longer holds the private half (e.g. ephemeral keystore restarted)
    Lost,
}

/// One key the identity has used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub public_key: PublicKey,
    /// Provider-specific identifier used to reload the private half
    pub keystore_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
    pub status: KeyStatus,
}

/// Everything persisted about the signing identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub version: u32,
    pub current: Option<KeyRecord>,
    /// Retired keys, oldest first
    pub history: Vec<KeyRecord>,
    pub last_rotation: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Default for IdentityRecord {
    fn default() -> Self {
        Self {
            version: RECORD_VERSION,
            current: None,
            history: Vec::new(),
            last_rotation: None,
            deleted_at: None,
        }
    }
}

impl IdentityRecord {
    /// Find a key by id among the current and retired keys.
    pub fn find(&self, key_id: &str) -> Option<&KeyRecord> {
        self.current
            .iter()
            .chain(self.history.iter())
            .find(|record| record.key_id == key_id)
    }

    /// Move the current key into history with the given status.
    pub fn retire_current(&mut self, status: KeyStatus, at: DateTime<Utc>) -> Option<KeyRecord> {
        let mut record = self.current.take()?;
        record.status = status;
        record.retired_at = Some(at);
        self.history.push(record.clone());
        Some(record)
    }
}

/// Storage backend for the identity record
pub trait IdentityStore: Send + Sync {
    /// Load the record, `None` if nothing was stored yet
    fn load(&self) -> Result<Option<IdentityRecord>, PSError>;

    /// Replace the stored record
    fn save(&self, record: &IdentityRecord) -> Result<(), PSError>;
}

/// JSON file with owner-only permissions
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<IdentityRecord>, PSError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = secure_file::read_secure(&self.path)?;
        let record: IdentityRecord = serde_json::from_slice(&bytes).map_err(|e| {
            PSError::SerializationError(format!(
                "identity record '{}' is corrupt: {}",
                self.path.display(),
                e
            ))
        })?;
        if record.version != RECORD_VERSION {
            return Err(PSError::SerializationError(format!(
                "unsupported identity record version {}",
                record.version
            )));
        }
        Ok(Some(record))
    }

    fn save(&self, record: &IdentityRecord) -> Result<(), PSError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(record)?;
        secure_file::write_secure(&self.path, &json)
    }
}

/// In-memory storage for testing
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    record: RwLock<Option<IdentityRecord>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<IdentityRecord>, PSError> {
        Ok(self
            .record
            .read()
            .map_err(|_| PSError::InternalError("Lock poisoned".to_string()))?
            .clone())
    }

    fn save(&self, record: &IdentityRecord) -> Result<(), PSError> {
        let mut guard = self
            .record
            .write()
            .map_err(|_| PSError::InternalError("Lock poisoned".to_string()))?;
        *guard = Some(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> KeyRecord {
        let kp = ed25519_compact::KeyPair::from_seed(ed25519_compact::Seed::new([3u8; 32]));
        let public_key = PublicKey::from(kp.pk);
        KeyRecord {
            key_id: public_key.key_id(),
            public_key,
            keystore_id: Some("key-abc".to_string()),
            created_at: DateTime::from_timestamp(1_767_225_600, 0).unwrap(),
            retired_at: None,
            status: KeyStatus::Current,
        }
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdentityStore::new(dir.path().join("nested").join("identity.json"));
        assert!(store.load().unwrap().is_none());

        let record = IdentityRecord {
            current: Some(sample_record()),
            ..IdentityRecord::default()
        };
        store.save(&record).unwrap();
        assert_eq!(store.load().unwrap(), Some(record));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, b"{ nope").unwrap();
        assert!(matches!(
            FileIdentityStore::new(&path).load(),
            Err(PSError::SerializationError(_))
        ));
    }

    #[test]
    fn test_retire_current_moves_to_history() {
        let mut record = IdentityRecord {
            current: Some(sample_record()),
            ..IdentityRecord::default()
        };
        let key_id = record.current.as_ref().unwrap().key_id.clone();
        let at = DateTime::from_timestamp(1_800_000_000, 0).unwrap();

        let retired = record.retire_current(KeyStatus::Superseded, at).unwrap();
        assert_eq!(retired.status, KeyStatus::Superseded);
        assert!(record.current.is_none());
        assert_eq!(record.find(&key_id).unwrap().retired_at, Some(at));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryIdentityStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&IdentityRecord::default()).unwrap();
        assert!(store.load().unwrap().is_some());
    }
}
