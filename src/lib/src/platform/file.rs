//! File-backed key provider
//!
//! Stores Ed25519 seeds as `<directory>/<key name>.seed` with owner-only
//! permissions, so a workstation identity survives restarts. Like the
//! software provider this has no hardware protection and is only selected
//! when software keys are authorized.

use super::{KeyHandle, SecureKeyProvider, SecurityLevel};
use crate::error::PSError;
use crate::keys::PublicKey;
use crate::secure_file;
use ed25519_compact::{KeyPair, Seed};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SEED_EXTENSION: &str = "seed";

struct LoadedKey {
    name: String,
    keypair: KeyPair,
}

struct State {
    next_handle: u64,
    keys: HashMap<u64, LoadedKey>,
}

/// Key provider persisting seeds in a directory
pub struct FileProvider {
    directory: PathBuf,
    state: Mutex<State>,
}

impl FileProvider {
    /// Open (and create if needed) a key directory.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, PSError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| {
            PSError::KeystoreUnavailable(format!(
                "cannot create key directory '{}': {}",
                directory.display(),
                e
            ))
        })?;
        log::warn!(
            "Using file key provider at '{}' - NOT SUITABLE FOR PRODUCTION",
            directory.display()
        );
        Ok(Self {
            directory,
            state: Mutex::new(State {
                next_handle: 1,
                keys: HashMap::new(),
            }),
        })
    }

    fn seed_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.{}", name, SEED_EXTENSION))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, PSError> {
        self.state
            .lock()
            .map_err(|e| PSError::InternalError(format!("Lock poisoned: {}", e)))
    }

    fn register(&self, name: String, keypair: KeyPair) -> Result<KeyHandle, PSError> {
        let mut state = self.lock()?;
        if let Some((&raw, _)) = state.keys.iter().find(|(_, k)| k.name == name) {
            return Ok(KeyHandle::from_raw(raw));
        }
        let raw = state.next_handle;
        state.next_handle += 1;
        state.keys.insert(raw, LoadedKey { name, keypair });
        Ok(KeyHandle::from_raw(raw))
    }
}

fn valid_key_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl SecureKeyProvider for FileProvider {
    fn name(&self) -> &str {
        "File (Development Only)"
    }

    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::Software
    }

    fn health_check(&self) -> Result<(), PSError> {
        let meta = fs::metadata(&self.directory).map_err(|e| {
            PSError::KeystoreUnavailable(format!("key directory unavailable: {}", e))
        })?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(PSError::KeystoreUnavailable(
                "key directory is not a directory".to_string(),
            ))
        }
    }

    fn generate_key(&self) -> Result<KeyHandle, PSError> {
        let seed = Seed::generate();
        let name = format!("key-{}", uuid::Uuid::new_v4().simple());
        secure_file::write_secure(&self.seed_path(&name), seed.as_slice())?;
        log::info!("Generated file-backed key '{}'", name);
        self.register(name, KeyPair::from_seed(seed))
    }

    fn persistent_id(&self, handle: KeyHandle) -> Result<Option<String>, PSError> {
        let state = self.lock()?;
        let key = state
            .keys
            .get(&handle.as_raw())
            .ok_or(PSError::InvalidKeyHandle)?;
        Ok(Some(key.name.clone()))
    }

    fn load_key(&self, key_id: &str) -> Result<KeyHandle, PSError> {
        if !valid_key_name(key_id) {
            return Err(PSError::InvalidArgument);
        }
        let path = self.seed_path(key_id);
        if !path.exists() {
            return Err(PSError::PrivateKeyNotFound);
        }
        let bytes = secure_file::read_secure(&path)?;
        let seed = Seed::from_slice(&bytes).map_err(|_| {
            PSError::KeystoreUnavailable(format!("seed file for '{}' is corrupt", key_id))
        })?;
        self.register(key_id.to_string(), KeyPair::from_seed(seed))
    }

    fn sign(&self, handle: KeyHandle, data: &[u8]) -> Result<Vec<u8>, PSError> {
        let state = self.lock()?;
        let key = state
            .keys
            .get(&handle.as_raw())
            .ok_or(PSError::InvalidKeyHandle)?;
        Ok(key.keypair.sk.sign(data, None).to_vec())
    }

    fn get_public_key(&self, handle: KeyHandle) -> Result<PublicKey, PSError> {
        let state = self.lock()?;
        let key = state
            .keys
            .get(&handle.as_raw())
            .ok_or(PSError::InvalidKeyHandle)?;
        Ok(PublicKey::from(key.keypair.pk))
    }

    fn delete_key(&self, handle: KeyHandle) -> Result<(), PSError> {
        let mut state = self.lock()?;
        let key = state
            .keys
            .remove(&handle.as_raw())
            .ok_or(PSError::InvalidKeyHandle)?;
        let path = self.seed_path(&key.name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        log::info!("Deleted file-backed key '{}'", key.name);
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<KeyHandle>, PSError> {
        let state = self.lock()?;
        let mut handles: Vec<KeyHandle> =
            state.keys.keys().map(|&h| KeyHandle::from_raw(h)).collect();
        handles.sort_by_key(|h| h.as_raw());
        Ok(handles)
    }
}
