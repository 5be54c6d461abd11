/// Software-based key provider (development/testing only)
///
/// This implementation stores keys in process memory without hardware protection.
///
/// # Security Warning
///
/// **NOT SUITABLE FOR PRODUCTION USE**
///
/// - Keys stored in process memory
/// - No hardware protection
/// - Keys are lost when the process exits
///
/// Use only for:
/// - Development and testing
/// - CI pipelines (ephemeral keys)

use super::{KeyHandle, SecureKeyProvider, SecurityLevel};
use crate::error::PSError;
use crate::keys::PublicKey;
use ed25519_compact::KeyPair;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Software-based key storage
///
/// Keys are stored in an in-memory HashMap with simple integer handles.
struct KeyStore {
    next_handle: u64,
    keys: HashMap<u64, KeyPair>,
}

impl KeyStore {
    fn new() -> Self {
        KeyStore {
            next_handle: 1,
            keys: HashMap::new(),
        }
    }

    fn insert(&mut self, keypair: KeyPair) -> KeyHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.keys.insert(handle, keypair);
        KeyHandle::from_raw(handle)
    }

    fn get(&self, handle: KeyHandle) -> Option<&KeyPair> {
        self.keys.get(&handle.as_raw())
    }

    fn remove(&mut self, handle: KeyHandle) -> Option<KeyPair> {
        self.keys.remove(&handle.as_raw())
    }

    fn list(&self) -> Vec<KeyHandle> {
        let mut handles: Vec<KeyHandle> =
            self.keys.keys().map(|&h| KeyHandle::from_raw(h)).collect();
        handles.sort_by_key(|h| h.as_raw());
        handles
    }
}

/// Software key provider implementation
///
/// # Example
///
/// ```ignore
/// use provsign::platform::software::SoftwareProvider;
/// use provsign::platform::SecureKeyProvider;
///
/// let provider = SoftwareProvider::new();
/// let handle = provider.generate_key()?;
/// let signature = provider.sign(handle, b"claim bytes")?;
/// let public_key = provider.get_public_key(handle)?;
/// ```
pub struct SoftwareProvider {
    store: Arc<Mutex<KeyStore>>,
}

impl SoftwareProvider {
    /// Create a new software key provider
    pub fn new() -> Self {
        log::warn!(
            "Creating software key provider - NOT SUITABLE FOR PRODUCTION. \
             Keys are stored in process memory without hardware protection."
        );

        SoftwareProvider {
            store: Arc::new(Mutex::new(KeyStore::new())),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, KeyStore>, PSError> {
        self.store
            .lock()
            .map_err(|e| PSError::InternalError(format!("Lock poisoned: {}", e)))
    }
}

impl Default for SoftwareProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureKeyProvider for SoftwareProvider {
    fn name(&self) -> &str {
        "Software (Development Only)"
    }

    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::Software
    }

    fn health_check(&self) -> Result<(), PSError> {
        self.lock().map(|_| ())
    }

    fn generate_key(&self) -> Result<KeyHandle, PSError> {
        let keypair = KeyPair::from_seed(ed25519_compact::Seed::generate());
        Ok(self.lock()?.insert(keypair))
    }

    fn load_key(&self, _key_id: &str) -> Result<KeyHandle, PSError> {
        // In-memory keys do not survive a restart.
        Err(PSError::PrivateKeyNotFound)
    }

    fn sign(&self, handle: KeyHandle, data: &[u8]) -> Result<Vec<u8>, PSError> {
        let store = self.lock()?;
        let keypair = store.get(handle).ok_or(PSError::InvalidKeyHandle)?;
        Ok(keypair.sk.sign(data, None).to_vec())
    }

    fn get_public_key(&self, handle: KeyHandle) -> Result<PublicKey, PSError> {
        let store = self.lock()?;
        let keypair = store.get(handle).ok_or(PSError::InvalidKeyHandle)?;
        Ok(PublicKey::from(keypair.pk))
    }

    fn delete_key(&self, handle: KeyHandle) -> Result<(), PSError> {
        self.lock()?
            .remove(handle)
            .ok_or(PSError::InvalidKeyHandle)?;
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<KeyHandle>, PSError> {
        Ok(self.lock()?.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_provider_creation() {
        let provider = SoftwareProvider::new();
        assert_eq!(provider.name(), "Software (Development Only)");
        assert_eq!(provider.security_level(), SecurityLevel::Software);
        assert!(provider.health_check().is_ok());
    }

    #[test]
    fn test_sign_and_verify() {
        let provider = SoftwareProvider::new();
        let handle = provider.generate_key().expect("Failed to generate key");

        let data = b"test data to sign";
        let signature = provider.sign(handle, data).expect("Failed to sign");
        let public_key = provider
            .get_public_key(handle)
            .expect("Failed to get public key");

        assert!(crate::keys::verify(data, &signature, &public_key.to_bytes()));
        assert!(!crate::keys::verify(b"other data", &signature, &public_key.to_bytes()));
    }

    #[test]
    fn test_multiple_keys() {
        let provider = SoftwareProvider::new();

        let handle1 = provider.generate_key().expect("Failed to generate key 1");
        let handle2 = provider.generate_key().expect("Failed to generate key 2");
        assert_ne!(handle1, handle2);

        let keys = provider.list_keys().expect("Failed to list keys");
        assert_eq!(keys, vec![handle1, handle2]);
        assert_ne!(
            provider.get_public_key(handle1).unwrap(),
            provider.get_public_key(handle2).unwrap()
        );
    }

    #[test]
    fn test_delete_key() {
        let provider = SoftwareProvider::new();
        let handle = provider.generate_key().expect("Failed to generate key");

        provider.delete_key(handle).expect("Failed to delete key");
        assert!(provider.list_keys().unwrap().is_empty());

        let result = provider.sign(handle, b"test");
        assert!(matches!(result, Err(PSError::InvalidKeyHandle)));
    }

    #[test]
    fn test_invalid_handle() {
        let provider = SoftwareProvider::new();
        let result = provider.sign(KeyHandle::from_raw(9999), b"test");
        assert!(matches!(result, Err(PSError::InvalidKeyHandle)));
    }

    #[test]
    fn test_attestation_not_supported() {
        let provider = SoftwareProvider::new();
        let handle = provider.generate_key().unwrap();
        assert!(provider.attest(handle, b"challenge").unwrap().is_none());
    }

    #[test]
    fn test_load_key_not_supported() {
        let provider = SoftwareProvider::new();
        assert!(matches!(
            provider.load_key("some-key-id"),
            Err(PSError::PrivateKeyNotFound)
        ));
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let provider = Arc::new(SoftwareProvider::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let provider_clone = Arc::clone(&provider);
            handles.push(thread::spawn(move || provider_clone.generate_key()));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let key = handle.join().expect("Thread panicked").unwrap();
            assert!(seen.insert(key.as_raw()), "Duplicate key handle");
        }

        assert_eq!(provider.list_keys().unwrap().len(), 10);
    }
}
