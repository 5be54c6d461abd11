//! Key manager: lifecycle of the single signing identity
//!
//! ```text
//! Missing ──► Generating ──► Available ──► Rotating ──► Available
//!                                 │
//!                                 └──────► Deleted
//! ```
//!
//! At most one key is current. Rotation retires the previous key as
//! superseded but keeps its public half so older manifests stay verifiable.

use super::store::{FileIdentityStore, IdentityRecord, IdentityStore, KeyRecord, KeyStatus};
use super::{KeyType, PublicKey};
use crate::audit;
use crate::config::PipelineConfig;
use crate::error::PSError;
use crate::platform::{self, Attestation, KeyHandle, SecureKeyProvider, SecurityLevel};
use crate::time::{SystemTimeSource, TimeSource};
use chrono::{DateTime, Months, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// State of the signing identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Missing,
    Generating,
    Available,
    Rotating,
    Deleted,
}

/// Public view of a key pair. The private half is only reachable through
/// the keystore handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub handle: KeyHandle,
}

impl KeyPair {
    pub fn key_id(&self) -> String {
        self.public_key.key_id()
    }
}

/// Explicit user decision required for destructive operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAuthorization {
    Confirmed,
    Declined,
}

/// Informational rotation schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    pub interval_months: u32,
    pub last_rotation: Option<DateTime<Utc>>,
    pub next_rotation: Option<DateTime<Utc>>,
    pub has_revocation_procedure: bool,
}

impl RotationPolicy {
    /// Whether the schedule says the key should be rotated at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_rotation.is_some_and(|next| now >= next)
    }
}

/// Signing capability bound to the current key.
///
/// Holds the keystore, never the private key.
#[derive(Clone)]
pub struct KeySigner {
    provider: Arc<dyn SecureKeyProvider>,
    handle: KeyHandle,
    public_key: PublicKey,
}

impl KeySigner {
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, PSError> {
        self.provider.sign(self.handle, data)
    }
}

struct Inner {
    state: KeyState,
    record: IdentityRecord,
    current: Option<KeyPair>,
    /// Handles of superseded keys still loaded in this session
    retired_handles: HashMap<String, KeyHandle>,
}

/// Owner of the signing identity
pub struct KeyManager {
    provider: Arc<dyn SecureKeyProvider>,
    store: Box<dyn IdentityStore>,
    time: Arc<dyn TimeSource>,
    rotation_interval_months: u32,
    inner: Mutex<Inner>,
}

impl KeyManager {
    /// Build the manager from configuration: provider from the keystore
    /// section, identity record under the data directory.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PSError> {
        let provider = platform::provider_from_config(&config.keystore)?;
        let store = FileIdentityStore::new(config.identity_path());
        let manager = Self::with_provider(
            Arc::from(provider),
            Box::new(store),
            Arc::new(SystemTimeSource),
        )?;
        Ok(manager.with_rotation_interval(config.keystore.rotation_interval_months))
    }

    /// Build the manager over an explicit provider and store and restore any
    /// persisted identity.
    pub fn with_provider(
        provider: Arc<dyn SecureKeyProvider>,
        store: Box<dyn IdentityStore>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, PSError> {
        provider.health_check()?;
        let record = store.load()?.unwrap_or_default();
        let manager = Self {
            provider,
            store,
            time,
            rotation_interval_months: 12,
            inner: Mutex::new(Inner {
                state: KeyState::Missing,
                record,
                current: None,
                retired_handles: HashMap::new(),
            }),
        };
        manager.restore()?;
        Ok(manager)
    }

    pub fn with_rotation_interval(mut self, months: u32) -> Self {
        self.rotation_interval_months = months;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, PSError> {
        self.inner
            .lock()
            .map_err(|e| PSError::InternalError(format!("Lock poisoned: {}", e)))
    }

    fn restore(&self) -> Result<(), PSError> {
        let mut inner = self.lock()?;
        if inner.record.deleted_at.is_some() && inner.record.current.is_none() {
            inner.state = KeyState::Deleted;
            return Ok(());
        }
        let Some(current) = inner.record.current.clone() else {
            return Ok(());
        };

        let loaded = match &current.keystore_id {
            Some(id) => match self.provider.load_key(id) {
                Ok(handle) => Some(handle),
                Err(PSError::PrivateKeyNotFound) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        match loaded {
            Some(handle) => {
                let public_key = self.provider.get_public_key(handle)?;
                if public_key != current.public_key {
                    return Err(PSError::KeystoreUnavailable(format!(
                        "keystore key for identity {} does not match the recorded public key",
                        current.key_id
                    )));
                }
                inner.current = Some(KeyPair { public_key, handle });
                inner.state = KeyState::Available;
                log::debug!("Restored signing identity {}", current.key_id);
            }
            None => {
                log::warn!(
                    "Keystore '{}' no longer holds identity {}; its public key is kept for verification",
                    self.provider.name(),
                    current.key_id
                );
                let now = self.time.now_utc()?;
                inner.record.retire_current(KeyStatus::Lost, now);
                self.store.save(&inner.record)?;
            }
        }
        Ok(())
    }

    /// Current identity state
    pub fn state(&self) -> Result<KeyState, PSError> {
        Ok(self.lock()?.state)
    }

    /// Name of the keystore provider
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Security level of the keystore provider
    pub fn security_level(&self) -> SecurityLevel {
        self.provider.security_level()
    }

    /// Current key pair, if an identity is available
    pub fn current_key_pair(&self) -> Result<Option<KeyPair>, PSError> {
        Ok(self.lock()?.current)
    }

    /// Create the signing identity.
    ///
    /// Fails when an identity already exists: replacing it is [`rotate`](Self::rotate).
    pub fn generate_key_pair(&self) -> Result<KeyPair, PSError> {
        let mut inner = self.lock()?;
        if inner.current.is_some() {
            return Err(PSError::UsageError(
                "A signing identity already exists; rotate it instead",
            ));
        }
        let previous_state = inner.state;
        inner.state = KeyState::Generating;
        match self.create_key(&mut inner) {
            Ok(pair) => {
                inner.state = KeyState::Available;
                Ok(pair)
            }
            Err(e) => {
                inner.state = previous_state;
                Err(e)
            }
        }
    }

    /// Current key pair, generating one on first use.
    pub fn ensure_key_pair(&self) -> Result<KeyPair, PSError> {
        if let Some(pair) = self.current_key_pair()? {
            return Ok(pair);
        }
        match self.generate_key_pair() {
            Err(PSError::UsageError(_)) => self
                .current_key_pair()?
                .ok_or(PSError::PrivateKeyNotFound),
            other => other,
        }
    }

    fn create_key(&self, inner: &mut Inner) -> Result<KeyPair, PSError> {
        let handle = self.provider.generate_key()?;
        let public_key = self.provider.get_public_key(handle)?;
        let keystore_id = self.provider.persistent_id(handle)?;
        let now = self.time.now_utc()?;

        let pair = KeyPair { public_key, handle };
        inner.record.current = Some(KeyRecord {
            key_id: pair.key_id(),
            public_key,
            keystore_id,
            created_at: now,
            retired_at: None,
            status: KeyStatus::Current,
        });
        inner.record.deleted_at = None;
        if let Err(e) = self.store.save(&inner.record) {
            inner.record.current = None;
            if let Err(cleanup) = self.provider.delete_key(handle) {
                log::warn!("Failed to discard unrecorded key: {}", cleanup);
            }
            return Err(e);
        }
        inner.current = Some(pair);

        audit::log_key_generated(&pair.key_id(), self.provider.name());
        log::info!(
            "Generated signing identity {} in {} keystore",
            pair.key_id(),
            self.provider.security_level()
        );
        Ok(pair)
    }

    /// Sign with the current key inside the keystore.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, PSError> {
        let handle = self
            .lock()?
            .current
            .map(|pair| pair.handle)
            .ok_or(PSError::PrivateKeyNotFound)?;
        self.provider.sign(handle, data)
    }

    /// Signing capability for collaborators that sign on our behalf
    /// (certificate issuance).
    pub fn signer(&self) -> Result<KeySigner, PSError> {
        let pair = self.lock()?.current.ok_or(PSError::PrivateKeyNotFound)?;
        Ok(KeySigner {
            provider: Arc::clone(&self.provider),
            handle: pair.handle,
            public_key: pair.public_key,
        })
    }

    /// Pure signature check against any public key.
    pub fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        super::verify(data, signature, public_key)
    }

    /// Export key material.
    ///
    /// The public key is returned only with consent. Private keys are never
    /// exported.
    pub fn export_key(&self, key_type: KeyType, user_consent: bool) -> Option<Vec<u8>> {
        match key_type {
            KeyType::Private => None,
            KeyType::Public if user_consent => {
                let inner = self.lock().ok()?;
                inner.current.map(|pair| pair.public_key.to_bytes().to_vec())
            }
            KeyType::Public => None,
        }
    }

    /// Rotation schedule for the current identity.
    pub fn rotation_policy(&self) -> Result<RotationPolicy, PSError> {
        let inner = self.lock()?;
        let last_rotation = inner
            .record
            .last_rotation
            .or_else(|| inner.record.current.as_ref().map(|c| c.created_at));
        let next_rotation = match (last_rotation, inner.record.current.is_some()) {
            (Some(last), true) => last.checked_add_months(Months::new(self.rotation_interval_months)),
            _ => None,
        };
        Ok(RotationPolicy {
            interval_months: self.rotation_interval_months,
            last_rotation,
            next_rotation,
            has_revocation_procedure: true,
        })
    }

    /// Replace the current key. The old key becomes superseded, never deleted.
    pub fn rotate(&self) -> Result<KeyPair, PSError> {
        let mut inner = self.lock()?;
        let old = inner.current.ok_or(PSError::PrivateKeyNotFound)?;
        inner.state = KeyState::Rotating;

        let snapshot = inner.record.clone();
        let now = self.time.now_utc()?;
        inner.record.retire_current(KeyStatus::Superseded, now);
        inner.record.last_rotation = Some(now);
        inner.current = None;

        match self.create_key(&mut inner) {
            Ok(pair) => {
                inner.retired_handles.insert(old.key_id(), old.handle);
                inner.state = KeyState::Available;
                audit::log_key_rotated(&old.key_id(), &pair.key_id());
                Ok(pair)
            }
            Err(e) => {
                inner.record = snapshot;
                inner.current = Some(old);
                inner.state = KeyState::Available;
                Err(e)
            }
        }
    }

    /// Destroy the signing identity.
    ///
    /// Every private key the identity owns is deleted from the keystore;
    /// public keys remain resolvable.
    pub fn delete_identity(&self, authorization: UserAuthorization) -> Result<(), PSError> {
        if authorization != UserAuthorization::Confirmed {
            return Err(PSError::AuthorizationRequired(
                "deleting the signing identity requires explicit user confirmation".to_string(),
            ));
        }
        let mut inner = self.lock()?;
        let current = inner.current.ok_or(PSError::PrivateKeyNotFound)?;

        self.provider.delete_key(current.handle)?;

        let mut retired = 0usize;
        let handles: Vec<(String, KeyHandle)> = inner.retired_handles.drain().collect();
        for (key_id, handle) in handles {
            match self.provider.delete_key(handle) {
                Ok(()) => retired += 1,
                Err(e) => log::warn!("Failed to delete superseded key {}: {}", key_id, e),
            }
        }
        let stale: Vec<(String, String)> = inner
            .record
            .history
            .iter()
            .filter(|r| r.status == KeyStatus::Superseded)
            .filter_map(|r| r.keystore_id.clone().map(|id| (r.key_id.clone(), id)))
            .collect();
        for (key_id, keystore_id) in stale {
            match self.provider.load_key(&keystore_id) {
                Ok(handle) => match self.provider.delete_key(handle) {
                    Ok(()) => retired += 1,
                    Err(e) => log::warn!("Failed to delete superseded key {}: {}", key_id, e),
                },
                Err(PSError::PrivateKeyNotFound) => {}
                Err(e) => log::warn!("Failed to load superseded key {}: {}", key_id, e),
            }
        }

        let now = self.time.now_utc()?;
        inner.record.retire_current(KeyStatus::Destroyed, now);
        for record in inner.record.history.iter_mut() {
            if record.status == KeyStatus::Superseded {
                record.status = KeyStatus::Destroyed;
            }
        }
        inner.record.deleted_at = Some(now);
        inner.current = None;
        inner.state = KeyState::Deleted;
        self.store.save(&inner.record)?;

        audit::log_key_deleted(&current.key_id(), retired);
        Ok(())
    }

    /// Resolve a current or retired public key by key id.
    pub fn resolve_public_key(&self, key_id: &str) -> Result<Option<PublicKey>, PSError> {
        Ok(self.lock()?.record.find(key_id).map(|r| r.public_key))
    }

    /// Snapshot of the persisted identity record
    pub fn identity_record(&self) -> Result<IdentityRecord, PSError> {
        Ok(self.lock()?.record.clone())
    }

    /// Attestation for the current key, when the keystore supports it.
    pub fn attest(&self, challenge: &[u8]) -> Result<Option<Attestation>, PSError> {
        let handle = self
            .lock()?
            .current
            .map(|pair| pair.handle)
            .ok_or(PSError::PrivateKeyNotFound)?;
        self.provider.attest(handle, challenge)
    }
}
