//! Signing identity: public keys, verification and the key manager
//!
//! Private key material never appears in this module. It lives behind a
//! [`KeyHandle`](crate::platform::KeyHandle) inside a
//! [`SecureKeyProvider`](crate::platform::SecureKeyProvider); the
//! [`KeyManager`] only tracks which handle is current and which public keys
//! were used in the past.

use crate::error::PSError;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

mod manager;
mod store;

pub use manager::{KeyManager, KeyPair, KeySigner, KeyState, RotationPolicy, UserAuthorization};
pub use store::{FileIdentityStore, IdentityRecord, IdentityStore, KeyRecord, KeyStatus, MemoryIdentityStore};

/// Length of an Ed25519 public key
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of an Ed25519 signature
pub const SIGNATURE_LENGTH: usize = 64;

/// An Ed25519 public key.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey {
    pk: ed25519_compact::PublicKey,
}

impl PublicKey {
    /// Create a public key from its 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PSError> {
        if bytes.len() != PUBLIC_KEY_LENGTH {
            return Err(PSError::InvalidArgument);
        }
        Ok(Self {
            pk: ed25519_compact::PublicKey::from_slice(bytes)?,
        })
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self, PSError> {
        let bytes = hex::decode(s.trim()).map_err(|_| PSError::InvalidArgument)?;
        Self::from_bytes(&bytes)
    }

    /// Deserialize a PEM-encoded (SubjectPublicKeyInfo) public key.
    pub fn from_pem(pem: &str) -> Result<Self, PSError> {
        Ok(Self {
            pk: ed25519_compact::PublicKey::from_pem(pem)?,
        })
    }

    /// Return the public key as raw bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        *self.pk
    }

    /// Hex encoding of the raw key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.pk.as_ref())
    }

    /// Serialize the public key using PEM encoding.
    pub fn to_pem(&self) -> String {
        self.pk.to_pem()
    }

    /// Serialize the public key using DER encoding.
    pub fn to_der(&self) -> Vec<u8> {
        self.pk.to_der()
    }

    /// Stable identifier: first 8 bytes of SHA-256 over the raw key, hex.
    pub fn key_id(&self) -> String {
        let digest = Sha256::digest(self.pk.as_ref());
        hex::encode(&digest[..8])
    }

    /// Verify a signature made by this key.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        verify(data, signature, self.pk.as_ref())
    }
}

impl From<ed25519_compact::PublicKey> for PublicKey {
    fn from(pk: ed25519_compact::PublicKey) -> Self {
        Self { pk }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey {{ key_id: {} }}", self.key_id())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Which half of a key pair an export request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Public,
    Private,
}

/// Verify an Ed25519 signature against any public key.
///
/// Pure: no keystore access, never fails. Wrong key or signature lengths,
/// malformed keys and mismatches all return `false`.
pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    if public_key.len() != PUBLIC_KEY_LENGTH || signature.len() != SIGNATURE_LENGTH {
        return false;
    }
    let Ok(pk) = ed25519_compact::PublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(sig) = ed25519_compact::Signature::from_slice(signature) else {
        return false;
    };
    pk.verify(data, &sig).is_ok()
}
