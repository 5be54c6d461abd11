/// Keystore capability for the signing identity
///
/// The pipeline never touches private key bytes. It holds a [`KeyHandle`] and
/// asks a [`SecureKeyProvider`] to generate, sign with, or delete the key
/// behind it. Which provider backs the identity is decided once at startup
/// from [`KeystoreConfig`](crate::config::KeystoreConfig).
///
/// # Providers
///
/// - **Software** (development/testing): in-memory keys
/// - **File** (development on a workstation): seeds persisted with 0600 permissions
/// - **Hardware** (production): HSM, TPM-backed or secure-enclave stores supplied
///   by the embedding application through [`SecureKeyProvider`]
///
/// # Architecture
///
/// ```text
/// ┌─────────────────────┐
/// │   KeyManager        │
/// │   (identity state)  │
/// └──────────┬──────────┘
///            │
///            ▼
/// ┌─────────────────────┐      ┌──────────────┐
/// │ SecureKeyProvider   │◄─────│ PresenceGate │ (optional)
/// │     (trait)         │      └──────────────┘
/// └──────────┬──────────┘
///            │
///      ┌─────┴─────┬──────────┐
///      ▼           ▼          ▼
///   Software     File      Hardware
///   Provider    Provider   (external)
/// ```
///
/// # Security Principles
///
/// 1. **Keys never exposed**: no provider API returns private material
/// 2. **Gate rejections are distinct**: a refused user-presence check is
///    `SigningDenied`, never a generic failure
/// 3. **Fail secure**: errors never carry key material
use crate::config::{KeystoreBackend, KeystoreConfig};
use crate::error::PSError;
use crate::keys::PublicKey;
use std::fmt;

pub mod file;
pub mod software;

/// Handle to a keystore-resident key
///
/// This is an opaque reference; the key material is never exposed to the
/// application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(u64);

impl KeyHandle {
    /// Create a new key handle from a raw value
    ///
    /// Only provider implementations should call this.
    pub fn from_raw(value: u64) -> Self {
        KeyHandle(value)
    }

    /// Get the raw handle value
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Attestation data proving key provenance
#[derive(Debug, Clone)]
pub struct Attestation {
    /// Type of attestation
    pub attestation_type: AttestationType,
    /// Challenge the attestation answers
    pub challenge: Vec<u8>,
    /// Attestation data (platform-specific format)
    pub data: Vec<u8>,
    /// Signature over attestation (if applicable)
    pub signature: Option<Vec<u8>>,
}

/// Type of hardware attestation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationType {
    /// No attestation available
    None,
    /// TPM 2.0 Quote
    Tpm2Quote,
    /// Platform key attestation (secure enclave / StrongBox style)
    PlatformKeyAttestation,
    /// Secure Element Certificate
    SecureElementCert,
}

/// Unified interface for keystore-backed signing keys
///
/// Implementations MUST ensure:
/// 1. Private keys never leave the keystore
/// 2. Key handles are validated before use
/// 3. Errors never leak key material
pub trait SecureKeyProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Security level of this provider
    fn security_level(&self) -> SecurityLevel;

    /// Quick availability check, no key generation
    fn health_check(&self) -> Result<(), PSError>;

    /// Generate a new Ed25519 key pair inside the keystore
    fn generate_key(&self) -> Result<KeyHandle, PSError>;

    /// Stable identifier for a key, used to find it again after restart.
    ///
    /// Providers without persistence return `None`.
    fn persistent_id(&self, handle: KeyHandle) -> Result<Option<String>, PSError> {
        let _ = handle;
        Ok(None)
    }

    /// Load an existing key by its persistent identifier
    fn load_key(&self, key_id: &str) -> Result<KeyHandle, PSError>;

    /// Sign data with a keystore-resident key
    fn sign(&self, handle: KeyHandle, data: &[u8]) -> Result<Vec<u8>, PSError>;

    /// Public key for a handle (safe to expose)
    fn get_public_key(&self, handle: KeyHandle) -> Result<PublicKey, PSError>;

    /// Answer an attestation challenge for a key.
    ///
    /// Optional: software keystores return `None`.
    fn attest(&self, handle: KeyHandle, challenge: &[u8]) -> Result<Option<Attestation>, PSError> {
        let _ = (handle, challenge);
        Ok(None)
    }

    /// Permanently delete a key
    fn delete_key(&self, handle: KeyHandle) -> Result<(), PSError>;

    /// List key handles (never key material)
    fn list_keys(&self) -> Result<Vec<KeyHandle>, PSError>;
}

/// Out-of-band user-presence check (biometric prompt, PIN, hardware button).
pub trait PresenceGate: Send + Sync {
    /// Ask the user to approve an operation.
    ///
    /// Returns `Ok(true)` when approved, `Ok(false)` when the user refused.
    fn confirm(&self, operation: &str) -> Result<bool, PSError>;
}

/// Provider wrapper that asks a [`PresenceGate`] before every signature.
pub struct GatedProvider {
    inner: Box<dyn SecureKeyProvider>,
    gate: Box<dyn PresenceGate>,
}

impl GatedProvider {
    pub fn new(inner: Box<dyn SecureKeyProvider>, gate: Box<dyn PresenceGate>) -> Self {
        Self { inner, gate }
    }
}

impl SecureKeyProvider for GatedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn security_level(&self) -> SecurityLevel {
        self.inner.security_level()
    }

    fn health_check(&self) -> Result<(), PSError> {
        self.inner.health_check()
    }

    fn generate_key(&self) -> Result<KeyHandle, PSError> {
        self.inner.generate_key()
    }

    fn persistent_id(&self, handle: KeyHandle) -> Result<Option<String>, PSError> {
        self.inner.persistent_id(handle)
    }

    fn load_key(&self, key_id: &str) -> Result<KeyHandle, PSError> {
        self.inner.load_key(key_id)
    }

    fn sign(&self, handle: KeyHandle, data: &[u8]) -> Result<Vec<u8>, PSError> {
        match self.gate.confirm("sign content credential") {
            Ok(true) => self.inner.sign(handle, data),
            Ok(false) => Err(PSError::SigningDenied(
                "user presence check was declined".to_string(),
            )),
            Err(e) => Err(PSError::SigningDenied(format!(
                "user presence check failed: {}",
                e
            ))),
        }
    }

    fn get_public_key(&self, handle: KeyHandle) -> Result<PublicKey, PSError> {
        self.inner.get_public_key(handle)
    }

    fn attest(&self, handle: KeyHandle, challenge: &[u8]) -> Result<Option<Attestation>, PSError> {
        self.inner.attest(handle, challenge)
    }

    fn delete_key(&self, handle: KeyHandle) -> Result<(), PSError> {
        self.inner.delete_key(handle)
    }

    fn list_keys(&self) -> Result<Vec<KeyHandle>, PSError> {
        self.inner.list_keys()
    }
}

/// Security level of a key provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// Software-only (development/testing). **NOT SUITABLE FOR PRODUCTION**
    Software = 0,

    /// Keys in hardware with limited security features
    HardwareBasic = 1,

    /// Keys in certified hardware (TPM 2.0, secure enclave)
    HardwareBacked = 2,

    /// Certified hardware with attestation support
    HardwareCertified = 3,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Software => write!(f, "Software (Development Only)"),
            SecurityLevel::HardwareBasic => write!(f, "Hardware-Assisted"),
            SecurityLevel::HardwareBacked => write!(f, "Hardware-Backed (Production)"),
            SecurityLevel::HardwareCertified => write!(f, "Hardware-Certified (High Security)"),
        }
    }
}

/// Build the keystore provider selected by configuration.
///
/// `hardware` has no built-in implementation: embedding applications pass
/// their own provider to [`KeyManager::with_provider`](crate::keys::KeyManager::with_provider).
/// Asking for it here falls back to software keys only when the
/// configuration explicitly authorizes that fallback.
pub fn provider_from_config(config: &KeystoreConfig) -> Result<Box<dyn SecureKeyProvider>, PSError> {
    match &config.backend {
        KeystoreBackend::Software => {
            if !config.allow_software_keys {
                return Err(PSError::KeystoreUnavailable(
                    "software keystore selected but software keys are not authorized".to_string(),
                ));
            }
            Ok(Box::new(software::SoftwareProvider::new()))
        }
        KeystoreBackend::File { directory } => {
            if !config.allow_software_keys {
                return Err(PSError::KeystoreUnavailable(
                    "file keystore selected but software keys are not authorized".to_string(),
                ));
            }
            Ok(Box::new(file::FileProvider::open(directory)?))
        }
        KeystoreBackend::Hardware => {
            if config.allow_software_keys {
                log::warn!(
                    "No hardware keystore registered, falling back to software keys (DEVELOPMENT ONLY)"
                );
                Ok(Box::new(software::SoftwareProvider::new()))
            } else {
                Err(PSError::KeystoreUnavailable(
                    "no hardware-backed keystore available and software fallback is not authorized"
                        .to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FixedGate(Arc<AtomicBool>);

    impl PresenceGate for FixedGate {
        fn confirm(&self, _operation: &str) -> Result<bool, PSError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn test_key_handle_equality() {
        let handle1 = KeyHandle::from_raw(42);
        let handle2 = KeyHandle::from_raw(42);
        let handle3 = KeyHandle::from_raw(43);

        assert_eq!(handle1, handle2);
        assert_ne!(handle1, handle3);
        assert_eq!(handle1.as_raw(), 42);
    }

    #[test]
    fn test_security_level_ordering() {
        assert!(SecurityLevel::Software < SecurityLevel::HardwareBasic);
        assert!(SecurityLevel::HardwareBasic < SecurityLevel::HardwareBacked);
        assert!(SecurityLevel::HardwareBacked < SecurityLevel::HardwareCertified);
    }

    #[test]
    fn test_hardware_without_fallback_is_unavailable() {
        let config = KeystoreConfig {
            backend: KeystoreBackend::Hardware,
            allow_software_keys: false,
            ..KeystoreConfig::default()
        };
        let result = provider_from_config(&config);
        assert!(matches!(result, Err(PSError::KeystoreUnavailable(_))));
    }

    #[test]
    fn test_hardware_with_fallback_uses_software() {
        let config = KeystoreConfig {
            backend: KeystoreBackend::Hardware,
            allow_software_keys: true,
            ..KeystoreConfig::default()
        };
        let provider = provider_from_config(&config).unwrap();
        assert_eq!(provider.security_level(), SecurityLevel::Software);
    }

    #[test]
    fn test_software_requires_authorization() {
        let config = KeystoreConfig {
            backend: KeystoreBackend::Software,
            allow_software_keys: false,
            ..KeystoreConfig::default()
        };
        assert!(provider_from_config(&config).is_err());
    }

    #[test]
    fn test_gate_rejection_is_signing_denied() {
        let approve = Arc::new(AtomicBool::new(false));
        let provider = GatedProvider::new(
            Box::new(software::SoftwareProvider::new()),
            Box::new(FixedGate(approve.clone())),
        );
        let handle = provider.generate_key().unwrap();

        let result = provider.sign(handle, b"data");
        assert!(matches!(result, Err(PSError::SigningDenied(_))));

        approve.store(true, Ordering::SeqCst);
        assert!(provider.sign(handle, b"data").is_ok());
    }
}
