/// The provsign error type.
#[derive(Debug, thiserror::Error)]
pub enum PSError {
    #[error("Internal error: [{0}]")]
    InternalError(String),

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Ed25519 signature function error")]
    CryptoError(#[from] ed25519_compact::Error),

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Usage error: {0}")]
    UsageError(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Time error: {0}")]
    TimeError(String),

    // Sanitizer
    #[error("Sanitization failed: {0}")]
    SanitizationFailed(String),

    // Identity layer
    #[error("Keystore unavailable: {0}")]
    KeystoreUnavailable(String),

    #[error("Private key not found")]
    PrivateKeyNotFound,

    #[error("Signing denied by keystore access policy: {0}")]
    SigningDenied(String),

    #[error("Invalid key handle")]
    InvalidKeyHandle,

    #[error("Explicit user authorization required: {0}")]
    AuthorizationRequired(String),

    // Certificates and trust
    #[error("Certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    #[error("X509 error: {0}")]
    X509Error(String),

    #[error("Trust store error: {0}")]
    TrustStoreError(String),

    #[error("Trust list unreachable: {0}")]
    TrustListUnreachable(String),

    // Signing orchestration
    #[error("Unsupported asset format: {0}")]
    UnsupportedFormat(String),

    #[error("Embedding failed: {0}")]
    EmbedFailed(String),

    #[error("Sidecar write failed: {0}")]
    SidecarFailed(String),

    #[error("Signing already in progress for '{0}'")]
    SigningInProgress(String),

    // Verification
    #[error("No manifest found")]
    ManifestAbsent,

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Hash mismatch: asset content does not match the hash binding")]
    HashMismatch,

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),
}

impl PSError {
    /// Short, stable identifier used in audit events and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PSError::InternalError(_) => "internal",
            PSError::IOError(_) => "io",
            PSError::CryptoError(_) => "crypto",
            PSError::InvalidArgument => "invalid_argument",
            PSError::UsageError(_) => "usage",
            PSError::ConfigError(_) => "config",
            PSError::SerializationError(_) => "serialization",
            PSError::TimeError(_) => "time",
            PSError::SanitizationFailed(_) => "sanitization_failed",
            PSError::KeystoreUnavailable(_) => "keystore_unavailable",
            PSError::PrivateKeyNotFound => "private_key_not_found",
            PSError::SigningDenied(_) => "signing_denied",
            PSError::InvalidKeyHandle => "invalid_key_handle",
            PSError::AuthorizationRequired(_) => "authorization_required",
            PSError::CertificateGenerationFailed(_) => "certificate_generation_failed",
            PSError::X509Error(_) => "x509",
            PSError::TrustStoreError(_) => "trust_store",
            PSError::TrustListUnreachable(_) => "trust_list_unreachable",
            PSError::UnsupportedFormat(_) => "unsupported_format",
            PSError::EmbedFailed(_) => "embed_failed",
            PSError::SidecarFailed(_) => "sidecar_failed",
            PSError::SigningInProgress(_) => "signing_in_progress",
            PSError::ManifestAbsent => "manifest_absent",
            PSError::MalformedManifest(_) => "malformed_manifest",
            PSError::HashMismatch => "hash_mismatch",
            PSError::SignatureInvalid(_) => "signature_invalid",
        }
    }

    /// Identity-layer failures must surface to the caller and never be
    /// retried with a different key.
    pub fn is_identity_failure(&self) -> bool {
        matches!(
            self,
            PSError::KeystoreUnavailable(_)
                | PSError::PrivateKeyNotFound
                | PSError::SigningDenied(_)
                | PSError::InvalidKeyHandle
        )
    }
}

impl From<x509_parser::error::X509Error> for PSError {
    fn from(err: x509_parser::error::X509Error) -> Self {
        PSError::X509Error(format!("{:?}", err))
    }
}

impl From<serde_json::Error> for PSError {
    fn from(err: serde_json::Error) -> Self {
        PSError::SerializationError(err.to_string())
    }
}
