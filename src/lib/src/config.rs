//! Pipeline configuration
//!
//! One [`PipelineConfig`] drives every stage: which keystore backs the signing
//! identity, how certificates are issued, how strictly metadata is sanitized,
//! where the trust-list service lives and how signing fans out.
//!
//! Configuration is plain JSON. Any field may be omitted and takes its
//! default. A handful of environment variables override the file:
//!
//! | Variable | Effect |
//! |---|---|
//! | `PROVSIGN_KEYSTORE` | `software`, `hardware`, `file` or `file:<dir>` |
//! | `PROVSIGN_TRUST_LIST_URL` | trust-list service base URL (empty disables) |
//! | `PROVSIGN_ALLOW_SOFTWARE_KEYS` | `true`/`false` |
//! | `PROVSIGN_DATA_DIR` | directory for identity, caches and history |

use crate::error::PSError;
use crate::sanitize::{AllowListMode, SanitizationPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_KEYSTORE: &str = "PROVSIGN_KEYSTORE";
pub const ENV_TRUST_LIST_URL: &str = "PROVSIGN_TRUST_LIST_URL";
pub const ENV_ALLOW_SOFTWARE_KEYS: &str = "PROVSIGN_ALLOW_SOFTWARE_KEYS";
pub const ENV_DATA_DIR: &str = "PROVSIGN_DATA_DIR";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding the identity record, trust-list cache and
    /// pending-verification history
    pub data_dir: PathBuf,
    pub keystore: KeystoreConfig,
    pub certificate: CertificateConfig,
    pub sanitization: SanitizationPolicy,
    pub trust_list: TrustListConfig,
    pub signing: SigningConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".provsign"),
            keystore: KeystoreConfig::default(),
            certificate: CertificateConfig::default(),
            sanitization: SanitizationPolicy::default(),
            trust_list: TrustListConfig::default(),
            signing: SigningConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Development preset: in-memory keys, permissive sanitization, no
    /// remote trust list.
    pub fn development() -> Self {
        Self {
            keystore: KeystoreConfig {
                backend: KeystoreBackend::Software,
                allow_software_keys: true,
                ..KeystoreConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production preset: hardware keys only, strict allow-list, degraded
    /// serials refused.
    pub fn production() -> Self {
        Self {
            keystore: KeystoreConfig {
                backend: KeystoreBackend::Hardware,
                allow_software_keys: false,
                ..KeystoreConfig::default()
            },
            certificate: CertificateConfig {
                allow_degraded_serial: false,
                ..CertificateConfig::default()
            },
            sanitization: SanitizationPolicy {
                allow_list_mode: AllowListMode::Strict,
                ..SanitizationPolicy::default()
            },
            ..Self::default()
        }
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PSError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PSError::ConfigError(format!("cannot read '{}': {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| PSError::ConfigError(format!("invalid config '{}': {}", path.display(), e)))
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PSError> {
        let json = serde_json::to_vec_pretty(self)?;
        crate::secure_file::write_atomic(path.as_ref(), &json)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(self) -> Result<Self, PSError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Result<Self, PSError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_KEYSTORE) {
            self.keystore.backend = KeystoreBackend::parse(&value, &self.data_dir)?;
        }
        if let Some(value) = lookup(ENV_ALLOW_SOFTWARE_KEYS) {
            self.keystore.allow_software_keys = parse_bool(ENV_ALLOW_SOFTWARE_KEYS, &value)?;
        }
        if let Some(url) = lookup(ENV_TRUST_LIST_URL) {
            let url = url.trim().to_string();
            self.trust_list.url = if url.is_empty() { None } else { Some(url) };
        }
        Ok(self)
    }

    /// Builder: set the data directory
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Builder: set the keystore backend
    pub fn with_keystore(mut self, backend: KeystoreBackend) -> Self {
        self.keystore.backend = backend;
        self
    }

    /// Builder: set the trust-list service URL
    pub fn with_trust_list_url(mut self, url: impl Into<String>) -> Self {
        self.trust_list.url = Some(url.into());
        self
    }

    /// Location of the persisted identity record
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    /// Location of the identity certificate (PEM)
    pub fn certificate_path(&self) -> PathBuf {
        self.data_dir.join("identity-cert.pem")
    }

    /// Location of the persisted trust-list cache
    pub fn trust_cache_path(&self) -> PathBuf {
        self.trust_list
            .cache_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("trust-cache.json"))
    }

    /// Location of the pending-verification history
    pub fn pending_history_path(&self) -> PathBuf {
        self.data_dir.join("pending-verifications.json")
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, PSError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(PSError::ConfigError(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

/// Keystore selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeystoreConfig {
    pub backend: KeystoreBackend,
    /// Permit keys that live outside secure hardware. Required for the
    /// `software` and `file` backends and for falling back from `hardware`.
    pub allow_software_keys: bool,
    /// Recommended rotation interval
    pub rotation_interval_months: u32,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            backend: KeystoreBackend::Hardware,
            allow_software_keys: false,
            rotation_interval_months: 12,
        }
    }
}

/// Where the signing key lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeystoreBackend {
    /// In-memory keys, lost on exit
    Software,
    /// Seeds persisted in a directory with owner-only permissions
    File { directory: PathBuf },
    /// Secure hardware provided by the host application
    #[default]
    Hardware,
}

impl KeystoreBackend {
    fn parse(value: &str, data_dir: &Path) -> Result<Self, PSError> {
        let value = value.trim();
        match value {
            "software" => Ok(KeystoreBackend::Software),
            "hardware" => Ok(KeystoreBackend::Hardware),
            "file" => Ok(KeystoreBackend::File {
                directory: data_dir.join("keys"),
            }),
            _ => match value.strip_prefix("file:") {
                Some(dir) if !dir.is_empty() => Ok(KeystoreBackend::File {
                    directory: PathBuf::from(dir),
                }),
                _ => Err(PSError::ConfigError(format!(
                    "{} must be software, hardware, file or file:<dir>, got '{}'",
                    ENV_KEYSTORE, value
                ))),
            },
        }
    }

    /// Short name for logs and reports
    pub fn label(&self) -> &'static str {
        match self {
            KeystoreBackend::Software => "software",
            KeystoreBackend::File { .. } => "file",
            KeystoreBackend::Hardware => "hardware",
        }
    }
}

/// Certificate issuance settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CertificateConfig {
    /// Validity window in days
    pub validity_days: u32,
    /// Operator acknowledgment that a timestamp-derived serial may be used
    /// when the random source fails
    pub allow_degraded_serial: bool,
    /// Default subject common name
    pub common_name: String,
    /// Default subject organization
    pub organization: Option<String>,
    /// Warn during verification when a certificate expires within this many days
    pub expiry_warning_days: u32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            validity_days: 730,
            allow_degraded_serial: false,
            common_name: "provsign Content Signer".to_string(),
            organization: None,
            expiry_warning_days: 30,
        }
    }
}

/// Remote trust-list service settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrustListConfig {
    /// Base URL, e.g. `https://trust.example.org`. `None` disables remote checks.
    pub url: Option<String>,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Cache entry lifetime in seconds
    pub cache_ttl_secs: u64,
    /// Override for the cache file location
    pub cache_path: Option<PathBuf>,
}

impl Default for TrustListConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5_000,
            cache_ttl_secs: 24 * 3600,
            cache_path: None,
        }
    }
}

impl TrustListConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Signing orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SigningConfig {
    /// Claim generator string recorded in every manifest
    pub claim_generator: String,
    /// Include the identity-binding assertion
    pub identity_binding: bool,
    /// Worker threads for batch signing
    pub workers: usize,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            claim_generator: format!("provsign/{}", env!("CARGO_PKG_VERSION")),
            identity_binding: true,
            workers: 2,
        }
    }
}
