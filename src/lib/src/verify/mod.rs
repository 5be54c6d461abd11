//! Verification engine
//!
//! Local verification checks, in order:
//!
//! 1. a manifest is present, embedded or as a `.c2pa` sidecar
//! 2. the recorded hash binding matches the asset bytes
//! 3. the claim signature verifies against the recorded public key
//! 4. the identity content address re-derives from the claim
//!
//! Remote escalation sends a certificate fingerprint to the trust list and
//! nothing else. A remote failure never turns a passing local result into
//! `invalid`.

use crate::audit;
use crate::certificate::Certificate;
use crate::codec::{sidecar_path, ManifestCodec, TrailerCodec};
use crate::error::PSError;
use crate::keys;
use crate::manifest::{hash_asset, Manifest, SIGNATURE_ALGORITHM};
use crate::metrics::global_metrics;
use crate::time::{SystemTimeSource, TimeSource};
use crate::trust::list::TrustList;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Ordered from worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Invalid,
    Untrusted,
    Unknown,
    Trusted,
}

impl TrustLevel {
    pub fn label(&self) -> &'static str {
        match self {
            TrustLevel::Invalid => "invalid",
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Unknown => "unknown",
            TrustLevel::Trusted => "trusted",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationSource {
    Local,
    Remote,
    Cached,
}

impl ValidationSource {
    pub fn label(&self) -> &'static str {
        match self {
            ValidationSource::Local => "local",
            ValidationSource::Remote => "remote",
            ValidationSource::Cached => "cached",
        }
    }
}

/// Where the manifest was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum ManifestLocation {
    Embedded,
    Sidecar(PathBuf),
}

/// A single finding. Errors make the result invalid, warnings do not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// No embedded manifest and no sidecar
    ManifestAbsent,
    MalformedManifest { detail: String },
    /// Asset bytes differ from the bound hash
    HashMismatch { expected: String, actual: String },
    SignatureInvalid { detail: String },
    /// Identity content address does not re-derive from the claim
    ContentAddressMismatch,
    CertificateExpired { not_after: i64 },
    CertificateExpiringSoon { remaining_days: u64 },
    CertificateUnusable { detail: String },
    NoCertificate,
    TrustListUnreachable { detail: String },
    NotOnTrustList { fingerprint: String },
}

impl ValidationIssue {
    /// Stable identifier, matching [`PSError::kind`] where one exists
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationIssue::ManifestAbsent => "manifest_absent",
            ValidationIssue::MalformedManifest { .. } => "malformed_manifest",
            ValidationIssue::HashMismatch { .. } => "hash_mismatch",
            ValidationIssue::SignatureInvalid { .. } => "signature_invalid",
            ValidationIssue::ContentAddressMismatch => "content_address_mismatch",
            ValidationIssue::CertificateExpired { .. } => "certificate_expired",
            ValidationIssue::CertificateExpiringSoon { .. } => "certificate_expiring_soon",
            ValidationIssue::CertificateUnusable { .. } => "certificate_unusable",
            ValidationIssue::NoCertificate => "no_certificate",
            ValidationIssue::TrustListUnreachable { .. } => "trust_list_unreachable",
            ValidationIssue::NotOnTrustList { .. } => "not_on_trust_list",
        }
    }
}

impl ValidationIssue {
    /// Error for callers that treat a failed verification as a failure.
    pub fn to_error(&self) -> PSError {
        match self {
            ValidationIssue::ManifestAbsent => PSError::ManifestAbsent,
            ValidationIssue::HashMismatch { .. } => PSError::HashMismatch,
            ValidationIssue::SignatureInvalid { detail } => PSError::SignatureInvalid(detail.clone()),
            ValidationIssue::TrustListUnreachable { detail } => {
                PSError::TrustListUnreachable(detail.clone())
            }
            other => PSError::MalformedManifest(other.to_string()),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::ManifestAbsent => write!(f, "No manifest found"),
            ValidationIssue::MalformedManifest { detail } => {
                write!(f, "Malformed manifest: {}", detail)
            }
            ValidationIssue::HashMismatch { expected, actual } => write!(
                f,
                "Asset hash mismatch: manifest records {}, asset hashes to {}",
                expected, actual
            ),
            ValidationIssue::SignatureInvalid { detail } => {
                write!(f, "Invalid signature: {}", detail)
            }
            ValidationIssue::ContentAddressMismatch => {
                write!(f, "Identity content address does not match the claim")
            }
            ValidationIssue::CertificateExpired { not_after } => {
                write!(f, "Signing certificate expired at {}", not_after)
            }
            ValidationIssue::CertificateExpiringSoon { remaining_days } => {
                write!(f, "Signing certificate expires in {} days", remaining_days)
            }
            ValidationIssue::CertificateUnusable { detail } => {
                write!(f, "Signing certificate unusable: {}", detail)
            }
            ValidationIssue::NoCertificate => {
                write!(f, "Manifest carries no certificate, signer trust cannot be checked")
            }
            ValidationIssue::TrustListUnreachable { detail } => {
                write!(f, "Trust list unreachable: {}", detail)
            }
            ValidationIssue::NotOnTrustList { fingerprint } => {
                write!(f, "Certificate {} is not on the trust list", fingerprint)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub trust_level: TrustLevel,
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub source: ValidationSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<ManifestLocation>,
    /// SHA-256 hex of the signing certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_fingerprint: Option<String>,
}

impl ValidationResult {
    fn invalid(issue: ValidationIssue, location: Option<ManifestLocation>) -> Self {
        Self {
            trust_level: TrustLevel::Invalid,
            is_valid: false,
            errors: vec![issue],
            warnings: Vec::new(),
            source: ValidationSource::Local,
            location,
            certificate_fingerprint: None,
        }
    }

    /// Whether an error of `kind` was reported
    pub fn has_error(&self, kind: &str) -> bool {
        self.errors.iter().any(|e| e.kind() == kind)
    }

    pub fn has_warning(&self, kind: &str) -> bool {
        self.warnings.iter().any(|w| w.kind() == kind)
    }
}

pub struct Verifier {
    codec: Arc<dyn ManifestCodec>,
    trust_list: Option<Arc<TrustList>>,
    time: Arc<dyn TimeSource>,
    expiry_warning_secs: u64,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(Arc::new(TrailerCodec::new()))
    }
}

impl Verifier {
    pub fn new(codec: Arc<dyn ManifestCodec>) -> Self {
        Self {
            codec,
            trust_list: None,
            time: Arc::new(SystemTimeSource),
            expiry_warning_secs: 30 * 86_400,
        }
    }

    pub fn with_trust_list(mut self, trust_list: Arc<TrustList>) -> Self {
        self.trust_list = Some(trust_list);
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Warn when the signing certificate expires within `days`.
    pub fn with_expiry_warning_days(mut self, days: u32) -> Self {
        self.expiry_warning_secs = u64::from(days) * 86_400;
        self
    }

    /// Verify `asset` without any network access.
    ///
    /// `Err` only when the asset itself cannot be read. A passing result has
    /// trust level `unknown`.
    pub fn verify_local(&self, asset: &Path) -> Result<ValidationResult, PSError> {
        let metrics = global_metrics();
        let timer = metrics.start_verification();
        let correlation_id = audit::new_correlation_id();
        let asset_hash = hash_asset(asset, &[])?;
        audit::log_verification_attempt(&correlation_id, &asset_hash, false);

        let result = self.check_local(asset)?;
        metrics.record_verification(result.trust_level.label(), timer);
        log_outcome(&correlation_id, &asset_hash, &result);
        Ok(result)
    }

    /// Local verification, then a trust-list lookup when it passed and
    /// `allow_remote` is set.
    pub fn verify_with_trust_list(
        &self,
        asset: &Path,
        allow_remote: bool,
    ) -> Result<ValidationResult, PSError> {
        let metrics = global_metrics();
        let timer = metrics.start_verification();
        let correlation_id = audit::new_correlation_id();
        let asset_hash = hash_asset(asset, &[])?;
        audit::log_verification_attempt(&correlation_id, &asset_hash, allow_remote);

        let mut result = self.check_local(asset)?;
        if result.is_valid && allow_remote {
            self.escalate(asset, &mut result);
        }
        metrics.record_verification(result.trust_level.label(), timer);
        log_outcome(&correlation_id, &asset_hash, &result);
        Ok(result)
    }

    fn escalate(&self, asset: &Path, result: &mut ValidationResult) {
        let Some(trust_list) = &self.trust_list else {
            log::debug!("No trust list configured, keeping local verdict");
            return;
        };
        let Some(fingerprint) = result.certificate_fingerprint.clone() else {
            result.warnings.push(ValidationIssue::NoCertificate);
            return;
        };

        match trust_list.check(&fingerprint) {
            Ok(verdict) => {
                result.source = if verdict.from_cache {
                    ValidationSource::Cached
                } else {
                    ValidationSource::Remote
                };
                if verdict.trusted {
                    result.trust_level = TrustLevel::Trusted;
                } else {
                    result.trust_level = TrustLevel::Untrusted;
                    result
                        .warnings
                        .push(ValidationIssue::NotOnTrustList { fingerprint });
                }
            }
            Err(e) => {
                log::warn!("Trust list lookup failed, trust stays unknown: {}", e);
                trust_list.record_pending(&fingerprint, &asset.display().to_string(), e.kind());
                result.trust_level = TrustLevel::Unknown;
                result.warnings.push(ValidationIssue::TrustListUnreachable {
                    detail: e.to_string(),
                });
            }
        }
    }

    /// Embedded manifest first, then the sidecar. A damaged container
    /// still defers to a sidecar; without one the damage is reported.
    fn locate(&self, asset: &Path) -> Result<Option<(Vec<u8>, ManifestLocation)>, ValidationIssue> {
        let mut embedded_issue = None;
        match self.codec.read_manifest(asset) {
            Ok(Some(bytes)) => return Ok(Some((bytes, ManifestLocation::Embedded))),
            Ok(None) => {}
            Err(PSError::MalformedManifest(detail)) => {
                log::debug!("Damaged container in {}: {}", asset.display(), detail);
                embedded_issue = Some(ValidationIssue::MalformedManifest { detail });
            }
            Err(e) => log::debug!("No embedded manifest in {}: {}", asset.display(), e),
        }
        let sidecar = sidecar_path(asset);
        if !sidecar.is_file() {
            return match embedded_issue {
                Some(issue) => Err(issue),
                None => Ok(None),
            };
        }
        std::fs::read(&sidecar)
            .map(|bytes| Some((bytes, ManifestLocation::Sidecar(sidecar))))
            .map_err(|e| ValidationIssue::MalformedManifest {
                detail: format!("Cannot read sidecar: {}", e),
            })
    }

    fn check_local(&self, asset: &Path) -> Result<ValidationResult, PSError> {
        if !asset.is_file() {
            return Err(PSError::IOError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a file", asset.display()),
            )));
        }

        let (bytes, location) = match self.locate(asset) {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(ValidationResult::invalid(ValidationIssue::ManifestAbsent, None)),
            Err(issue) => return Ok(ValidationResult::invalid(issue, None)),
        };
        let manifest = match Manifest::from_bytes(&bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                return Ok(ValidationResult::invalid(
                    ValidationIssue::MalformedManifest {
                        detail: e.to_string(),
                    },
                    Some(location),
                ));
            }
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Some(issue) = self.check_hash(asset, &manifest, &location)? {
            errors.push(issue);
        }

        let certificate = match check_signature(&manifest) {
            Ok(certificate) => certificate,
            Err(issue) => {
                errors.push(issue);
                None
            }
        };

        if let Some(identity) = manifest.identity() {
            match manifest.compute_content_address() {
                Ok(address) if address == identity.content_address => {}
                Ok(_) => errors.push(ValidationIssue::ContentAddressMismatch),
                Err(e) => errors.push(ValidationIssue::MalformedManifest {
                    detail: e.to_string(),
                }),
            }
        }

        let now = self.time.now_unix()? as i64;
        if let Some(cert) = &certificate {
            if cert.is_expired_at(now) {
                warnings.push(ValidationIssue::CertificateExpired {
                    not_after: cert.not_after,
                });
            } else if !cert.is_valid_at(now) {
                warnings.push(ValidationIssue::CertificateUnusable {
                    detail: "not yet valid".to_string(),
                });
            } else if cert.remaining_secs(now) < self.expiry_warning_secs {
                warnings.push(ValidationIssue::CertificateExpiringSoon {
                    remaining_days: cert.remaining_secs(now) / 86_400,
                });
            }
            if !cert.allows_claim_signing() {
                warnings.push(ValidationIssue::CertificateUnusable {
                    detail: "missing claim-signing extended key usage".to_string(),
                });
            }
        }

        let is_valid = errors.is_empty();
        Ok(ValidationResult {
            trust_level: if is_valid {
                TrustLevel::Unknown
            } else {
                TrustLevel::Invalid
            },
            is_valid,
            errors,
            warnings,
            source: ValidationSource::Local,
            location: Some(location),
            certificate_fingerprint: certificate.as_ref().map(Certificate::fingerprint),
        })
    }

    fn check_hash(
        &self,
        asset: &Path,
        manifest: &Manifest,
        location: &ManifestLocation,
    ) -> Result<Option<ValidationIssue>, PSError> {
        let Some(binding) = manifest.hash_binding() else {
            return Ok(Some(ValidationIssue::MalformedManifest {
                detail: "no hash binding".to_string(),
            }));
        };
        let Some(expected) = &binding.hash else {
            return Ok(Some(ValidationIssue::MalformedManifest {
                detail: "hash binding was never bound".to_string(),
            }));
        };

        // An embedded manifest excludes exactly the region the container
        // occupies; a sidecar binds the whole asset
        let exclusions_match = match location {
            ManifestLocation::Embedded => binding.exclusions == [self.codec.exclusion(asset)?],
            ManifestLocation::Sidecar(_) => binding.exclusions.is_empty(),
        };
        if !exclusions_match {
            return Ok(Some(ValidationIssue::HashMismatch {
                expected: expected.clone(),
                actual: match location {
                    ManifestLocation::Embedded => "excluded region does not match the container",
                    ManifestLocation::Sidecar(_) => "sidecar manifest excludes asset bytes",
                }
                .to_string(),
            }));
        }

        let actual = hash_asset(asset, &binding.exclusions)?;
        if actual.eq_ignore_ascii_case(expected) {
            Ok(None)
        } else {
            Ok(Some(ValidationIssue::HashMismatch {
                expected: expected.clone(),
                actual,
            }))
        }
    }
}

/// Verify the claim signature and return the accompanying certificate.
fn check_signature(manifest: &Manifest) -> Result<Option<Certificate>, ValidationIssue> {
    let invalid = |detail: &str| ValidationIssue::SignatureInvalid {
        detail: detail.to_string(),
    };
    let signature = manifest.signature().ok_or_else(|| invalid("manifest is unsigned"))?;
    if signature.alg != SIGNATURE_ALGORITHM {
        return Err(invalid(&format!("unsupported algorithm {}", signature.alg)));
    }
    let value = signature
        .signature_bytes()
        .map_err(|e| invalid(&e.to_string()))?;
    let payload = manifest
        .claim_bytes()
        .map_err(|e| invalid(&e.to_string()))?;
    if !keys::verify(&payload, &value, &signature.public_key.to_bytes()) {
        return Err(invalid("signature does not match the claim"));
    }

    if let Some(identity) = manifest.identity() {
        if identity.signer_public_key != signature.public_key {
            return Err(invalid("identity binding names a different signer"));
        }
    }

    let der = signature
        .certificate_der()
        .map_err(|e| invalid(&e.to_string()))?;
    let Some(der) = der else {
        return Ok(None);
    };
    let certificate = Certificate::from_der(&der).map_err(|e| invalid(&e.to_string()))?;
    if certificate.public_key != signature.public_key {
        return Err(invalid("certificate key does not match the signer"));
    }
    Ok(Some(certificate))
}

fn log_outcome(correlation_id: &str, asset_hash: &str, result: &ValidationResult) {
    if result.is_valid {
        audit::log_verification_success(
            correlation_id,
            asset_hash,
            result.trust_level.label(),
            result.source.label(),
        );
    } else {
        let kind = result.errors.first().map_or("unknown", ValidationIssue::kind);
        let message = result
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        audit::log_verification_failure(correlation_id, asset_hash, kind, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{CertificateIssuer, SubjectAttributes};
    use crate::config::CertificateConfig;
    use crate::keys::{KeyManager, MemoryIdentityStore};
    use crate::manifest::{Assembler, CaptureContext};
    use crate::platform::software::SoftwareProvider;
    use crate::sanitize::{MetadataValue, RawMetadata};
    use crate::signing::{SigningOrchestrator, SigningRequest, SigningResult};
    use crate::time::FixedTimeSource;
    use crate::trust::cache::TrustListCache;
    use crate::trust::list::{TrustListClient, TrustListMetadata};
    use crate::trust::pending::PendingHistory;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const JAN_2026: u64 = 1_767_225_600;
    const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0, 16, b'J', b'F', b'I', b'F', 1, 2, 3, 0xff, 0xd9];

    fn time() -> Arc<dyn TimeSource> {
        Arc::new(FixedTimeSource::from_unix_secs(JAN_2026))
    }

    fn sign(name: &str, data: &[u8], format: &str) -> (TempDir, PathBuf) {
        let mut metadata = RawMetadata::new();
        metadata.insert("Orientation", MetadataValue::Integer(1));
        sign_metadata(name, data, format, metadata)
    }

    fn sign_metadata(
        name: &str,
        data: &[u8],
        format: &str,
        metadata: RawMetadata,
    ) -> (TempDir, PathBuf) {
        let keys = KeyManager::with_provider(
            Arc::new(SoftwareProvider::new()),
            Box::new(MemoryIdentityStore::new()),
            time(),
        )
        .unwrap();
        keys.generate_key_pair().unwrap();
        let certificate = CertificateIssuer::new(&CertificateConfig::default())
            .with_time_source(time())
            .generate_self_signed_certificate(&keys.signer().unwrap(), &SubjectAttributes::new("Test"))
            .unwrap();
        let orchestrator = SigningOrchestrator::new(
            Arc::new(keys),
            Arc::new(TrailerCodec::new()),
            Assembler::new("provsign/test"),
        )
        .with_certificate(certificate);

        let dir = tempdir().unwrap();
        let asset = dir.path().join(name);
        std::fs::write(&asset, data).unwrap();
        let context = CaptureContext::new(name, format, Utc.timestamp_opt(JAN_2026 as i64, 0).unwrap());
        let result = orchestrator
            .sign(&SigningRequest::new(&asset, metadata, context))
            .unwrap();
        assert!(matches!(result, SigningResult::Success { .. }));
        (dir, asset)
    }

    fn verifier() -> Verifier {
        Verifier::default().with_time_source(time())
    }

    #[test]
    fn test_embedded_round_trip() {
        let (_dir, asset) = sign("a.jpg", JPEG, "image/jpeg");
        let result = verifier().verify_local(&asset).unwrap();
        assert!(result.is_valid, "{:?}", result.errors);
        assert_eq!(result.trust_level, TrustLevel::Unknown);
        assert_eq!(result.source, ValidationSource::Local);
        assert_eq!(result.location, Some(ManifestLocation::Embedded));
        assert!(result.certificate_fingerprint.is_some());
    }

    #[test]
    fn test_sidecar_round_trip() {
        let (_dir, asset) = sign("a.heic", b"\0\0\0\x18ftypheic-data", "image/heic");
        let result = verifier().verify_local(&asset).unwrap();
        assert!(result.is_valid, "{:?}", result.errors);
        assert!(matches!(result.location, Some(ManifestLocation::Sidecar(_))));
    }

    #[test]
    fn test_float_metadata_round_trip() {
        let mut metadata = RawMetadata::new();
        metadata
            .insert("ExposureTime", MetadataValue::Float(1.0 / 11.0))
            .insert("FNumber", MetadataValue::Float(1.0715660391465826e-75))
            .insert("Make", MetadataValue::Text("Cam \\ \"One\"\t\u{e9}".to_string()));
        let (_dir, asset) = sign_metadata("f.jpg", JPEG, "image/jpeg", metadata);
        let result = verifier().verify_local(&asset).unwrap();
        assert!(result.is_valid, "{:?}", result.errors);
    }

    #[test]
    fn test_damaged_container_defers_to_sidecar() {
        let mut damaged = JPEG.to_vec();
        damaged.extend_from_slice(&u64::MAX.to_be_bytes());
        damaged.extend_from_slice(b"PSMANIF1");
        let (_dir, asset) = sign("d.jpg", &damaged, "image/jpeg");
        assert!(sidecar_path(&asset).is_file());

        let result = verifier().verify_local(&asset).unwrap();
        assert!(result.is_valid, "{:?}", result.errors);
        assert!(matches!(result.location, Some(ManifestLocation::Sidecar(_))));

        std::fs::remove_file(sidecar_path(&asset)).unwrap();
        let result = verifier().verify_local(&asset).unwrap();
        assert_eq!(result.trust_level, TrustLevel::Invalid);
        assert!(result.has_error("malformed_manifest"));
    }

    #[test]
    fn test_sidecar_exclusions_are_rejected() {
        let (_dir, asset) = sign("a.heic", b"\0\0\0\x18ftypheic-data", "image/heic");
        let sidecar = sidecar_path(&asset);
        let manifest = Manifest::from_bytes(&std::fs::read(&sidecar).unwrap()).unwrap();
        // Exclude every byte so any asset content matches the digest
        let everything = [crate::manifest::Exclusion::to_end(0)];
        let rebound = manifest
            .bind_hash(&hash_asset(&asset, &everything).unwrap(), &everything)
            .unwrap();
        std::fs::write(&sidecar, rebound.to_bytes().unwrap()).unwrap();

        let result = verifier().verify_local(&asset).unwrap();
        assert!(!result.is_valid);
        assert!(result.has_error("hash_mismatch"));
    }

    #[test]
    fn test_flipped_byte_is_invalid() {
        let (_dir, asset) = sign("a.jpg", JPEG, "image/jpeg");
        let mut data = std::fs::read(&asset).unwrap();
        data[11] ^= 0x01;
        std::fs::write(&asset, data).unwrap();

        let result = verifier().verify_local(&asset).unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.trust_level, TrustLevel::Invalid);
        assert!(result.has_error("hash_mismatch"));
    }

    #[test]
    fn test_stripped_manifest_is_absent() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("plain.jpg");
        std::fs::write(&asset, JPEG).unwrap();

        let result = verifier().verify_local(&asset).unwrap();
        assert_eq!(result.trust_level, TrustLevel::Invalid);
        assert_eq!(result.errors, vec![ValidationIssue::ManifestAbsent]);
    }

    #[test]
    fn test_tampered_claim_breaks_signature() {
        let (_dir, asset) = sign("a.heic", b"\0\0\0\x18ftypheic-data", "image/heic");
        let sidecar = sidecar_path(&asset);
        let text = std::fs::read_to_string(&sidecar).unwrap();
        std::fs::write(&sidecar, text.replace("provsign/test", "provsign/evil")).unwrap();

        let result = verifier().verify_local(&asset).unwrap();
        assert!(!result.is_valid);
        assert!(result.has_error("signature_invalid"));
    }

    #[test]
    fn test_garbage_sidecar_is_malformed() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.heic");
        std::fs::write(&asset, b"data").unwrap();
        std::fs::write(sidecar_path(&asset), b"{not json").unwrap();

        let result = verifier().verify_local(&asset).unwrap();
        assert!(result.has_error("malformed_manifest"));
    }

    #[test]
    fn test_expired_certificate_is_a_warning() {
        let (_dir, asset) = sign("a.jpg", JPEG, "image/jpeg");
        let far_future = Arc::new(FixedTimeSource::from_unix_secs(JAN_2026 + 100 * 365 * 86_400));
        let result = Verifier::default()
            .with_time_source(far_future)
            .verify_local(&asset)
            .unwrap();
        assert!(result.is_valid);
        assert!(result.has_warning("certificate_expired"));
    }

    #[test]
    fn test_expiring_certificate_is_a_warning() {
        let (_dir, asset) = sign("a.jpg", JPEG, "image/jpeg");
        // Default validity is 730 days
        let almost = Arc::new(FixedTimeSource::from_unix_secs(JAN_2026 + 720 * 86_400));
        let result = Verifier::default()
            .with_time_source(almost)
            .verify_local(&asset)
            .unwrap();
        assert!(result.is_valid);
        assert!(result.has_warning("certificate_expiring_soon"));
        assert!(!result.has_warning("certificate_expired"));
    }

    #[test]
    fn test_missing_asset_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(verifier().verify_local(&dir.path().join("nope.jpg")).is_err());
    }

    struct FakeClient {
        trusted: Option<bool>,
        calls: Arc<AtomicUsize>,
    }

    impl TrustListClient for FakeClient {
        fn fetch_metadata(&self) -> Result<TrustListMetadata, PSError> {
            Ok(TrustListMetadata::default())
        }

        fn validate_fingerprint(&self, fingerprint: &str) -> Result<bool, PSError> {
            assert_eq!(fingerprint.len(), 64);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.trusted
                .ok_or_else(|| PSError::TrustListUnreachable("timed out".to_string()))
        }
    }

    fn trust_list(trusted: Option<bool>, calls: Arc<AtomicUsize>) -> Arc<TrustList> {
        Arc::new(TrustList::new(
            Some(Box::new(FakeClient { trusted, calls })),
            TrustListCache::in_memory(Duration::from_secs(3600), time()),
            PendingHistory::in_memory(),
            time(),
        ))
    }

    #[test]
    fn test_remote_trusted_then_cached() {
        let (_dir, asset) = sign("a.jpg", JPEG, "image/jpeg");
        let calls = Arc::new(AtomicUsize::new(0));
        let verifier = verifier().with_trust_list(trust_list(Some(true), Arc::clone(&calls)));

        let first = verifier.verify_with_trust_list(&asset, true).unwrap();
        assert_eq!(first.trust_level, TrustLevel::Trusted);
        assert_eq!(first.source, ValidationSource::Remote);

        let second = verifier.verify_with_trust_list(&asset, true).unwrap();
        assert_eq!(second.source, ValidationSource::Cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remote_untrusted() {
        let (_dir, asset) = sign("a.jpg", JPEG, "image/jpeg");
        let verifier = verifier().with_trust_list(trust_list(Some(false), Arc::default()));
        let result = verifier.verify_with_trust_list(&asset, true).unwrap();
        assert!(result.is_valid);
        assert_eq!(result.trust_level, TrustLevel::Untrusted);
        assert!(result.has_warning("not_on_trust_list"));
    }

    #[test]
    fn test_remote_failure_keeps_local_verdict() {
        let (_dir, asset) = sign("a.jpg", JPEG, "image/jpeg");
        let list = trust_list(None, Arc::default());
        let verifier = verifier().with_trust_list(Arc::clone(&list));

        let result = verifier.verify_with_trust_list(&asset, true).unwrap();
        assert!(result.is_valid);
        assert_eq!(result.trust_level, TrustLevel::Unknown);
        assert_eq!(result.source, ValidationSource::Local);
        assert!(result.has_warning("trust_list_unreachable"));
        assert_eq!(list.pending().len(), 1);
    }

    #[test]
    fn test_no_escalation_when_local_fails_or_disallowed() {
        let (_dir, asset) = sign("a.jpg", JPEG, "image/jpeg");
        let calls = Arc::new(AtomicUsize::new(0));
        let verifier = verifier().with_trust_list(trust_list(Some(true), Arc::clone(&calls)));

        let result = verifier.verify_with_trust_list(&asset, false).unwrap();
        assert_eq!(result.trust_level, TrustLevel::Unknown);

        let mut data = std::fs::read(&asset).unwrap();
        data[2] ^= 0xff;
        std::fs::write(&asset, data).unwrap();
        let result = verifier.verify_with_trust_list(&asset, true).unwrap();
        assert_eq!(result.trust_level, TrustLevel::Invalid);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_trust_level_ordering() {
        assert!(TrustLevel::Invalid < TrustLevel::Untrusted);
        assert!(TrustLevel::Untrusted < TrustLevel::Unknown);
        assert!(TrustLevel::Unknown < TrustLevel::Trusted);
    }
}
