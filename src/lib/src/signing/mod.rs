//! Signing orchestration
//!
//! Per asset:
//!
//! ```text
//! Assembled ──► HashBound ──► EmbedAttempted ──► Embedded
//!                                   │
//!                                   └──► SidecarAttempted ──► SidecarWritten | Failed
//! ```
//!
//! Embedding is attempted only for formats the codec supports. Any
//! recoverable embed failure falls back to a sidecar next to the asset.
//! Identity and certificate failures end the attempt immediately and are
//! never retried with another key or strategy.
//!
//! Every write goes to a temporary sibling that is renamed into place, so an
//! aborted attempt leaves the original asset untouched.

use crate::audit;
use crate::certificate::Certificate;
use crate::codec::{sidecar_path, ManifestCodec, TrailerCodec};
use crate::config::PipelineConfig;
use crate::error::PSError;
use crate::keys::{KeyManager, PublicKey};
use crate::manifest::{hash_asset, Assembler, CaptureContext, Exclusion, KeyInfo, Manifest};
use crate::metrics::global_metrics;
use crate::sanitize::{sanitize, RawMetadata, SanitizationPolicy};
use crate::secure_file::TempFileGuard;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Where the manifest ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningStrategy {
    Embedded,
    Sidecar,
}

impl SigningStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            SigningStrategy::Embedded => "embedded",
            SigningStrategy::Sidecar => "sidecar",
        }
    }
}

impl fmt::Display for SigningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Step of a signing attempt, used to label failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningStage {
    Sanitize,
    Assemble,
    Hash,
    Sign,
    Embed,
    Sidecar,
}

impl SigningStage {
    pub fn label(&self) -> &'static str {
        match self {
            SigningStage::Sanitize => "sanitize",
            SigningStage::Assemble => "assemble",
            SigningStage::Hash => "hash",
            SigningStage::Sign => "sign",
            SigningStage::Embed => "embed",
            SigningStage::Sidecar => "sidecar",
        }
    }
}

struct StageError {
    stage: SigningStage,
    error: PSError,
}

impl StageError {
    fn at(stage: SigningStage) -> impl FnOnce(PSError) -> StageError {
        move |error| StageError { stage, error }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage.label(), self.error)
    }
}

/// One asset to sign
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub asset: PathBuf,
    pub metadata: RawMetadata,
    pub context: CaptureContext,
    /// Destination of the embedded asset; the asset itself when unset
    pub output: Option<PathBuf>,
}

impl SigningRequest {
    pub fn new(asset: impl Into<PathBuf>, metadata: RawMetadata, context: CaptureContext) -> Self {
        Self {
            asset: asset.into(),
            metadata,
            context,
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Outcome of a signing attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SigningResult {
    Success {
        strategy: SigningStrategy,
        artifact: PathBuf,
        manifest: Manifest,
    },
    /// Errors from every attempted strategy, in attempt order, each
    /// prefixed with the failing stage
    Failure { errors: Vec<String> },
}

impl SigningResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SigningResult::Success { .. })
    }

    pub fn strategy(&self) -> Option<SigningStrategy> {
        match self {
            SigningResult::Success { strategy, .. } => Some(*strategy),
            SigningResult::Failure { .. } => None,
        }
    }
}

/// Removes the asset from the in-flight set on drop
/// Paths held by one signing attempt: the asset and, when it differs, the
/// output it writes.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<PathBuf>>,
    keys: Vec<PathBuf>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            set.remove(key);
        }
    }
}

/// Canonical form of `path`, which may not exist yet.
fn lock_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

pub struct SigningOrchestrator {
    keys: Arc<KeyManager>,
    codec: Arc<dyn ManifestCodec>,
    assembler: Assembler,
    policy: SanitizationPolicy,
    certificate: Option<Certificate>,
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl SigningOrchestrator {
    pub fn new(keys: Arc<KeyManager>, codec: Arc<dyn ManifestCodec>, assembler: Assembler) -> Self {
        Self {
            keys,
            codec,
            assembler,
            policy: SanitizationPolicy::default(),
            certificate: None,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Orchestrator with the trailer codec and the configured claim
    /// generator and sanitization policy.
    pub fn from_config(config: &PipelineConfig, keys: Arc<KeyManager>) -> Self {
        let assembler = Assembler::new(config.signing.claim_generator.clone())
            .with_identity_binding(config.signing.identity_binding);
        Self::new(keys, Arc::new(TrailerCodec::new()), assembler)
            .with_policy(config.sanitization.clone())
    }

    pub fn with_policy(mut self, policy: SanitizationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Certificate embedded in every signature.
    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    /// Sign one asset.
    ///
    /// `Err` is reserved for failures that must not fall back: a concurrent
    /// attempt on the same asset, identity-layer and certificate errors.
    pub fn sign(&self, request: &SigningRequest) -> Result<SigningResult, PSError> {
        let _in_flight = self.claim(request)?;
        let metrics = global_metrics();
        let timer = metrics.start_signing();
        let correlation_id = audit::new_correlation_id();

        let key_pair = self.keys.current_key_pair()?.ok_or(PSError::PrivateKeyNotFound)?;
        let key_id = key_pair.key_id();
        let fingerprint = self.certificate.as_ref().map(Certificate::fingerprint);
        if let Some(cert) = &self.certificate {
            if cert.public_key != key_pair.public_key {
                return Err(PSError::CertificateGenerationFailed(
                    "Certificate does not match the current signing key".to_string(),
                ));
            }
        }

        let asset_hash = match hash_asset(&request.asset, &[]) {
            Ok(hash) => hash,
            Err(e) => {
                let failure = StageError::at(SigningStage::Hash)(e);
                return Ok(self.fail(&correlation_id, "unreadable", vec![failure]));
            }
        };
        audit::log_signing_attempt(&correlation_id, &asset_hash, Some(&key_id));

        let manifest = match self.prepare(request, KeyInfo {
            public_key: key_pair.public_key,
            certificate_fingerprint: fingerprint.clone(),
        }) {
            Ok(manifest) => manifest,
            Err(failure) => return Ok(self.fail(&correlation_id, &asset_hash, vec![failure])),
        };

        let mut failures = Vec::new();
        if self.codec.supports(&request.context.format) {
            match self.embed(request, &manifest, key_pair.public_key, &asset_hash) {
                Ok((artifact, signed)) => {
                    return Ok(self.succeed(
                        SigningStrategy::Embedded,
                        artifact,
                        signed,
                        &correlation_id,
                        &asset_hash,
                        fingerprint.as_deref(),
                        timer,
                    ));
                }
                Err(failure) if is_fatal(&failure.error) => return Err(failure.error),
                Err(failure) => {
                    log::warn!(
                        "Embedding into {} failed, falling back to sidecar: {}",
                        request.asset.display(),
                        failure
                    );
                    failures.push(failure);
                }
            }
        } else {
            log::debug!(
                "Codec {} does not support {}, writing sidecar",
                self.codec.name(),
                request.context.format
            );
        }

        match self.sidecar(request, &manifest, key_pair.public_key, &asset_hash) {
            Ok((artifact, signed)) => Ok(self.succeed(
                SigningStrategy::Sidecar,
                artifact,
                signed,
                &correlation_id,
                &asset_hash,
                fingerprint.as_deref(),
                timer,
            )),
            Err(failure) if is_fatal(&failure.error) => Err(failure.error),
            Err(failure) => {
                failures.push(failure);
                Ok(self.fail(&correlation_id, &asset_hash, failures))
            }
        }
    }

    /// Sign several assets on `workers` scoped threads. Results are in
    /// request order.
    pub fn sign_batch(
        &self,
        requests: &[SigningRequest],
        workers: usize,
    ) -> Vec<Result<SigningResult, PSError>> {
        let workers = workers.clamp(1, requests.len().max(1));
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<Option<Result<SigningResult, PSError>>>> =
            Mutex::new((0..requests.len()).map(|_| None).collect());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(request) = requests.get(index) else {
                            break;
                        };
                        let result = self.sign(request);
                        results.lock().unwrap_or_else(|e| e.into_inner())[index] = Some(result);
                    }
                });
            }
        });

        results
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(PSError::InternalError("Batch slot not filled".to_string()))))
            .collect()
    }

    fn claim(&self, request: &SigningRequest) -> Result<InFlight<'_>, PSError> {
        let mut keys = vec![lock_key(&request.asset)];
        if let Some(output) = &request.output {
            let output = lock_key(output);
            if output != keys[0] {
                keys.push(output);
            }
        }
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = keys.iter().find(|key| set.contains(*key)) {
            return Err(PSError::SigningInProgress(busy.display().to_string()));
        }
        set.extend(keys.iter().cloned());
        Ok(InFlight {
            set: &self.in_flight,
            keys,
        })
    }

    fn prepare(&self, request: &SigningRequest, key_info: KeyInfo) -> Result<Manifest, StageError> {
        let sanitized =
            sanitize(&request.metadata, &self.policy).map_err(StageError::at(SigningStage::Sanitize))?;
        self.assembler
            .assemble(&sanitized, &request.context, Some(&key_info))
            .map_err(StageError::at(SigningStage::Assemble))
    }

    /// Bind `digest`, sign, and serialize.
    fn bind_and_sign(
        &self,
        manifest: &Manifest,
        public_key: PublicKey,
        digest: &str,
        exclusions: &[Exclusion],
    ) -> Result<Manifest, StageError> {
        let bound = manifest
            .bind_hash(digest, exclusions)
            .map_err(StageError::at(SigningStage::Hash))?;
        bound
            .sign_with(
                public_key,
                self.certificate.as_ref().map(Certificate::der),
                |payload| self.keys.sign(payload),
            )
            .map_err(StageError::at(SigningStage::Sign))
    }

    fn embed(
        &self,
        request: &SigningRequest,
        manifest: &Manifest,
        signer: PublicKey,
        full_hash: &str,
    ) -> Result<(PathBuf, Manifest), StageError> {
        let exclusion = self
            .codec
            .exclusion(&request.asset)
            .map_err(StageError::at(SigningStage::Hash))?;
        let asset_len = std::fs::metadata(&request.asset)
            .map_err(|e| StageError::at(SigningStage::Hash)(e.into()))?
            .len();
        // Without a previous manifest the excluded region starts at EOF
        let digest = if exclusion.start == asset_len {
            full_hash.to_string()
        } else {
            hash_asset(&request.asset, &[exclusion]).map_err(StageError::at(SigningStage::Hash))?
        };
        let signed = self.bind_and_sign(manifest, signer, &digest, &[exclusion])?;
        let bytes = signed.to_bytes().map_err(StageError::at(SigningStage::Embed))?;

        let destination = request.output.clone().unwrap_or_else(|| request.asset.clone());
        let temp = TempFileGuard::new_for(&destination).map_err(StageError::at(SigningStage::Embed))?;
        self.codec
            .embed(&bytes, &request.asset, temp.path())
            .map_err(|e| match e {
                PSError::EmbedFailed(_) => e,
                other => PSError::EmbedFailed(other.to_string()),
            })
            .map_err(StageError::at(SigningStage::Embed))?;
        temp.commit().map_err(StageError::at(SigningStage::Embed))?;
        Ok((destination, signed))
    }

    fn sidecar(
        &self,
        request: &SigningRequest,
        manifest: &Manifest,
        signer: PublicKey,
        full_hash: &str,
    ) -> Result<(PathBuf, Manifest), StageError> {
        let signed = self.bind_and_sign(manifest, signer, full_hash, &[])?;
        let write = || -> Result<PathBuf, PSError> {
            let bytes = signed.to_bytes()?;
            let path = sidecar_path(&request.asset);
            let temp = TempFileGuard::new_for(&path)?;
            {
                let mut file = File::create(temp.path())?;
                file.write_all(&bytes)?;
                file.sync_all()?;
            }
            temp.commit()?;
            Ok(path)
        };
        let path = write()
            .map_err(|e| PSError::SidecarFailed(e.to_string()))
            .map_err(StageError::at(SigningStage::Sidecar))?;
        Ok((path, signed))
    }

    #[allow(clippy::too_many_arguments)]
    fn succeed(
        &self,
        strategy: SigningStrategy,
        artifact: PathBuf,
        manifest: Manifest,
        correlation_id: &str,
        asset_hash: &str,
        fingerprint: Option<&str>,
        timer: crate::metrics::OperationTimer,
    ) -> SigningResult {
        global_metrics().record_signing_success(strategy.label(), timer);
        audit::log_signing_success(correlation_id, asset_hash, strategy.label(), fingerprint);
        log::info!("Signed {} ({})", artifact.display(), strategy);
        SigningResult::Success {
            strategy,
            artifact,
            manifest,
        }
    }

    fn fail(&self, correlation_id: &str, asset_hash: &str, failures: Vec<StageError>) -> SigningResult {
        let metrics = global_metrics();
        for failure in &failures {
            metrics.record_signing_failure(failure.stage.label());
        }
        let errors: Vec<String> = failures.iter().map(ToString::to_string).collect();
        let error_type = failures.last().map_or("unknown", |f| f.error.kind());
        audit::log_signing_failure(correlation_id, asset_hash, error_type, &errors.join("; "));
        log::warn!("Signing failed: {}", errors.join("; "));
        SigningResult::Failure { errors }
    }
}

/// Failures that must surface instead of triggering the fallback
fn is_fatal(error: &PSError) -> bool {
    error.is_identity_failure() || matches!(error, PSError::CertificateGenerationFailed(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MemoryIdentityStore;
    use crate::platform::software::SoftwareProvider;
    use crate::platform::{GatedProvider, PresenceGate};
    use crate::sanitize::MetadataValue;
    use crate::time::FixedTimeSource;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    const JAN_2026: u64 = 1_767_225_600;
    const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0, 16, b'J', b'F', b'I', b'F', 0xff, 0xd9];

    fn keys() -> Arc<KeyManager> {
        let keys = KeyManager::with_provider(
            Arc::new(SoftwareProvider::new()),
            Box::new(MemoryIdentityStore::new()),
            Arc::new(FixedTimeSource::from_unix_secs(JAN_2026)),
        )
        .unwrap();
        keys.generate_key_pair().unwrap();
        Arc::new(keys)
    }

    fn orchestrator() -> SigningOrchestrator {
        SigningOrchestrator::new(keys(), Arc::new(TrailerCodec::new()), Assembler::new("provsign/test"))
    }

    fn request(asset: &Path, format: &str) -> SigningRequest {
        let mut metadata = RawMetadata::new();
        metadata.insert("Orientation", MetadataValue::Integer(1));
        metadata.insert("GPSLatitude", MetadataValue::Float(1.5));
        let context = CaptureContext::new(
            asset.file_name().unwrap().to_string_lossy(),
            format,
            Utc.timestamp_opt(JAN_2026 as i64, 0).unwrap(),
        );
        SigningRequest::new(asset, metadata, context)
    }

    #[test]
    fn test_embedded_signing() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.jpg");
        std::fs::write(&asset, JPEG).unwrap();

        let result = orchestrator().sign(&request(&asset, "image/jpeg")).unwrap();
        let SigningResult::Success { strategy, artifact, manifest } = result else {
            panic!("signing failed");
        };
        assert_eq!(strategy, SigningStrategy::Embedded);
        assert_eq!(artifact, asset);
        assert!(std::fs::read(&asset).unwrap().starts_with(JPEG));
        assert!(TrailerCodec::new().read_manifest(&asset).unwrap().is_some());
        assert_eq!(
            manifest.hash_binding().unwrap().exclusions,
            vec![Exclusion::to_end(JPEG.len() as u64)]
        );
        assert!(!sidecar_path(&asset).exists());
    }

    #[test]
    fn test_unsupported_format_writes_sidecar() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.heic");
        std::fs::write(&asset, b"\0\0\0\x18ftypheic").unwrap();

        let result = orchestrator().sign(&request(&asset, "image/heic")).unwrap();
        assert_eq!(result.strategy(), Some(SigningStrategy::Sidecar));
        assert!(sidecar_path(&asset).exists());
        assert_eq!(std::fs::read(&asset).unwrap(), b"\0\0\0\x18ftypheic");
    }

    #[test]
    fn test_embed_failure_falls_back_to_sidecar() {
        let dir = tempdir().unwrap();
        // Declared JPEG but the bytes are not
        let asset = dir.path().join("fake.jpg");
        std::fs::write(&asset, b"not really a jpeg").unwrap();

        let result = orchestrator().sign(&request(&asset, "image/jpeg")).unwrap();
        assert_eq!(result.strategy(), Some(SigningStrategy::Sidecar));
        assert_eq!(std::fs::read(&asset).unwrap(), b"not really a jpeg");
        // No temporary files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_both_strategies_fail() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.jpg");
        std::fs::write(&asset, b"not really a jpeg").unwrap();
        // The sidecar location is taken by a directory
        std::fs::create_dir(sidecar_path(&asset)).unwrap();

        let result = orchestrator().sign(&request(&asset, "image/jpeg")).unwrap();
        let SigningResult::Failure { errors } = result else {
            panic!("expected failure");
        };
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("embed: "));
        assert!(errors[1].starts_with("sidecar: "));
    }

    #[test]
    fn test_missing_asset_reports_hash_stage() {
        let dir = tempdir().unwrap();
        let result = orchestrator()
            .sign(&request(&dir.path().join("missing.jpg"), "image/jpeg"))
            .unwrap();
        let SigningResult::Failure { errors } = result else {
            panic!("expected failure");
        };
        assert!(errors[0].starts_with("hash: "));
    }

    #[test]
    fn test_single_flight() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.jpg");
        std::fs::write(&asset, JPEG).unwrap();

        let orchestrator = orchestrator();
        let held = orchestrator.claim(&request(&asset, "image/jpeg")).unwrap();
        assert!(matches!(
            orchestrator.sign(&request(&asset, "image/jpeg")),
            Err(PSError::SigningInProgress(_))
        ));
        drop(held);
        assert!(orchestrator.sign(&request(&asset, "image/jpeg")).unwrap().is_success());
    }

    #[test]
    fn test_shared_output_is_single_flight() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.jpg");
        let second = dir.path().join("b.jpg");
        std::fs::write(&first, JPEG).unwrap();
        std::fs::write(&second, JPEG).unwrap();
        let output = dir.path().join("out.jpg");

        let orchestrator = orchestrator();
        let _held = orchestrator
            .claim(&request(&first, "image/jpeg").with_output(&output))
            .unwrap();
        assert!(matches!(
            orchestrator.sign(&request(&second, "image/jpeg").with_output(&output)),
            Err(PSError::SigningInProgress(_))
        ));
        // The output of one attempt cannot be signed in place meanwhile
        std::fs::write(&output, JPEG).unwrap();
        assert!(matches!(
            orchestrator.sign(&request(&output, "image/jpeg")),
            Err(PSError::SigningInProgress(_))
        ));
        assert!(orchestrator.sign(&request(&second, "image/jpeg")).unwrap().is_success());
    }

    struct Deny;

    impl PresenceGate for Deny {
        fn confirm(&self, _reason: &str) -> Result<bool, PSError> {
            Ok(false)
        }
    }

    #[test]
    fn test_signing_denied_is_not_retried() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.jpg");
        std::fs::write(&asset, JPEG).unwrap();

        let provider = Arc::new(GatedProvider::new(Box::new(SoftwareProvider::new()), Box::new(Deny)));
        let keys = KeyManager::with_provider(
            provider,
            Box::new(MemoryIdentityStore::new()),
            Arc::new(FixedTimeSource::from_unix_secs(JAN_2026)),
        )
        .unwrap();
        keys.generate_key_pair().unwrap();
        let orchestrator =
            SigningOrchestrator::new(Arc::new(keys), Arc::new(TrailerCodec::new()), Assembler::new("t"));

        assert!(matches!(
            orchestrator.sign(&request(&asset, "image/jpeg")),
            Err(PSError::SigningDenied(_))
        ));
        assert!(!sidecar_path(&asset).exists());
        assert_eq!(std::fs::read(&asset).unwrap(), JPEG);
    }

    #[test]
    fn test_no_identity() {
        let keys = KeyManager::with_provider(
            Arc::new(SoftwareProvider::new()),
            Box::new(MemoryIdentityStore::new()),
            Arc::new(FixedTimeSource::from_unix_secs(JAN_2026)),
        )
        .unwrap();
        let orchestrator =
            SigningOrchestrator::new(Arc::new(keys), Arc::new(TrailerCodec::new()), Assembler::new("t"));
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.jpg");
        std::fs::write(&asset, JPEG).unwrap();
        assert!(matches!(
            orchestrator.sign(&request(&asset, "image/jpeg")),
            Err(PSError::PrivateKeyNotFound)
        ));
    }

    #[test]
    fn test_batch() {
        let dir = tempdir().unwrap();
        let requests: Vec<SigningRequest> = (0..5)
            .map(|i| {
                let asset = dir.path().join(format!("{i}.jpg"));
                std::fs::write(&asset, JPEG).unwrap();
                request(&asset, "image/jpeg")
            })
            .collect();

        let results = orchestrator().sign_batch(&requests, 3);
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| matches!(r, Ok(res) if res.is_success())));
    }
}
