//! Audit logging for provenance signing, verification and identity changes.
//!
//! Security-relevant events are emitted as structured `tracing` events under
//! the `provsign::audit` target. Ordinary diagnostics stay on the `log`
//! facade.
//!
//! # Usage
//!
//! ```rust,ignore
//! use provsign::audit::{self, AuditConfig, LogDestination};
//!
//! audit::init(AuditConfig {
//!     destination: LogDestination::Stdout,
//!     ..AuditConfig::default()
//! })?;
//! ```
//!
//! # Event Types
//!
//! - `sanitization.completed` / `sanitization.failed`
//! - `signing.attempt` / `signing.success` / `signing.failure`
//! - `verification.attempt` / `verification.success` / `verification.failure`
//! - `key.generated` / `key.rotated` / `key.deleted`
//! - `certificate.issued` / `certificate.serial_degraded`
//! - `trust_list.unreachable`
//!
//! No event carries metadata field contents, private key material or file
//! bytes. Assets are identified by their content hash.
//!
//! # JSON Output Example
//!
//! ```json
//! {
//!   "timestamp": "2026-03-01T12:00:00Z",
//!   "level": "INFO",
//!   "target": "provsign::audit",
//!   "event_type": "signing.success",
//!   "correlation_id": "0f8e...",
//!   "asset_hash": "sha256:e3b0c442...",
//!   "strategy": "embedded"
//! }
//! ```

use crate::error::PSError;
use crate::sanitize::SanitizationReport;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

pub const AUDIT_TARGET: &str = "provsign::audit";

static AUDIT_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Audit log configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Enable audit logging (default: true)
    pub enabled: bool,
    /// Log destination
    pub destination: LogDestination,
    /// Use JSON format (default: true)
    pub json_format: bool,
    /// Log level filter (default: "provsign::audit=info")
    pub filter: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination: LogDestination::Stderr,
            json_format: true,
            filter: format!("{}=info", AUDIT_TARGET),
        }
    }
}

/// Audit log destination
#[derive(Debug, Clone, Default)]
pub enum LogDestination {
    Stdout,
    #[default]
    Stderr,
    /// Append to a file
    File(String),
}

/// Initialize the audit subscriber.
///
/// Call once at program startup; later calls are ignored. Fails if the audit
/// file cannot be opened.
pub fn init(config: AuditConfig) -> Result<(), PSError> {
    if AUDIT_INITIALIZED.get().is_some() {
        return Ok(());
    }
    if !config.enabled {
        let _ = AUDIT_INITIALIZED.set(true);
        return Ok(());
    }

    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match (config.destination, config.json_format) {
        (LogDestination::Stdout, true) => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_events(FmtSpan::NONE)
                    .with_writer(std::io::stdout),
            )
            .try_init(),
        (LogDestination::Stdout, false) => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stdout))
            .try_init(),
        (LogDestination::Stderr, true) => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_events(FmtSpan::NONE)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogDestination::Stderr, false) => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        (LogDestination::File(path), json) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| {
                    PSError::ConfigError(format!("cannot open audit log '{}': {}", path, e))
                })?;
            if json {
                registry
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(FmtSpan::NONE)
                            .with_writer(std::sync::Mutex::new(file)),
                    )
                    .try_init()
            } else {
                registry
                    .with(
                        fmt::layer()
                            .with_target(true)
                            .with_ansi(false)
                            .with_writer(std::sync::Mutex::new(file)),
                    )
                    .try_init()
            }
        }
    };

    if let Err(e) = installed {
        log::debug!("Audit subscriber not installed: {}", e);
    }
    let _ = AUDIT_INITIALIZED.set(true);
    Ok(())
}

/// Generate a new correlation ID for tracking related audit events.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Sanitization
// ============================================================================

/// Log removal counts after a successful sanitization.
pub fn log_sanitization_completed(report: &SanitizationReport) {
    tracing::info!(
        target: AUDIT_TARGET,
        event_type = "sanitization.completed",
        location_removed = report.location_removed,
        device_serial_removed = report.device_serial_removed,
        owner_info_removed = report.owner_info_removed,
        not_allow_listed_removed = report.not_allow_listed_removed,
        strings_neutralized = report.strings_neutralized,
        gps_retained = report.gps_retained,
        "Metadata sanitized"
    );
}

/// Log a rejected metadata set.
pub fn log_sanitization_failed(error_message: &str) {
    let safe_message = sanitize_error_message(error_message);
    tracing::warn!(
        target: AUDIT_TARGET,
        event_type = "sanitization.failed",
        error_message = %safe_message,
        "Metadata sanitization failed"
    );
}

// ============================================================================
// Signing
// ============================================================================

/// Log a signing attempt event.
pub fn log_signing_attempt(correlation_id: &str, asset_hash: &str, key_id: Option<&str>) {
    tracing::info!(
        target: AUDIT_TARGET,
        event_type = "signing.attempt",
        correlation_id = correlation_id,
        asset_hash = asset_hash,
        key_id = key_id.unwrap_or("n/a"),
        "Signing operation initiated"
    );
}

/// Log a successful signing event.
pub fn log_signing_success(
    correlation_id: &str,
    asset_hash: &str,
    strategy: &str,
    certificate_fingerprint: Option<&str>,
) {
    tracing::info!(
        target: AUDIT_TARGET,
        event_type = "signing.success",
        correlation_id = correlation_id,
        asset_hash = asset_hash,
        strategy = strategy,
        certificate_fingerprint = certificate_fingerprint.unwrap_or("n/a"),
        "Signing operation completed successfully"
    );
}

/// Log a failed signing event.
pub fn log_signing_failure(
    correlation_id: &str,
    asset_hash: &str,
    error_type: &str,
    error_message: &str,
) {
    let safe_message = sanitize_error_message(error_message);

    tracing::warn!(
        target: AUDIT_TARGET,
        event_type = "signing.failure",
        correlation_id = correlation_id,
        asset_hash = asset_hash,
        error_type = error_type,
        error_message = %safe_message,
        "Signing operation failed"
    );
}

// ============================================================================
// Verification
// ============================================================================

/// Log a verification attempt event.
pub fn log_verification_attempt(correlation_id: &str, asset_hash: &str, allow_remote: bool) {
    tracing::info!(
        target: AUDIT_TARGET,
        event_type = "verification.attempt",
        correlation_id = correlation_id,
        asset_hash = asset_hash,
        allow_remote = allow_remote,
        "Verification operation initiated"
    );
}

/// Log a passing verification.
pub fn log_verification_success(
    correlation_id: &str,
    asset_hash: &str,
    trust_level: &str,
    source: &str,
) {
    tracing::info!(
        target: AUDIT_TARGET,
        event_type = "verification.success",
        correlation_id = correlation_id,
        asset_hash = asset_hash,
        trust_level = trust_level,
        source = source,
        "Verification operation completed successfully"
    );
}

/// Log a failed verification.
pub fn log_verification_failure(
    correlation_id: &str,
    asset_hash: &str,
    error_type: &str,
    error_message: &str,
) {
    let safe_message = sanitize_error_message(error_message);

    tracing::warn!(
        target: AUDIT_TARGET,
        event_type = "verification.failure",
        correlation_id = correlation_id,
        asset_hash = asset_hash,
        error_type = error_type,
        error_message = %safe_message,
        "Verification operation failed"
    );
}

/// Log a trust-list lookup that fell back to `unknown`.
pub fn log_trust_list_unreachable(fingerprint: &str, error_message: &str) {
    let safe_message = sanitize_error_message(error_message);
    tracing::warn!(
        target: AUDIT_TARGET,
        event_type = "trust_list.unreachable",
        certificate_fingerprint = fingerprint,
        error_message = %safe_message,
        "Trust list unreachable, trust degraded to unknown"
    );
}

// ============================================================================
// Identity
// ============================================================================

/// Log a key generation event.
pub fn log_key_generated(key_id: &str, provider: &str) {
    tracing::info!(
        target: AUDIT_TARGET,
        event_type = "key.generated",
        key_id = key_id,
        provider = provider,
        "Signing key generated"
    );
}

/// Log a key rotation event.
pub fn log_key_rotated(previous_key_id: &str, key_id: &str) {
    tracing::info!(
        target: AUDIT_TARGET,
        event_type = "key.rotated",
        previous_key_id = previous_key_id,
        key_id = key_id,
        "Signing key rotated"
    );
}

/// Log an identity deletion.
pub fn log_key_deleted(key_id: &str, superseded_destroyed: usize) {
    tracing::warn!(
        target: AUDIT_TARGET,
        event_type = "key.deleted",
        key_id = key_id,
        superseded_destroyed = superseded_destroyed,
        "Signing identity deleted"
    );
}

/// Log a certificate issuance.
pub fn log_certificate_issued(fingerprint: &str, key_id: &str, self_signed: bool) {
    tracing::info!(
        target: AUDIT_TARGET,
        event_type = "certificate.issued",
        certificate_fingerprint = fingerprint,
        key_id = key_id,
        self_signed = self_signed,
        "Signing certificate issued"
    );
}

/// Log a certificate issued with a timestamp-derived serial.
pub fn log_certificate_serial_degraded(key_id: &str, reason: &str) {
    let safe_message = sanitize_error_message(reason);
    tracing::error!(
        target: AUDIT_TARGET,
        event_type = "certificate.serial_degraded",
        key_id = key_id,
        reason = %safe_message,
        "Certificate serial derived from timestamp: secure random source unavailable"
    );
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Sanitize error messages to avoid leaking sensitive information.
fn sanitize_error_message(message: &str) -> String {
    let sanitized = message
        .split_whitespace()
        .map(|word| {
            if word.len() > 40 && word.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
            {
                "[REDACTED]"
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if sanitized.chars().count() > 500 {
        let truncated: String = sanitized.chars().take(497).collect();
        format!("{}...", truncated)
    } else {
        sanitized
    }
}
