//! Remote trust list
//!
//! The service exposes two endpoints:
//!
//! - `GET /trust-list` returns list metadata (version, counts)
//! - `POST /validate-certificate` with `{"fingerprint": "<sha256 hex>"}`
//!   returns `{"trusted": bool}`
//!
//! Only the certificate fingerprint ever leaves the device.

use super::cache::{RefreshOutcome, TrustListCache};
use super::pending::{PendingHistory, PendingVerification};
use crate::audit;
use crate::config::PipelineConfig;
use crate::error::PSError;
use crate::metrics::global_metrics;
use crate::time::TimeSource;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const FINGERPRINT_HEX_LENGTH: usize = 64;

/// `GET /trust-list` response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustListMetadata {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_count: Option<u64>,
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    fingerprint: &'a str,
}

#[derive(Deserialize)]
struct ValidateResponse {
    trusted: bool,
}

/// Transport to the trust-list service
pub trait TrustListClient: Send + Sync {
    fn fetch_metadata(&self) -> Result<TrustListMetadata, PSError>;

    /// Remote verdict for a certificate fingerprint.
    fn validate_fingerprint(&self, fingerprint: &str) -> Result<bool, PSError>;
}

/// HTTP client for the trust-list service
pub struct UreqTrustListClient {
    base_url: String,
    client: ureq::Agent,
}

impl UreqTrustListClient {
    /// `base_url` without trailing slash; every request is bounded by
    /// `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        // Non-2xx statuses come back as responses so the body can be logged
        let client = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn read_body(
        &self,
        response: ureq::http::Response<ureq::Body>,
        endpoint: &str,
    ) -> Result<String, PSError> {
        let status = response.status();
        if status != 200 {
            let body = response
                .into_body()
                .read_to_string()
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(PSError::TrustListUnreachable(format!(
                "{} returned status {}: {}",
                endpoint,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        response.into_body().read_to_string().map_err(|e| {
            PSError::TrustListUnreachable(format!("Failed to read {} response: {}", endpoint, e))
        })
    }
}

impl TrustListClient for UreqTrustListClient {
    fn fetch_metadata(&self) -> Result<TrustListMetadata, PSError> {
        let url = format!("{}/trust-list", self.base_url);
        let response = self
            .client
            .get(&url)
            .call()
            .map_err(|e| PSError::TrustListUnreachable(format!("GET {}: {}", url, e)))?;
        let body = self.read_body(response, "trust-list")?;
        serde_json::from_str(&body)
            .map_err(|e| PSError::TrustListUnreachable(format!("Invalid trust-list metadata: {}", e)))
    }

    fn validate_fingerprint(&self, fingerprint: &str) -> Result<bool, PSError> {
        check_fingerprint(fingerprint)?;
        let url = format!("{}/validate-certificate", self.base_url);
        let request = serde_json::to_string(&ValidateRequest { fingerprint })?;
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .send(request.as_bytes())
            .map_err(|e| PSError::TrustListUnreachable(format!("POST {}: {}", url, e)))?;
        let body = self.read_body(response, "validate-certificate")?;
        let verdict: ValidateResponse = serde_json::from_str(&body).map_err(|e| {
            PSError::TrustListUnreachable(format!("Invalid validation response: {}", e))
        })?;
        Ok(verdict.trusted)
    }
}

/// Only a SHA-256 hex digest may be sent to the service.
fn check_fingerprint(fingerprint: &str) -> Result<(), PSError> {
    if fingerprint.len() != FINGERPRINT_HEX_LENGTH
        || !fingerprint.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(PSError::InvalidArgument);
    }
    Ok(())
}

/// Remote answer for a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteVerdict {
    pub trusted: bool,
    pub from_cache: bool,
}

/// Outcome of [`TrustList::retry_pending`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub resolved: usize,
    pub still_pending: usize,
}

/// Trust-list client, verdict cache and pending history as one unit
pub struct TrustList {
    client: Option<Box<dyn TrustListClient>>,
    cache: TrustListCache,
    pending: PendingHistory,
    time: Arc<dyn TimeSource>,
}

impl TrustList {
    pub fn new(
        client: Option<Box<dyn TrustListClient>>,
        cache: TrustListCache,
        pending: PendingHistory,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            client,
            cache,
            pending,
            time,
        }
    }

    /// Client from the configured URL (none when unset), cache and history
    /// under the data directory.
    pub fn from_config(config: &PipelineConfig, time: Arc<dyn TimeSource>) -> Self {
        let client = config.trust_list.url.as_ref().map(|url| {
            Box::new(UreqTrustListClient::new(url.clone(), config.trust_list.timeout()))
                as Box<dyn TrustListClient>
        });
        let cache = TrustListCache::open(
            config.trust_cache_path(),
            config.trust_list.cache_ttl(),
            Arc::clone(&time),
        );
        let pending = PendingHistory::open(config.pending_history_path());
        Self::new(client, cache, pending, time)
    }

    /// Offline-only trust list.
    pub fn disabled(time: Arc<dyn TimeSource>) -> Self {
        let cache = TrustListCache::in_memory(Duration::from_secs(0), Arc::clone(&time));
        Self::new(None, cache, PendingHistory::in_memory(), time)
    }

    pub fn is_remote_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub fn cache(&self) -> &TrustListCache {
        &self.cache
    }

    pub fn pending(&self) -> &PendingHistory {
        &self.pending
    }

    /// Cached verdict if fresh, otherwise ask the service and cache the
    /// answer.
    pub fn check(&self, fingerprint: &str) -> Result<RemoteVerdict, PSError> {
        let metrics = global_metrics();
        if let Some(cached) = self.cache.lookup(fingerprint) {
            metrics.record_trust_cache_hit();
            return Ok(RemoteVerdict {
                trusted: cached.trusted,
                from_cache: true,
            });
        }

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| PSError::TrustListUnreachable("No trust list configured".to_string()))?;
        let result = client.validate_fingerprint(fingerprint);
        metrics.record_trust_remote_lookup(result.is_ok());
        let trusted = result.inspect_err(|e| {
            audit::log_trust_list_unreachable(fingerprint, &e.to_string());
        })?;

        if let Err(e) = self.cache.record(fingerprint, trusted) {
            log::warn!("Failed to cache trust verdict for {}: {}", fingerprint, e);
        }
        Ok(RemoteVerdict {
            trusted,
            from_cache: false,
        })
    }

    /// Pull the latest trust-list metadata.
    pub fn refresh_trust_list(&self) -> Result<RefreshOutcome, PSError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| PSError::TrustListUnreachable("No trust list configured".to_string()))?;
        let outcome = self.cache.refresh(client.as_ref())?;
        if let RefreshOutcome::Refreshed(metadata) = &outcome {
            log::info!("Trust list refreshed to version {}", metadata.version);
        }
        Ok(outcome)
    }

    /// Remember a verification that degraded to `unknown`.
    pub fn record_pending(&self, fingerprint: &str, asset: &str, reason: &str) {
        let recorded_at = self.time.now_unix().unwrap_or_default();
        let entry = PendingVerification {
            fingerprint: fingerprint.to_string(),
            asset: asset.to_string(),
            recorded_at,
            reason: reason.to_string(),
        };
        if let Err(e) = self.pending.record(entry) {
            log::warn!("Failed to record pending verification: {}", e);
        }
    }

    /// Retry every pending fingerprint against the service.
    pub fn retry_pending(&self) -> Result<RetrySummary, PSError> {
        let mut fingerprints: Vec<String> =
            self.pending.entries().into_iter().map(|e| e.fingerprint).collect();
        fingerprints.sort();
        fingerprints.dedup();

        let mut summary = RetrySummary::default();
        for fingerprint in fingerprints {
            match self.check(&fingerprint) {
                Ok(_) => summary.resolved += self.pending.resolve(&fingerprint)?,
                Err(e) => {
                    log::debug!("Still pending {}: {}", fingerprint, e);
                    summary.still_pending += self
                        .pending
                        .entries()
                        .iter()
                        .filter(|p| p.fingerprint == fingerprint)
                        .count();
                }
            }
        }
        Ok(summary)
    }
}
