//! Per-platform trust stores and path validation
//!
//! Each platform (an OS root program, a content-credentials trust list,
//! a private deployment) keeps its own anchor set. A certificate is checked
//! against exactly one store at a time, since trust stores disagree.

use crate::certificate::{Certificate, OID_CLAIM_SIGNING_DER};
use crate::error::PSError;
use rustls_pki_types::{CertificateDer, TrustAnchor, UnixTime};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use webpki::{EndEntityCert, KeyUsage};

struct PlatformStore {
    anchors: Vec<TrustAnchor<'static>>,
    intermediates: Vec<CertificateDer<'static>>,
}

/// Named trust stores
#[derive(Default)]
pub struct TrustStoreRegistry {
    stores: BTreeMap<String, PlatformStore>,
}

impl TrustStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a DER trust anchor to `platform`, creating the store if needed.
    pub fn add_anchor_der(&mut self, platform: &str, der: &[u8]) -> Result<(), PSError> {
        let cert = CertificateDer::from(der);
        let anchor = webpki::anchor_from_trusted_cert(&cert)
            .map_err(|e| PSError::TrustStoreError(format!("Invalid trust anchor: {:?}", e)))?
            .to_owned();
        self.store_mut(platform).anchors.push(anchor);
        Ok(())
    }

    /// Add an intermediate CA that may complete chains for `platform`.
    pub fn add_intermediate_der(&mut self, platform: &str, der: &[u8]) -> Result<(), PSError> {
        let intermediate = CertificateDer::from(der.to_vec());
        EndEntityCert::try_from(&intermediate).map_err(|e| {
            PSError::TrustStoreError(format!("Invalid intermediate certificate: {:?}", e))
        })?;
        self.store_mut(platform).intermediates.push(intermediate);
        Ok(())
    }

    /// Load every `CERTIFICATE` block of a PEM bundle as anchors.
    ///
    /// Returns the number of anchors added.
    pub fn add_pem_bundle(&mut self, platform: &str, bundle: &str) -> Result<usize, PSError> {
        let blocks = pem::parse_many(bundle)
            .map_err(|e| PSError::TrustStoreError(format!("Invalid PEM bundle: {}", e)))?;
        let mut added = 0;
        for block in blocks.iter().filter(|b| b.tag() == "CERTIFICATE") {
            self.add_anchor_der(platform, block.contents())?;
            added += 1;
        }
        if added == 0 {
            return Err(PSError::TrustStoreError(format!(
                "No certificates in bundle for platform '{}'",
                platform
            )));
        }
        log::debug!("Loaded {} anchors into trust store '{}'", added, platform);
        Ok(added)
    }

    pub fn load_pem_file(&mut self, platform: &str, path: impl AsRef<Path>) -> Result<usize, PSError> {
        let bundle = std::fs::read_to_string(path)?;
        self.add_pem_bundle(platform, &bundle)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    pub fn anchor_count(&self, platform: &str) -> usize {
        self.stores.get(platform).map_or(0, |s| s.anchors.len())
    }

    /// Cryptographic path validation of `certificate` against one platform
    /// store at `unix_secs`.
    ///
    /// Unknown platforms, unparsable certificates and failed chains are all
    /// `false`.
    pub fn validate_against_trust_store(
        &self,
        certificate: &Certificate,
        platform: &str,
        unix_secs: u64,
    ) -> bool {
        match self.verify_chain(certificate, platform, unix_secs) {
            Ok(()) => true,
            Err(e) => {
                log::debug!(
                    "Certificate {} not trusted by '{}': {}",
                    certificate.fingerprint(),
                    platform,
                    e
                );
                false
            }
        }
    }

    /// Platforms whose store accepts `certificate`.
    pub fn trusting_platforms(&self, certificate: &Certificate, unix_secs: u64) -> Vec<String> {
        self.platforms()
            .filter(|p| self.validate_against_trust_store(certificate, p, unix_secs))
            .map(str::to_string)
            .collect()
    }

    fn verify_chain(
        &self,
        certificate: &Certificate,
        platform: &str,
        unix_secs: u64,
    ) -> Result<(), PSError> {
        let store = self
            .stores
            .get(platform)
            .ok_or_else(|| PSError::TrustStoreError(format!("Unknown platform '{}'", platform)))?;
        if store.anchors.is_empty() {
            return Err(PSError::TrustStoreError(format!(
                "Trust store '{}' is empty",
                platform
            )));
        }

        let der = CertificateDer::from(certificate.der());
        let cert = EndEntityCert::try_from(&der)
            .map_err(|e| PSError::X509Error(format!("Invalid end-entity certificate: {:?}", e)))?;

        cert.verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &store.anchors,
            &store.intermediates,
            UnixTime::since_unix_epoch(Duration::from_secs(unix_secs)),
            KeyUsage::required(OID_CLAIM_SIGNING_DER),
            None, // no revocation data
            None,
        )
        .map_err(|e| PSError::TrustStoreError(format!("Path validation failed: {:?}", e)))?;
        Ok(())
    }

    fn store_mut(&mut self, platform: &str) -> &mut PlatformStore {
        self.stores
            .entry(platform.to_string())
            .or_insert_with(|| PlatformStore {
                anchors: Vec::new(),
                intermediates: Vec::new(),
            })
    }
}
