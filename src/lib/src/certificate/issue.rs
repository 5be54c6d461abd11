//! Certificate issuance through the keystore

use super::{Certificate, OID_CLAIM_SIGNING};
use crate::audit;
use crate::config::CertificateConfig;
use crate::error::PSError;
use crate::keys::{KeySigner, PUBLIC_KEY_LENGTH};
use crate::time::{SystemTimeSource, TimeSource};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyUsagePurpose, RemoteKeyPair, SerialNumber, SignatureAlgorithm,
};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use time::{Duration as TimeDuration, OffsetDateTime};

const SERIAL_LENGTH: usize = 16;

/// Subject distinguished name of the signing certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectAttributes {
    pub common_name: String,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub country: Option<String>,
}

impl SubjectAttributes {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            organizational_unit: None,
            country: None,
        }
    }

    pub fn from_config(config: &CertificateConfig) -> Self {
        Self {
            organization: config.organization.clone(),
            ..Self::new(config.common_name.clone())
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_unit = Some(unit.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        if let Some(org) = &self.organization {
            dn.push(DnType::OrganizationName, org.as_str());
        }
        if let Some(ou) = &self.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, ou.as_str());
        }
        if let Some(country) = &self.country {
            dn.push(DnType::CountryName, country.as_str());
        }
        dn
    }
}

/// Source of serial-number randomness.
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), PSError>;
}

/// Operating system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), PSError> {
        getrandom::fill(buf).map_err(|e| PSError::InternalError(format!("Entropy source: {}", e)))
    }
}

/// rcgen view of a keystore-held Ed25519 key.
///
/// rcgen hands us the TBS bytes, the keystore signs them.
struct KeystoreKeyPair {
    signer: KeySigner,
    public_key: [u8; PUBLIC_KEY_LENGTH],
}

impl RemoteKeyPair for KeystoreKeyPair {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        self.signer.sign(msg).map_err(|e| {
            log::warn!("Keystore refused certificate signature: {}", e);
            rcgen::Error::RemoteKeyError
        })
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &rcgen::PKCS_ED25519
    }
}

fn remote_key_pair(signer: &KeySigner) -> Result<rcgen::KeyPair, PSError> {
    let public_key = signer.public_key().to_bytes();
    rcgen::KeyPair::from_remote(Box::new(KeystoreKeyPair {
        signer: signer.clone(),
        public_key,
    }))
    .map_err(|e| PSError::CertificateGenerationFailed(format!("Keystore key adapter: {}", e)))
}

/// Certificate authority used for the cross-signed and intermediate-chain
/// trust strategies.
pub struct IssuingAuthority {
    certificate: rcgen::Certificate,
    key: rcgen::KeyPair,
    der: Vec<u8>,
}

impl IssuingAuthority {
    /// Create a self-signed root CA with an in-memory key.
    pub fn create_root(
        subject: &SubjectAttributes,
        validity_days: u32,
        time: &dyn TimeSource,
    ) -> Result<Self, PSError> {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
            .map_err(|e| PSError::CertificateGenerationFailed(format!("CA key: {}", e)))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = subject.distinguished_name();
        (params.not_before, params.not_after) = validity_window(time, validity_days)?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let certificate = params
            .self_signed(&key)
            .map_err(|e| PSError::CertificateGenerationFailed(format!("CA certificate: {}", e)))?;
        let der = certificate.der().to_vec();
        Ok(Self {
            certificate,
            key,
            der,
        })
    }

    /// Load an existing CA from its PEM certificate and PKCS#8 key.
    pub fn from_pem(certificate_pem: &str, key_pem: &str) -> Result<Self, PSError> {
        let der = pem::parse(certificate_pem)
            .map_err(|e| PSError::X509Error(format!("Invalid issuer PEM: {}", e)))?
            .into_contents();
        let key = rcgen::KeyPair::from_pem(key_pem)
            .map_err(|e| PSError::X509Error(format!("Invalid issuer key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(certificate_pem)
            .map_err(|e| PSError::X509Error(format!("Invalid issuer certificate: {}", e)))?;
        // rcgen needs a Certificate value to sign with; the original DER is
        // what relying parties anchor on.
        let certificate = params
            .self_signed(&key)
            .map_err(|e| PSError::X509Error(format!("Issuer key does not fit: {}", e)))?;
        Ok(Self {
            certificate,
            key,
            der,
        })
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.der
    }

    pub fn certificate(&self) -> Result<Certificate, PSError> {
        Certificate::from_der(&self.der)
    }

    pub fn certificate_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.clone()))
    }
}

/// Issues signing certificates for keystore-held keys
pub struct CertificateIssuer {
    validity_days: u32,
    allow_degraded_serial: bool,
    time: Arc<dyn TimeSource>,
    entropy: Arc<dyn EntropySource>,
}

impl CertificateIssuer {
    pub fn new(config: &CertificateConfig) -> Self {
        Self {
            validity_days: config.validity_days,
            allow_degraded_serial: config.allow_degraded_serial,
            time: Arc::new(SystemTimeSource),
            entropy: Arc::new(OsEntropy),
        }
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn with_entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    /// Self-signed certificate: issuer == subject.
    pub fn generate_self_signed_certificate(
        &self,
        signer: &KeySigner,
        subject: &SubjectAttributes,
    ) -> Result<Certificate, PSError> {
        let (params, degraded) = self.signing_params(signer, subject)?;
        let key = remote_key_pair(signer)?;
        let der = params
            .self_signed(&key)
            .map_err(|e| {
                PSError::CertificateGenerationFailed(format!("Self-signing failed: {}", e))
            })?
            .der()
            .to_vec();
        self.finish(signer, der, degraded, true)
    }

    /// Certificate for the signing key issued by `issuer`.
    pub fn generate_cross_signed_certificate(
        &self,
        signer: &KeySigner,
        subject: &SubjectAttributes,
        issuer: &IssuingAuthority,
    ) -> Result<Certificate, PSError> {
        let (params, degraded) = self.signing_params(signer, subject)?;
        let key = remote_key_pair(signer)?;
        let der = params
            .signed_by(&key, &issuer.certificate, &issuer.key)
            .map_err(|e| {
                PSError::CertificateGenerationFailed(format!("Cross-signing failed: {}", e))
            })?
            .der()
            .to_vec();
        self.finish(signer, der, degraded, false)
    }

    fn signing_params(
        &self,
        signer: &KeySigner,
        subject: &SubjectAttributes,
    ) -> Result<(CertificateParams, bool), PSError> {
        if subject.common_name.trim().is_empty() {
            return Err(PSError::CertificateGenerationFailed(
                "Subject common name is empty".to_string(),
            ));
        }
        let (serial, degraded) = self.serial_number(signer)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = subject.distinguished_name();
        params.serial_number = Some(SerialNumber::from(serial));
        (params.not_before, params.not_after) =
            validity_window(self.time.as_ref(), self.validity_days)?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::ContentCommitment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::Other(claim_signing_arcs()),
            ExtendedKeyUsagePurpose::TimeStamping,
        ];
        Ok((params, degraded))
    }

    /// Random positive serial; the clock only stands in when the operator
    /// allowed it.
    fn serial_number(&self, signer: &KeySigner) -> Result<(Vec<u8>, bool), PSError> {
        let mut serial = vec![0u8; SERIAL_LENGTH];
        match self.entropy.fill(&mut serial) {
            Ok(()) => {
                serial[0] &= 0x7f;
                if serial.iter().all(|&b| b == 0) {
                    serial[SERIAL_LENGTH - 1] = 1;
                }
                Ok((serial, false))
            }
            Err(e) if self.allow_degraded_serial => {
                let key_id = signer.public_key().key_id();
                log::warn!("Entropy unavailable, using timestamp serial for {}: {}", key_id, e);
                audit::log_certificate_serial_degraded(&key_id, &e.to_string());
                let nanos = self
                    .time
                    .now()?
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                let bytes = nanos.to_be_bytes();
                let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
                let mut serial = bytes[start..].to_vec();
                serial[0] &= 0x7f;
                Ok((serial, true))
            }
            Err(e) => Err(PSError::CertificateGenerationFailed(format!(
                "No entropy for serial number and degraded serials are not allowed: {}",
                e
            ))),
        }
    }

    fn finish(
        &self,
        signer: &KeySigner,
        der: Vec<u8>,
        degraded: bool,
        self_signed: bool,
    ) -> Result<Certificate, PSError> {
        let mut certificate = Certificate::from_der(&der)?;
        if certificate.public_key != *signer.public_key() {
            return Err(PSError::CertificateGenerationFailed(
                "Issued certificate does not carry the signing key".to_string(),
            ));
        }
        certificate.serial_degraded = degraded;
        audit::log_certificate_issued(
            &certificate.fingerprint(),
            &signer.public_key().key_id(),
            self_signed,
        );
        log::info!(
            "Issued {} certificate {} (serial {})",
            if self_signed { "self-signed" } else { "cross-signed" },
            certificate.fingerprint(),
            certificate.serial_number
        );
        Ok(certificate)
    }
}

/// Self-signed certificate with system time and OS entropy.
pub fn generate_self_signed_certificate(
    signer: &KeySigner,
    subject: &SubjectAttributes,
    config: &CertificateConfig,
) -> Result<Certificate, PSError> {
    CertificateIssuer::new(config).generate_self_signed_certificate(signer, subject)
}

fn claim_signing_arcs() -> Vec<u64> {
    OID_CLAIM_SIGNING
        .split('.')
        .filter_map(|arc| arc.parse().ok())
        .collect()
}

fn validity_window(
    time: &dyn TimeSource,
    validity_days: u32,
) -> Result<(OffsetDateTime, OffsetDateTime), PSError> {
    if validity_days == 0 {
        return Err(PSError::CertificateGenerationFailed(
            "Validity period must be at least one day".to_string(),
        ));
    }
    let now = i64::try_from(time.now_unix()?)
        .map_err(|_| PSError::TimeError("Clock out of range".to_string()))?;
    let not_before = OffsetDateTime::from_unix_timestamp(now)
        .map_err(|e| PSError::TimeError(format!("Invalid certificate start: {}", e)))?;
    Ok((not_before, not_before + TimeDuration::days(i64::from(validity_days))))
}
