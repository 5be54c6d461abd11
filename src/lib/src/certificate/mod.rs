//! Signing certificates
//!
//! The signing identity is published as an X.509 end-entity certificate
//! whose key usage and extended key usage mark it as a content-claim
//! signer. Certificates are produced by [`CertificateIssuer`] and signed
//! inside the keystore, so issuance never needs the private key.
//!
//! ```text
//! KeyManager ──signer()──► KeySigner ──► CertificateIssuer ──► Certificate (DER)
//!                                              │
//!                                              └── IssuingAuthority (cross-sign)
//! ```

mod issue;

pub use issue::{
    generate_self_signed_certificate, CertificateIssuer, EntropySource, IssuingAuthority,
    OsEntropy, SubjectAttributes,
};

use crate::error::PSError;
use crate::keys::PublicKey;
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Dotted form of the claim-signing extended key usage.
pub const OID_CLAIM_SIGNING: &str = "1.3.6.1.4.1.62558.2.1";

/// DER body of [`OID_CLAIM_SIGNING`], as required by path validation.
pub const OID_CLAIM_SIGNING_DER: &[u8] =
    &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x83, 0xe8, 0x5e, 0x02, 0x01];

/// Dotted form of id-kp-timeStamping.
pub const OID_TIME_STAMPING: &str = "1.3.6.1.5.5.7.3.8";

const OID_ED25519: &str = "1.3.101.112";

/// Parsed signing certificate.
///
/// Keeps the original DER next to the fields the pipeline needs, so the
/// certificate can be embedded in manifests byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    pub subject: String,
    pub issuer: String,
    /// Serial number, lowercase hex
    pub serial_number: String,
    /// Unix seconds
    pub not_before: i64,
    /// Unix seconds
    pub not_after: i64,
    /// `digitalSignature`, `contentCommitment`, ...
    pub key_usage: Vec<String>,
    /// Dotted OIDs
    pub extended_key_usage: Vec<String>,
    pub public_key: PublicKey,
    pub self_signed: bool,
    /// Set when the serial came from the clock instead of the entropy source
    pub serial_degraded: bool,
}

impl Certificate {
    /// Parse a DER certificate carrying an Ed25519 key.
    pub fn from_der(der: &[u8]) -> Result<Self, PSError> {
        let (rest, cert) = X509Certificate::from_der(der)
            .map_err(|e| PSError::X509Error(format!("Failed to parse certificate: {}", e)))?;
        if !rest.is_empty() {
            return Err(PSError::X509Error(
                "Trailing data after certificate".to_string(),
            ));
        }

        let spki = cert.public_key();
        if spki.algorithm.algorithm.to_id_string() != OID_ED25519 {
            return Err(PSError::X509Error(format!(
                "Unsupported public key algorithm {}",
                spki.algorithm.algorithm.to_id_string()
            )));
        }
        let public_key = PublicKey::from_bytes(&spki.subject_public_key.data)?;

        let mut key_usage = Vec::new();
        if let Some(ku) = cert.key_usage()? {
            if ku.value.digital_signature() {
                key_usage.push("digitalSignature".to_string());
            }
            if ku.value.non_repudiation() {
                key_usage.push("contentCommitment".to_string());
            }
            if ku.value.key_cert_sign() {
                key_usage.push("keyCertSign".to_string());
            }
        }

        let mut extended_key_usage = Vec::new();
        if let Some(eku) = cert.extended_key_usage()? {
            if eku.value.time_stamping {
                extended_key_usage.push(OID_TIME_STAMPING.to_string());
            }
            if eku.value.code_signing {
                extended_key_usage.push("1.3.6.1.5.5.7.3.3".to_string());
            }
            extended_key_usage.extend(eku.value.other.iter().map(|oid| oid.to_id_string()));
        }

        Ok(Self {
            der: der.to_vec(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial_number: hex::encode(cert.raw_serial()),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            key_usage,
            extended_key_usage,
            public_key,
            self_signed: cert.subject() == cert.issuer(),
            serial_degraded: false,
        })
    }

    /// Parse the first `CERTIFICATE` block of a PEM document.
    pub fn from_pem(pem_data: &str) -> Result<Self, PSError> {
        let block = pem::parse_many(pem_data)
            .map_err(|e| PSError::X509Error(format!("Invalid PEM: {}", e)))?
            .into_iter()
            .find(|p| p.tag() == "CERTIFICATE")
            .ok_or_else(|| PSError::X509Error("No certificate in PEM".to_string()))?;
        Self::from_der(block.contents())
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    /// SHA-256 of the DER encoding, lowercase hex.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    /// Whether `unix_secs` falls inside the validity window.
    pub fn is_valid_at(&self, unix_secs: i64) -> bool {
        self.not_before <= unix_secs && unix_secs <= self.not_after
    }

    pub fn is_expired_at(&self, unix_secs: i64) -> bool {
        unix_secs > self.not_after
    }

    /// Seconds of validity left at `unix_secs`, zero once expired.
    pub fn remaining_secs(&self, unix_secs: i64) -> u64 {
        u64::try_from(self.not_after - unix_secs).unwrap_or(0)
    }

    /// Whether the extended key usage names claim signing.
    pub fn allows_claim_signing(&self) -> bool {
        self.extended_key_usage.iter().any(|o| o == OID_CLAIM_SIGNING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            Certificate::from_der(b"not a certificate"),
            Err(PSError::X509Error(_))
        ));
        assert!(Certificate::from_pem("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n").is_err());
    }

    #[test]
    fn test_pem_bundle_picks_certificate_block() {
        let keys = crate::keys::KeyManager::with_provider(
            std::sync::Arc::new(crate::platform::software::SoftwareProvider::new()),
            Box::new(crate::keys::MemoryIdentityStore::new()),
            std::sync::Arc::new(crate::time::FixedTimeSource::from_unix_secs(1_767_225_600)),
        )
        .unwrap();
        keys.generate_key_pair().unwrap();
        let cert = CertificateIssuer::new(&crate::config::CertificateConfig::default())
            .generate_self_signed_certificate(&keys.signer().unwrap(), &SubjectAttributes::new("Signer"))
            .unwrap();

        let key_block = ::pem::encode(&::pem::Pem::new("PUBLIC KEY", vec![1u8, 2, 3]));
        let bundle = format!("{}{}", key_block, cert.to_pem());
        let parsed = Certificate::from_pem(&bundle).unwrap();
        assert_eq!(parsed.der(), cert.der());
        assert_eq!(parsed.public_key, cert.public_key);
    }

    #[test]
    fn test_claim_signing_oid_encoding() {
        // 62558 = 0x83 0xe8 0x5e in base-128
        assert_eq!(&OID_CLAIM_SIGNING_DER[5..8], &[0x83, 0xe8, 0x5e]);
    }
}
