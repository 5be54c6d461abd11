//! Provenance manifests
//!
//! A manifest is a claim (generator, asset description, ordered assertions,
//! ingredients) plus a signature over the claim's canonical encoding.
//! Manifests are immutable: binding the asset hash or attaching a signature
//! yields a new value.
//!
//! Assertion order is fixed and part of the signed payload:
//!
//! ```text
//! c2pa.actions → c2pa.hash.data → provsign.privacy → provsign.metadata → provsign.identity
//! ```

mod assemble;
pub mod hash;

pub use assemble::{Assembler, CaptureContext, KeyInfo};
pub use hash::{hash_asset, Exclusion, HASH_ALGORITHM};

use crate::error::PSError;
use crate::keys::PublicKey;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const LABEL_ACTIONS: &str = "c2pa.actions";
pub const LABEL_HASH_DATA: &str = "c2pa.hash.data";
pub const LABEL_PRIVACY: &str = "provsign.privacy";
pub const LABEL_METADATA: &str = "provsign.metadata";
pub const LABEL_IDENTITY: &str = "provsign.identity";

pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// One recorded action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub action: String,
    pub software_agent: String,
    /// RFC 3339, UTC
    pub when: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actions {
    pub actions: Vec<Action>,
}

/// Hash binding between the manifest and the asset bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashBinding {
    pub name: String,
    pub alg: String,
    /// Hex digest, absent until bound
    pub hash: Option<String>,
    pub exclusions: Vec<Exclusion>,
}

/// What was done to the capture metadata before it entered the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyDeclaration {
    pub sanitized: bool,
    pub gps_included: bool,
    /// Removed field counts by category
    pub removed: BTreeMap<String, usize>,
}

/// Binds the manifest to the signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBinding {
    pub signer_public_key: PublicKey,
    pub key_id: String,
    pub certificate_fingerprint: Option<String>,
    /// SHA-256 of the canonical claim with this field blanked
    pub content_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "label", content = "data")]
pub enum Assertion {
    #[serde(rename = "c2pa.actions")]
    Actions(Actions),
    #[serde(rename = "c2pa.hash.data")]
    HashBinding(HashBinding),
    #[serde(rename = "provsign.privacy")]
    Privacy(PrivacyDeclaration),
    #[serde(rename = "provsign.metadata")]
    Metadata(BTreeMap<String, serde_json::Value>),
    #[serde(rename = "provsign.identity")]
    Identity(IdentityBinding),
}

impl Assertion {
    pub fn label(&self) -> &'static str {
        match self {
            Assertion::Actions(_) => LABEL_ACTIONS,
            Assertion::HashBinding(_) => LABEL_HASH_DATA,
            Assertion::Privacy(_) => LABEL_PRIVACY,
            Assertion::Metadata(_) => LABEL_METADATA,
            Assertion::Identity(_) => LABEL_IDENTITY,
        }
    }

    fn order(&self) -> u8 {
        match self {
            Assertion::Actions(_) => 0,
            Assertion::HashBinding(_) => 1,
            Assertion::Privacy(_) => 2,
            Assertion::Metadata(_) => 3,
            Assertion::Identity(_) => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IngredientRole {
    ParentOf,
    ComponentOf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub format: String,
    /// Base64
    pub data: String,
}

/// Asset this one was derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingredient {
    pub title: String,
    /// SHA-256 hex of the parent asset
    pub parent_hash: String,
    pub role: IngredientRole,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Thumbnail>,
}

/// The signed part of a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_generator: String,
    pub format: String,
    pub title: String,
    pub instance_id: String,
    pub assertions: Vec<Assertion>,
    pub ingredients: Vec<Ingredient>,
}

/// Signature over the canonical claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSignature {
    pub alg: String,
    pub public_key: PublicKey,
    /// Base64
    pub value: String,
    /// Base64 DER of the signing certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl ManifestSignature {
    pub fn signature_bytes(&self) -> Result<Vec<u8>, PSError> {
        BASE64
            .decode(&self.value)
            .map_err(|e| PSError::MalformedManifest(format!("Signature is not base64: {}", e)))
    }

    pub fn certificate_der(&self) -> Result<Option<Vec<u8>>, PSError> {
        self.certificate
            .as_ref()
            .map(|c| {
                BASE64.decode(c).map_err(|e| {
                    PSError::MalformedManifest(format!("Certificate is not base64: {}", e))
                })
            })
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    claim: Claim,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<ManifestSignature>,
}

impl Manifest {
    /// Freeze a claim, checking its structure.
    pub(crate) fn from_claim(claim: Claim) -> Result<Self, PSError> {
        let manifest = Self {
            claim,
            signature: None,
        };
        manifest.check_structure()?;
        Ok(manifest)
    }

    pub fn claim(&self) -> &Claim {
        &self.claim
    }

    pub fn assertions(&self) -> &[Assertion] {
        &self.claim.assertions
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.claim.assertions.iter().map(Assertion::label).collect()
    }

    pub fn signature(&self) -> Option<&ManifestSignature> {
        self.signature.as_ref()
    }

    pub fn hash_binding(&self) -> Option<&HashBinding> {
        self.claim.assertions.iter().find_map(|a| match a {
            Assertion::HashBinding(binding) => Some(binding),
            _ => None,
        })
    }

    pub fn identity(&self) -> Option<&IdentityBinding> {
        self.claim.assertions.iter().find_map(|a| match a {
            Assertion::Identity(identity) => Some(identity),
            _ => None,
        })
    }

    pub fn privacy(&self) -> Option<&PrivacyDeclaration> {
        self.claim.assertions.iter().find_map(|a| match a {
            Assertion::Privacy(privacy) => Some(privacy),
            _ => None,
        })
    }

    /// Canonical bytes covered by the signature.
    pub fn claim_bytes(&self) -> Result<Vec<u8>, PSError> {
        Ok(serde_json::to_vec(&self.claim)?)
    }

    /// SHA-256 hex of the canonical claim with the identity content address
    /// blanked.
    pub fn compute_content_address(&self) -> Result<String, PSError> {
        let mut claim = self.claim.clone();
        for assertion in &mut claim.assertions {
            if let Assertion::Identity(identity) = assertion {
                identity.content_address.clear();
            }
        }
        Ok(hex::encode(Sha256::digest(serde_json::to_vec(&claim)?)))
    }

    /// New manifest with the asset digest and exclusions bound and the
    /// identity content address recomputed. Any signature is dropped.
    pub fn bind_hash(&self, digest_hex: &str, exclusions: &[Exclusion]) -> Result<Self, PSError> {
        if digest_hex.len() != 64 || !digest_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PSError::InvalidArgument);
        }
        let mut claim = self.claim.clone();
        for assertion in &mut claim.assertions {
            if let Assertion::HashBinding(binding) = assertion {
                binding.hash = Some(digest_hex.to_ascii_lowercase());
                binding.exclusions = exclusions.to_vec();
            }
        }
        let mut bound = Self {
            claim,
            signature: None,
        };
        let address = bound.compute_content_address()?;
        for assertion in &mut bound.claim.assertions {
            if let Assertion::Identity(identity) = assertion {
                identity.content_address = address.clone();
            }
        }
        Ok(bound)
    }

    /// New manifest carrying `signature`.
    pub fn with_signature(&self, signature: ManifestSignature) -> Self {
        Self {
            claim: self.claim.clone(),
            signature: Some(signature),
        }
    }

    /// Sign the canonical claim with `sign` and attach the result.
    pub fn sign_with<F>(
        &self,
        public_key: PublicKey,
        certificate_der: Option<&[u8]>,
        sign: F,
    ) -> Result<Self, PSError>
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, PSError>,
    {
        if self.hash_binding().and_then(|b| b.hash.as_ref()).is_none() {
            return Err(PSError::UsageError("hash binding must be bound before signing"));
        }
        let signature = sign(&self.claim_bytes()?)?;
        Ok(self.with_signature(ManifestSignature {
            alg: SIGNATURE_ALGORITHM.to_string(),
            public_key,
            value: BASE64.encode(signature),
            certificate: certificate_der.map(|der| BASE64.encode(der)),
        }))
    }

    /// Serialized form stored in containers and sidecars.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PSError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PSError> {
        let manifest: Self = serde_json::from_slice(data)
            .map_err(|e| PSError::MalformedManifest(e.to_string()))?;
        manifest.check_structure()?;
        Ok(manifest)
    }

    /// Exactly one hash binding, no repeated labels, fixed order.
    fn check_structure(&self) -> Result<(), PSError> {
        let assertions = &self.claim.assertions;
        let bindings = assertions
            .iter()
            .filter(|a| matches!(a, Assertion::HashBinding(_)))
            .count();
        if bindings != 1 {
            return Err(PSError::MalformedManifest(format!(
                "Expected exactly one hash binding, found {}",
                bindings
            )));
        }
        if !assertions.windows(2).all(|w| w[0].order() < w[1].order()) {
            return Err(PSError::MalformedManifest(
                "Assertions are out of order or repeated".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn key() -> PublicKey {
        PublicKey::from_bytes(&[7u8; 32]).unwrap()
    }

    fn claim(with_identity: bool) -> Claim {
        let mut assertions = vec![
            Assertion::Actions(Actions {
                actions: vec![Action {
                    action: "c2pa.created".to_string(),
                    software_agent: "test".to_string(),
                    when: "2026-01-01T00:00:00Z".to_string(),
                }],
            }),
            Assertion::HashBinding(HashBinding {
                name: "asset".to_string(),
                alg: HASH_ALGORITHM.to_string(),
                hash: None,
                exclusions: vec![],
            }),
        ];
        if with_identity {
            assertions.push(Assertion::Identity(IdentityBinding {
                signer_public_key: key(),
                key_id: key().key_id(),
                certificate_fingerprint: None,
                content_address: String::new(),
            }));
        }
        Claim {
            claim_generator: "test/1.0".to_string(),
            format: "image/jpeg".to_string(),
            title: "a.jpg".to_string(),
            instance_id: "xmp:iid:0".to_string(),
            assertions,
            ingredients: vec![],
        }
    }

    #[test]
    fn test_assertion_serde_uses_labels() {
        let json = serde_json::to_value(&claim(false).assertions[1]).unwrap();
        assert_eq!(json["label"], "c2pa.hash.data");
        assert_eq!(json["data"]["alg"], "sha256");
    }

    #[test]
    fn test_structure_checks() {
        let mut bad = claim(false);
        bad.assertions.swap(0, 1);
        assert!(Manifest::from_claim(bad).is_err());

        let mut bad = claim(false);
        bad.assertions.remove(1);
        assert!(Manifest::from_claim(bad).is_err());

        assert!(Manifest::from_claim(claim(true)).is_ok());
    }

    #[test]
    fn test_bind_hash_recomputes_content_address() {
        let manifest = Manifest::from_claim(claim(true)).unwrap();
        let bound = manifest.bind_hash(DIGEST, &[Exclusion::to_end(10)]).unwrap();

        assert_eq!(bound.hash_binding().unwrap().hash.as_deref(), Some(DIGEST));
        let address = &bound.identity().unwrap().content_address;
        assert_eq!(address, &bound.compute_content_address().unwrap());
        assert_eq!(bound.labels(), manifest.labels());
        // Original is untouched
        assert!(manifest.hash_binding().unwrap().hash.is_none());
    }

    #[test]
    fn test_bind_hash_rejects_bad_digest() {
        let manifest = Manifest::from_claim(claim(false)).unwrap();
        assert!(matches!(manifest.bind_hash("xyz", &[]), Err(PSError::InvalidArgument)));
    }

    #[test]
    fn test_sign_requires_bound_hash() {
        let manifest = Manifest::from_claim(claim(false)).unwrap();
        let result = manifest.sign_with(key(), None, |_| Ok(vec![0u8; 64]));
        assert!(matches!(result, Err(PSError::UsageError(_))));
    }

    #[test]
    fn test_bytes_round_trip_keeps_signature() {
        let signed = Manifest::from_claim(claim(true))
            .unwrap()
            .bind_hash(DIGEST, &[])
            .unwrap()
            .sign_with(key(), Some(b"der"), |_| Ok(vec![1u8; 64]))
            .unwrap();
        let parsed = Manifest::from_bytes(&signed.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, signed);
        let signature = parsed.signature().unwrap();
        assert_eq!(signature.signature_bytes().unwrap(), vec![1u8; 64]);
        assert_eq!(signature.certificate_der().unwrap().unwrap(), b"der".to_vec());
    }

    #[test]
    fn test_float_metadata_survives_bytes_round_trip() {
        let mut metadata = BTreeMap::new();
        metadata.insert("ExposureTime".to_string(), serde_json::json!(1.0 / 11.0));
        metadata.insert("FNumber".to_string(), serde_json::json!(0.1 + 0.2));
        metadata.insert("Tiny".to_string(), serde_json::json!(1.0715660391465826e-75));
        metadata.insert(
            "Lens".to_string(),
            serde_json::json!({"Focal": 2.0 / 3.0, "Name": "50mm \"fast\"\n\u{e9}"}),
        );
        let mut claim = claim(false);
        claim.assertions.push(Assertion::Metadata(metadata));
        claim.assertions.push(Assertion::Identity(IdentityBinding {
            signer_public_key: key(),
            key_id: key().key_id(),
            certificate_fingerprint: None,
            content_address: String::new(),
        }));

        let signed = Manifest::from_claim(claim)
            .unwrap()
            .bind_hash(DIGEST, &[])
            .unwrap()
            .sign_with(key(), None, |_| Ok(vec![1u8; 64]))
            .unwrap();
        let parsed = Manifest::from_bytes(&signed.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.claim_bytes().unwrap(), signed.claim_bytes().unwrap());
        assert_eq!(
            parsed.compute_content_address().unwrap(),
            signed.identity().unwrap().content_address
        );
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(matches!(
            Manifest::from_bytes(b"{\"claim\": 1}"),
            Err(PSError::MalformedManifest(_))
        ));
    }
}
