//! Manifest assembly from sanitized metadata

use super::{
    Action, Actions, Assertion, Claim, HashBinding, IdentityBinding, Ingredient, Manifest,
    PrivacyDeclaration, HASH_ALGORITHM,
};
use crate::error::PSError;
use crate::keys::PublicKey;
use crate::sanitize::categories::Category;
use crate::sanitize::SanitizedMetadata;
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const ACTION_CREATED: &str = "c2pa.created";
const INSTANCE_ID_PREFIX: &str = "xmp:iid:";

/// What the capture collaborator knows about the asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureContext {
    pub title: String,
    /// MIME type
    pub format: String,
    pub captured_at: DateTime<Utc>,
    /// Overrides the assembler's software agent
    pub software_agent: Option<String>,
    pub ingredients: Vec<Ingredient>,
}

impl CaptureContext {
    pub fn new(title: impl Into<String>, format: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            format: format.into(),
            captured_at,
            software_agent: None,
            ingredients: Vec::new(),
        }
    }

    pub fn with_ingredient(mut self, ingredient: Ingredient) -> Self {
        self.ingredients.push(ingredient);
        self
    }
}

/// Signer details recorded in the identity binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub public_key: PublicKey,
    pub certificate_fingerprint: Option<String>,
}

/// Builds manifests in the fixed assertion order
#[derive(Debug, Clone)]
pub struct Assembler {
    claim_generator: String,
    identity_binding: bool,
}

impl Assembler {
    pub fn new(claim_generator: impl Into<String>) -> Self {
        Self {
            claim_generator: claim_generator.into(),
            identity_binding: true,
        }
    }

    pub fn with_identity_binding(mut self, enabled: bool) -> Self {
        self.identity_binding = enabled;
        self
    }

    /// Assemble an unbound manifest. The same inputs always produce the
    /// same manifest.
    pub fn assemble(
        &self,
        sanitized: &SanitizedMetadata,
        context: &CaptureContext,
        key_info: Option<&KeyInfo>,
    ) -> Result<Manifest, PSError> {
        validate_context(context)?;

        let when = context
            .captured_at
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let software_agent = context
            .software_agent
            .clone()
            .unwrap_or_else(|| self.claim_generator.clone());

        let mut assertions = vec![
            Assertion::Actions(Actions {
                actions: vec![Action {
                    action: ACTION_CREATED.to_string(),
                    software_agent,
                    when: when.clone(),
                }],
            }),
            Assertion::HashBinding(HashBinding {
                name: context.title.clone(),
                alg: HASH_ALGORITHM.to_string(),
                hash: None,
                exclusions: Vec::new(),
            }),
            Assertion::Privacy(privacy_declaration(sanitized)),
        ];

        let metadata = match sanitized.to_json() {
            serde_json::Value::Object(map) => map.into_iter().collect::<BTreeMap<_, _>>(),
            _ => BTreeMap::new(),
        };
        if !metadata.is_empty() {
            assertions.push(Assertion::Metadata(metadata));
        }

        if self.identity_binding {
            if let Some(key) = key_info {
                assertions.push(Assertion::Identity(IdentityBinding {
                    signer_public_key: key.public_key,
                    key_id: key.public_key.key_id(),
                    certificate_fingerprint: key.certificate_fingerprint.clone(),
                    content_address: String::new(),
                }));
            }
        }

        let instance_id = self.instance_id(sanitized, context, key_info, &when)?;
        let claim = Claim {
            claim_generator: self.claim_generator.clone(),
            format: context.format.clone(),
            title: context.title.clone(),
            instance_id,
            assertions,
            ingredients: context.ingredients.clone(),
        };
        let manifest = Manifest::from_claim(claim)?;
        log::debug!(
            "Assembled manifest {} with assertions {:?}",
            manifest.claim().instance_id,
            manifest.labels()
        );
        Ok(manifest)
    }

    fn instance_id(
        &self,
        sanitized: &SanitizedMetadata,
        context: &CaptureContext,
        key_info: Option<&KeyInfo>,
        when: &str,
    ) -> Result<String, PSError> {
        let mut hasher = Sha256::new();
        for part in [
            self.claim_generator.as_str(),
            context.title.as_str(),
            context.format.as_str(),
            when,
        ] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(serde_json::to_vec(&sanitized.to_json())?);
        hasher.update(serde_json::to_vec(&context.ingredients)?);
        if let Some(key) = key_info {
            hasher.update(key.public_key.to_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        let uuid = uuid::Builder::from_custom_bytes(bytes).into_uuid();
        Ok(format!("{}{}", INSTANCE_ID_PREFIX, uuid))
    }
}

fn privacy_declaration(sanitized: &SanitizedMetadata) -> PrivacyDeclaration {
    let report = sanitized.report();
    let mut removed = BTreeMap::new();
    for category in [Category::Location, Category::DeviceSerial, Category::OwnerInfo] {
        removed.insert(category.label().to_string(), report.removed(category));
    }
    removed.insert(
        "not_allow_listed".to_string(),
        report.not_allow_listed_removed,
    );
    PrivacyDeclaration {
        sanitized: true,
        gps_included: report.gps_retained,
        removed,
    }
}

fn validate_context(context: &CaptureContext) -> Result<(), PSError> {
    if context.title.trim().is_empty() {
        return Err(PSError::UsageError("asset title must not be empty"));
    }
    if !context.format.contains('/') {
        return Err(PSError::UsageError("asset format must be a MIME type"));
    }
    for ingredient in &context.ingredients {
        if ingredient.parent_hash.len() != 64
            || !ingredient.parent_hash.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(PSError::UsageError("ingredient parent hash must be SHA-256 hex"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{IngredientRole, LABEL_ACTIONS, LABEL_HASH_DATA, LABEL_IDENTITY, LABEL_METADATA, LABEL_PRIVACY};
    use crate::sanitize::{sanitize, MetadataValue, RawMetadata, SanitizationPolicy};

    fn sanitized() -> SanitizedMetadata {
        let mut raw = RawMetadata::new();
        raw.insert("PixelXDimension", MetadataValue::Integer(4032));
        raw.insert("Orientation", MetadataValue::Integer(1));
        raw.insert("GPSLatitude", MetadataValue::Float(52.5));
        sanitize(&raw, &SanitizationPolicy::default()).unwrap()
    }

    fn context() -> CaptureContext {
        CaptureContext::new(
            "IMG_0001.jpg",
            "image/jpeg",
            DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    fn key_info() -> KeyInfo {
        KeyInfo {
            public_key: PublicKey::from_bytes(&[9u8; 32]).unwrap(),
            certificate_fingerprint: Some("ab".repeat(32)),
        }
    }

    #[test]
    fn test_assertion_order() {
        let manifest = Assembler::new("provsign/test")
            .assemble(&sanitized(), &context(), Some(&key_info()))
            .unwrap();
        assert_eq!(
            manifest.labels(),
            vec![LABEL_ACTIONS, LABEL_HASH_DATA, LABEL_PRIVACY, LABEL_METADATA, LABEL_IDENTITY]
        );
        assert!(manifest.claim().instance_id.starts_with("xmp:iid:"));
    }

    #[test]
    fn test_assemble_is_deterministic() {
        let assembler = Assembler::new("provsign/test");
        let a = assembler.assemble(&sanitized(), &context(), Some(&key_info())).unwrap();
        let b = assembler.assemble(&sanitized(), &context(), Some(&key_info())).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.claim_bytes().unwrap(), b.claim_bytes().unwrap());

        let mut other = context();
        other.title = "IMG_0002.jpg".to_string();
        let c = assembler.assemble(&sanitized(), &other, Some(&key_info())).unwrap();
        assert_ne!(a.claim().instance_id, c.claim().instance_id);
    }

    #[test]
    fn test_privacy_declaration() {
        let manifest = Assembler::new("provsign/test")
            .assemble(&sanitized(), &context(), None)
            .unwrap();
        let privacy = manifest.privacy().unwrap();
        assert!(privacy.sanitized);
        assert!(!privacy.gps_included);
        assert_eq!(privacy.removed["location"], 1);
        // No key, no identity binding
        assert!(manifest.identity().is_none());
    }

    #[test]
    fn test_identity_binding_can_be_disabled() {
        let manifest = Assembler::new("provsign/test")
            .with_identity_binding(false)
            .assemble(&sanitized(), &context(), Some(&key_info()))
            .unwrap();
        assert!(manifest.identity().is_none());
    }

    #[test]
    fn test_creation_action_timestamp() {
        let manifest = Assembler::new("provsign/test")
            .assemble(&sanitized(), &context(), None)
            .unwrap();
        match &manifest.assertions()[0] {
            Assertion::Actions(actions) => {
                assert_eq!(actions.actions[0].action, "c2pa.created");
                assert_eq!(actions.actions[0].when, "2026-01-01T12:00:00Z");
                assert_eq!(actions.actions[0].software_agent, "provsign/test");
            }
            other => panic!("unexpected first assertion {:?}", other),
        }
    }

    #[test]
    fn test_context_validation() {
        let assembler = Assembler::new("provsign/test");
        let mut bad = context();
        bad.format = "jpeg".to_string();
        assert!(assembler.assemble(&sanitized(), &bad, None).is_err());

        let bad = context().with_ingredient(Ingredient {
            title: "parent".to_string(),
            parent_hash: "nothex".to_string(),
            role: IngredientRole::ParentOf,
            format: "image/jpeg".to_string(),
            thumbnail: None,
        });
        assert!(assembler.assemble(&sanitized(), &bad, None).is_err());
    }
}
