//! Metadata sanitization
//!
//! Raw capture metadata goes through three stages before any of it can be
//! placed in a manifest:
//!
//! 1. **Category removal**: location, device-serial and owner/contact
//!    fields are dropped according to [`SanitizationPolicy`]. A sensitive
//!    field holding a dictionary (a GPS block) is dropped wholesale.
//! 2. **Threat neutralization**: every remaining field name and string value
//!    is passed through [`threats::neutralize`].
//! 3. **Validation**: the result is rescanned. Anything that survived is a
//!    sanitizer bug and fails the whole asset.
//!
//! Sanitization is all-or-nothing: [`sanitize`] either returns a complete
//! [`SanitizedMetadata`] or `SanitizationFailed`.
//!
//! # Example
//!
//! ```rust
//! use provsign::sanitize::{sanitize, MetadataValue, RawMetadata, SanitizationPolicy};
//!
//! let mut raw = RawMetadata::new();
//! raw.insert("PixelXDimension", MetadataValue::Integer(4032));
//! raw.insert("GPSLatitude", MetadataValue::Float(48.85));
//!
//! let clean = sanitize(&raw, &SanitizationPolicy::default())?;
//! assert!(clean.get("GPSLatitude").is_none());
//! assert_eq!(clean.report().location_removed, 1);
//! # Ok::<(), provsign::PSError>(())
//! ```

pub mod categories;
pub mod threats;

pub use categories::Category;

use crate::audit;
use crate::error::PSError;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum nesting depth of dictionaries
pub const MAX_DEPTH: usize = 8;
/// Maximum number of fields, counted across all nesting levels
pub const MAX_FIELDS: usize = 4096;
/// Maximum length of a text value or field name in bytes
pub const MAX_STRING_BYTES: usize = 64 * 1024;
/// Maximum length of a blob value in bytes
pub const MAX_BLOB_BYTES: usize = 16 * 1024 * 1024;

/// An untyped metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Blob(Vec<u8>),
    Dictionary(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    /// JSON rendering; blobs become standard base64 strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            MetadataValue::Text(s) => Value::String(s.clone()),
            MetadataValue::Integer(i) => Value::from(*i),
            MetadataValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            MetadataValue::Blob(b) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            MetadataValue::Dictionary(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    fn from_json(field: &str, value: &serde_json::Value) -> Result<Self, PSError> {
        use serde_json::Value;
        Ok(match value {
            Value::String(s) => MetadataValue::Text(s.clone()),
            Value::Bool(b) => MetadataValue::Text(b.to_string()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => MetadataValue::Integer(i),
                None => MetadataValue::Float(n.as_f64().ok_or_else(|| {
                    PSError::SanitizationFailed(format!("field '{}' has an unrepresentable number", field))
                })?),
            },
            Value::Array(items) => MetadataValue::Dictionary(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Ok((i.to_string(), Self::from_json(field, v)?)))
                    .collect::<Result<_, PSError>>()?,
            ),
            Value::Object(map) => MetadataValue::Dictionary(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::from_json(k, v)?)))
                    .collect::<Result<_, PSError>>()?,
            ),
            Value::Null => {
                return Err(PSError::SanitizationFailed(format!(
                    "field '{}' has a null value",
                    field
                )));
            }
        })
    }
}

/// Capture metadata as produced by the capture collaborator
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawMetadata {
    fields: BTreeMap<String, MetadataValue>,
}

impl RawMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: MetadataValue) -> &mut Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&MetadataValue> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.fields.iter()
    }

    /// Build from a JSON object (as exported by common metadata tools).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, PSError> {
        let serde_json::Value::Object(map) = value else {
            return Err(PSError::SanitizationFailed(
                "metadata must be a JSON object".to_string(),
            ));
        };
        let fields = map
            .iter()
            .map(|(k, v)| Ok((k.clone(), MetadataValue::from_json(k, v)?)))
            .collect::<Result<_, PSError>>()?;
        Ok(Self { fields })
    }
}

impl<K: Into<String>> FromIterator<(K, MetadataValue)> for RawMetadata {
    fn from_iter<I: IntoIterator<Item = (K, MetadataValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// How fields that are neither technical nor sensitive are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowListMode {
    /// Drop every top-level field not on the technical allow-list unless
    /// its category was explicitly opted in
    Strict,
    /// Keep unknown fields after neutralization
    #[default]
    Permissive,
}

/// Which categories to remove
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizationPolicy {
    pub remove_gps: bool,
    pub remove_device_serial: bool,
    pub remove_owner_info: bool,
    pub allow_list_mode: AllowListMode,
}

impl Default for SanitizationPolicy {
    fn default() -> Self {
        Self {
            remove_gps: true,
            remove_device_serial: true,
            remove_owner_info: true,
            allow_list_mode: AllowListMode::Permissive,
        }
    }
}

impl SanitizationPolicy {
    /// Whether fields of `category` are removed under this policy
    pub fn removes(&self, category: Category) -> bool {
        match category {
            Category::Location => self.remove_gps,
            Category::DeviceSerial => self.remove_device_serial,
            Category::OwnerInfo => self.remove_owner_info,
        }
    }
}

/// What sanitization did, without any field contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizationReport {
    pub location_removed: usize,
    pub device_serial_removed: usize,
    pub owner_info_removed: usize,
    /// Fields dropped by the strict allow-list
    pub not_allow_listed_removed: usize,
    /// Names and strings altered by threat neutralization
    pub strings_neutralized: usize,
    /// Location data is still present (opted in)
    pub gps_retained: bool,
}

impl SanitizationReport {
    pub fn removed(&self, category: Category) -> usize {
        match category {
            Category::Location => self.location_removed,
            Category::DeviceSerial => self.device_serial_removed,
            Category::OwnerInfo => self.owner_info_removed,
        }
    }

    pub fn total_removed(&self) -> usize {
        self.location_removed
            + self.device_serial_removed
            + self.owner_info_removed
            + self.not_allow_listed_removed
    }

    fn count_removal(&mut self, category: Category) {
        match category {
            Category::Location => self.location_removed += 1,
            Category::DeviceSerial => self.device_serial_removed += 1,
            Category::OwnerInfo => self.owner_info_removed += 1,
        }
    }
}

/// Metadata that passed sanitization. Only [`sanitize`] creates it.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedMetadata {
    fields: BTreeMap<String, MetadataValue>,
    report: SanitizationReport,
}

impl SanitizedMetadata {
    pub fn get(&self, name: &str) -> Option<&MetadataValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, MetadataValue> {
        &self.fields
    }

    pub fn report(&self) -> &SanitizationReport {
        &self.report
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// JSON object with fields in name order
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

fn malformed(reason: impl Into<String>) -> PSError {
    PSError::SanitizationFailed(reason.into())
}

fn check_text(text: &str, what: &str) -> Result<(), PSError> {
    if text.len() > MAX_STRING_BYTES {
        return Err(malformed(format!(
            "{} exceeds {} bytes",
            what, MAX_STRING_BYTES
        )));
    }
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Err(malformed(format!("{} contains control characters", what)));
    }
    Ok(())
}

fn check_structure(
    fields: &BTreeMap<String, MetadataValue>,
    depth: usize,
    count: &mut usize,
) -> Result<(), PSError> {
    if depth > MAX_DEPTH {
        return Err(malformed(format!("nesting deeper than {}", MAX_DEPTH)));
    }
    for (name, value) in fields {
        *count += 1;
        if *count > MAX_FIELDS {
            return Err(malformed(format!("more than {} fields", MAX_FIELDS)));
        }
        check_text(name, "field name")?;
        match value {
            MetadataValue::Text(s) => check_text(s, "text value")?,
            MetadataValue::Float(f) if !f.is_finite() => {
                return Err(malformed("non-finite number"));
            }
            MetadataValue::Blob(b) if b.len() > MAX_BLOB_BYTES => {
                return Err(malformed(format!("blob exceeds {} bytes", MAX_BLOB_BYTES)));
            }
            MetadataValue::Dictionary(inner) => check_structure(inner, depth + 1, count)?,
            _ => {}
        }
    }
    Ok(())
}

struct Sanitizer<'a> {
    policy: &'a SanitizationPolicy,
    report: SanitizationReport,
}

impl Sanitizer<'_> {
    fn neutralize(&mut self, text: &str) -> Result<String, PSError> {
        let out = threats::neutralize(text)
            .ok_or_else(|| malformed("value does not converge under neutralization"))?;
        if out != text {
            self.report.strings_neutralized += 1;
        }
        Ok(out)
    }

    fn sensitive(&self, original: &str, cleaned: &str) -> Option<Category> {
        categories::classify(original).or_else(|| categories::classify(cleaned))
    }

    fn dictionary(
        &mut self,
        fields: &BTreeMap<String, MetadataValue>,
        top_level: bool,
    ) -> Result<BTreeMap<String, MetadataValue>, PSError> {
        let mut out = BTreeMap::new();
        for (name, value) in fields {
            let cleaned = self.neutralize(name)?;

            match self.sensitive(name, &cleaned) {
                Some(category) if self.policy.removes(category) => {
                    self.report.count_removal(category);
                    continue;
                }
                Some(Category::Location) => self.report.gps_retained = true,
                Some(_) => {}
                None => {
                    if top_level
                        && self.policy.allow_list_mode == AllowListMode::Strict
                        && !categories::is_technical(&cleaned)
                    {
                        self.report.not_allow_listed_removed += 1;
                        continue;
                    }
                }
            }

            if cleaned.trim().is_empty() {
                return Err(malformed("field name is empty after neutralization"));
            }

            let value = match value {
                MetadataValue::Text(s) => MetadataValue::Text(self.neutralize(s)?),
                MetadataValue::Dictionary(inner) => {
                    MetadataValue::Dictionary(self.dictionary(inner, false)?)
                }
                other => other.clone(),
            };

            if out.insert(cleaned, value).is_some() {
                return Err(malformed("two field names collide after neutralization"));
            }
        }
        Ok(out)
    }
}

fn validate(
    fields: &BTreeMap<String, MetadataValue>,
    policy: &SanitizationPolicy,
    top_level: bool,
) -> Result<(), PSError> {
    for (name, value) in fields {
        if let Some(category) = categories::classify(name)
            && policy.removes(category)
        {
            return Err(malformed(format!(
                "internal: {} field survived sanitization",
                category.label()
            )));
        }
        if top_level
            && policy.allow_list_mode == AllowListMode::Strict
            && categories::classify(name).is_none()
            && !categories::is_technical(name)
        {
            return Err(malformed("internal: field outside the allow-list survived"));
        }
        if let Some(kind) = threats::find_threat(name) {
            return Err(malformed(format!("internal: {:?} threat in field name", kind)));
        }
        match value {
            MetadataValue::Text(s) => {
                if let Some(kind) = threats::find_threat(s) {
                    return Err(malformed(format!("internal: {:?} threat in value", kind)));
                }
            }
            MetadataValue::Dictionary(inner) => validate(inner, policy, false)?,
            _ => {}
        }
    }
    Ok(())
}

/// Sanitize raw capture metadata.
///
/// Logs only removal counts, never field contents.
pub fn sanitize(
    raw: &RawMetadata,
    policy: &SanitizationPolicy,
) -> Result<SanitizedMetadata, PSError> {
    let result = sanitize_inner(raw, policy);
    match &result {
        Ok(clean) => {
            let report = clean.report();
            log::info!(
                "Sanitized metadata: removed {} location, {} device serial, {} owner, {} non-allow-listed fields",
                report.location_removed,
                report.device_serial_removed,
                report.owner_info_removed,
                report.not_allow_listed_removed
            );
            audit::log_sanitization_completed(report);
        }
        Err(e) => {
            log::warn!("Sanitization failed: {}", e);
            audit::log_sanitization_failed(&e.to_string());
        }
    }
    result
}

fn sanitize_inner(
    raw: &RawMetadata,
    policy: &SanitizationPolicy,
) -> Result<SanitizedMetadata, PSError> {
    let mut count = 0;
    check_structure(&raw.fields, 1, &mut count)?;

    let mut sanitizer = Sanitizer {
        policy,
        report: SanitizationReport::default(),
    };
    let fields = sanitizer.dictionary(&raw.fields, true)?;
    validate(&fields, policy, true)?;

    Ok(SanitizedMetadata {
        fields,
        report: sanitizer.report,
    })
}
