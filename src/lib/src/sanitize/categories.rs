//! Privacy categories and the technical allow-list
//!
//! Field names are compared after normalization: lowercase ASCII with
//! everything but letters and digits dropped, so `GPS:Latitude`,
//! `gps_latitude` and `GPSLatitude` are the same field.

use serde::{Deserialize, Serialize};

/// Privacy-sensitive field category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// GPS coordinates and any place name
    Location,
    /// Body, lens or hardware serial numbers and device identifiers
    DeviceSerial,
    /// Owner name, artist and contact details
    OwnerInfo,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::Location => "location",
            Category::DeviceSerial => "device_serial",
            Category::OwnerInfo => "owner_info",
        }
    }
}

const LOCATION_NAMES: &[&str] = &[
    "location",
    "locationcreated",
    "locationshown",
    "geolocation",
    "geotag",
    "coordinates",
    "latitude",
    "longitude",
    "altitude",
    "city",
    "state",
    "provincestate",
    "country",
    "countrycode",
    "countryname",
    "sublocation",
    "placename",
    "postalcode",
];

const LOCATION_FRAGMENTS: &[&str] = &["latitude", "longitude", "geoloc", "location"];

const DEVICE_SERIAL_NAMES: &[&str] = &[
    "serial",
    "serialnumber",
    "bodyserialnumber",
    "cameraserialnumber",
    "lensserialnumber",
    "internalserialnumber",
    "deviceid",
    "deviceidentifier",
    "hardwareid",
    "imei",
    "meid",
    "udid",
    "androidid",
    "advertisingid",
    "macaddress",
];

const DEVICE_SERIAL_FRAGMENTS: &[&str] = &["serialnumber", "hardwareid", "deviceid"];

const OWNER_NAMES: &[&str] = &[
    "owner",
    "ownername",
    "cameraownername",
    "artist",
    "author",
    "creator",
    "byline",
    "contact",
    "creatorcontactinfo",
    "email",
    "phone",
    "phonenumber",
    "telephone",
    "address",
    "username",
];

const OWNER_FRAGMENTS: &[&str] = &["ownername", "email", "phone", "contact", "creatoraddr"];

/// Technical fields that survive every allow-list mode
const TECHNICAL_FIELDS: &[&str] = &[
    "width",
    "height",
    "pixelwidth",
    "pixelheight",
    "imagewidth",
    "imageheight",
    "imagelength",
    "exifimagewidth",
    "exifimageheight",
    "pixelxdimension",
    "pixelydimension",
    "orientation",
    "datetime",
    "datetimeoriginal",
    "datetimedigitized",
    "createdate",
    "capturetime",
    "capturetimestamp",
    "timestamp",
    "offsettime",
    "offsettimeoriginal",
    "colorspace",
    "colorprofile",
    "iccprofile",
    "iccprofilename",
    "profiledescription",
    "bitspersample",
    "compression",
    "mimetype",
];

/// Normalize a field name for category matching.
pub fn normalize_field_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Category of a field, if it is privacy-sensitive.
pub fn classify(name: &str) -> Option<Category> {
    let normalized = normalize_field_name(name);
    if normalized.is_empty() {
        return None;
    }
    if normalized.starts_with("gps")
        || LOCATION_NAMES.contains(&normalized.as_str())
        || LOCATION_FRAGMENTS.iter().any(|f| normalized.contains(f))
    {
        return Some(Category::Location);
    }
    if DEVICE_SERIAL_NAMES.contains(&normalized.as_str())
        || DEVICE_SERIAL_FRAGMENTS.iter().any(|f| normalized.contains(f))
    {
        return Some(Category::DeviceSerial);
    }
    if OWNER_NAMES.contains(&normalized.as_str())
        || OWNER_FRAGMENTS.iter().any(|f| normalized.contains(f))
    {
        return Some(Category::OwnerInfo);
    }
    None
}

/// Whether a field is on the technical allow-list.
pub fn is_technical(name: &str) -> bool {
    TECHNICAL_FIELDS.contains(&normalize_field_name(name).as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_name_variants() {
        for name in ["GPS:Latitude", "gps_latitude", "GPSLatitude", "GPS", "gpsInfo"] {
            assert_eq!(classify(name), Some(Category::Location), "{name}");
        }
        assert_eq!(classify("Iptc4xmpCore:Location"), Some(Category::Location));
        assert_eq!(classify("Location"), Some(Category::Location));
    }

    #[test]
    fn test_device_serial() {
        for name in ["BodySerialNumber", "LensSerialNumber", "Device-ID", "IMEI"] {
            assert_eq!(classify(name), Some(Category::DeviceSerial), "{name}");
        }
    }

    #[test]
    fn test_owner_info() {
        for name in ["OwnerName", "Artist", "CreatorWorkEmail", "Phone"] {
            assert_eq!(classify(name), Some(Category::OwnerInfo), "{name}");
        }
    }

    #[test]
    fn test_technical_fields_not_sensitive() {
        for name in [
            "PixelXDimension",
            "ImageWidth",
            "Orientation",
            "DateTimeOriginal",
            "ColorSpace",
            "ICCProfileName",
        ] {
            assert!(is_technical(name), "{name}");
            assert_eq!(classify(name), None, "{name}");
        }
    }

    #[test]
    fn test_unrelated_fields() {
        assert_eq!(classify("Make"), None);
        assert_eq!(classify("ExposureTime"), None);
        assert!(!is_technical("Make"));
    }
}
