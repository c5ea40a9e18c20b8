//! Stable content fingerprints for deduplicating records within a run.
//!
//! The fingerprint is SHA-256 over a canonical rendering of a subset of the
//! payload: selected keys in sorted order, values as canonical JSON (object
//! keys recursively sorted). When the payload carries a URL-like field, the
//! trailing path segment after a configured marker (a stable product/page
//! identity) is folded in as well, so the same page fetched under different
//! query strings still collapses to one record.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::settings::RunSettings;

pub type Fingerprint = [u8; 32];

const DEFAULT_URL_MARKERS: &[&str] = &["/dp/"];

/// Per-spider fingerprint selection. The wrong selection causes
/// false-positive deduplication, so both knobs live in spider settings.
#[derive(Debug, Clone, Default)]
pub struct FingerprintSpec {
    fields: Option<BTreeSet<String>>,
    url_markers: Vec<String>,
}

impl FingerprintSpec {
    pub fn from_settings(settings: &RunSettings) -> Self {
        let fields = settings
            .fingerprint_fields
            .as_ref()
            .filter(|f| !f.is_empty())
            .map(|f| f.iter().cloned().collect());
        let url_markers = settings.url_id_markers.clone().unwrap_or_else(|| {
            DEFAULT_URL_MARKERS.iter().map(|m| m.to_string()).collect()
        });
        Self { fields, url_markers }
    }

    pub fn fingerprint(&self, payload: &Map<String, Value>) -> Fingerprint {
        let mut canonical = String::new();
        for (key, value) in payload {
            if let Some(fields) = &self.fields {
                if !fields.contains(key) {
                    continue;
                }
            }
            canonical.push_str(key);
            canonical.push('=');
            write_canonical(&mut canonical, value);
            canonical.push('\n');
        }

        if let Some(url) = source_url(payload) {
            if let Some(identity) = self.url_identity(url) {
                let _ = write!(canonical, "~url_id={identity}");
            }
        }

        Sha256::digest(canonical.as_bytes()).into()
    }

    fn url_identity<'a>(&self, url: &'a str) -> Option<&'a str> {
        for marker in &self.url_markers {
            if let Some(idx) = url.find(marker.as_str()) {
                let rest = &url[idx + marker.len()..];
                let end = rest
                    .find(['/', '?', '#'])
                    .unwrap_or(rest.len());
                if end > 0 {
                    return Some(&rest[..end]);
                }
            }
        }
        None
    }
}

pub fn to_hex(fp: &Fingerprint) -> String {
    hex::encode(fp)
}

/// First URL-valued field of the payload, used both for fingerprint identity
/// and as the stored record's source URL.
pub fn source_url(payload: &Map<String, Value>) -> Option<&str> {
    payload
        .iter()
        .filter(|(key, _)| {
            let k = key.to_ascii_lowercase();
            k == "url" || k.ends_with("_url") || k == "link"
        })
        .find_map(|(_, value)| match value {
            Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => {
                Some(s.as_str())
            }
            _ => None,
        })
}

// Deterministic JSON: maps render with sorted keys at every depth. Map
// iteration order in serde_json is insertion order, which is not stable
// across producers.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String((*key).clone()));
                write_canonical(out, &map[*key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(raw: &str) -> Map<String, Value> {
        match serde_json::from_str(raw).unwrap() {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn spec() -> FingerprintSpec {
        FingerprintSpec::from_settings(&RunSettings::default())
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = spec().fingerprint(&payload(r#"{"a":1,"b":"x"}"#));
        let b = spec().fingerprint(&payload(r#"{"b":"x","a":1}"#));
        assert_eq!(a, b);
    }

    #[test]
    fn nested_objects_are_canonicalized() {
        let a = spec().fingerprint(&payload(r#"{"v":{"x":1,"y":2}}"#));
        let b = spec().fingerprint(&payload(r#"{"v":{"y":2,"x":1}}"#));
        assert_eq!(a, b);
    }

    #[test]
    fn differing_values_differ() {
        let a = spec().fingerprint(&payload(r#"{"k":1}"#));
        let b = spec().fingerprint(&payload(r#"{"k":2}"#));
        assert_ne!(a, b);
    }

    #[test]
    fn field_selection_ignores_unselected_keys() {
        let settings = RunSettings {
            fingerprint_fields: Some(vec!["title".to_string()]),
            ..Default::default()
        };
        let spec = FingerprintSpec::from_settings(&settings);
        let a = spec.fingerprint(&payload(r#"{"title":"t","price":100}"#));
        let b = spec.fingerprint(&payload(r#"{"title":"t","price":250}"#));
        assert_eq!(a, b);
    }

    #[test]
    fn url_identity_collapses_query_variants() {
        let a = spec().fingerprint(&payload(
            r#"{"url":"https://shop.example/dp/B01ABC","seen":1}"#,
        ));
        let b = spec().fingerprint(&payload(
            r#"{"url":"https://shop.example/dp/B01ABC?ref=nav","seen":1}"#,
        ));
        // Identity segment matches but the full payloads differ.
        assert_ne!(a, b);

        let spec_url_only = FingerprintSpec::from_settings(&RunSettings {
            fingerprint_fields: Some(vec!["seen".to_string()]),
            ..Default::default()
        });
        let a = spec_url_only.fingerprint(&payload(
            r#"{"url":"https://shop.example/dp/B01ABC","seen":1}"#,
        ));
        let b = spec_url_only.fingerprint(&payload(
            r#"{"url":"https://shop.example/dp/B01ABC?ref=nav","seen":1}"#,
        ));
        assert_eq!(a, b);
        let c = spec_url_only.fingerprint(&payload(
            r#"{"url":"https://shop.example/dp/B99ZZZ","seen":1}"#,
        ));
        assert_ne!(a, c);
    }

    #[test]
    fn source_url_prefers_url_like_keys() {
        let p = payload(r#"{"name":"x","product_url":"https://e.com/dp/1"}"#);
        assert_eq!(source_url(&p), Some("https://e.com/dp/1"));
        let p = payload(r#"{"name":"x","url":"not-a-url"}"#);
        assert_eq!(source_url(&p), None);
    }
}
