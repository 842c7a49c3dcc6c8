//! Resource fingerprinting for change detection.
//!
//! A fingerprint is the hex SHA-256 of a resource's type and the canonical
//! JSON of its resolved attributes. Object keys are sorted at every level so
//! the result does not depend on map insertion order.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::value::ResolvedAttributes;

/// Computes deterministic fingerprints of resolved resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fingerprinter;

impl Fingerprinter {
    /// Creates a new fingerprinter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a resource.
    #[must_use]
    pub fn fingerprint(&self, resource_type: &str, attributes: &ResolvedAttributes) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource_type.as_bytes());
        hasher.update([0u8]);

        let mut canonical = String::new();
        canonical.push('{');
        for (i, (key, value)) in attributes.iter().enumerate() {
            if i > 0 {
                canonical.push(',');
            }
            write_json_string(key, &mut canonical);
            canonical.push(':');
            write_canonical(value, &mut canonical);
        }
        canonical.push('}');

        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns the first 8 characters for display purposes.
    #[must_use]
    pub fn short(fingerprint: &str) -> String {
        fingerprint.chars().take(8).collect()
    }

    /// Compares two fingerprints in constant time.
    #[must_use]
    pub fn matches(a: &str, b: &str) -> bool {
        if a.len() != b.len() {
            return false;
        }

        a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

/// Writes `value` as JSON with object keys sorted.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                if let Some(item) = map.get(key) {
                    write_canonical(item, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> ResolvedAttributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let fp = Fingerprinter::new();
        let a = attrs(&[("cidr", json!("10.0.0.0/18")), ("subnets", json!(2))]);

        assert_eq!(fp.fingerprint("network", &a), fp.fingerprint("network", &a));
        assert_eq!(fp.fingerprint("network", &a).len(), 64);
    }

    #[test]
    fn test_nested_key_order_ignored() {
        let fp = Fingerprinter::new();
        let mut first = serde_json::Map::new();
        first.insert("port".into(), json!(22));
        first.insert("source".into(), json!("0.0.0.0/0"));
        let mut second = serde_json::Map::new();
        second.insert("source".into(), json!("0.0.0.0/0"));
        second.insert("port".into(), json!(22));

        let a = attrs(&[("ingress", Value::Object(first))]);
        let b = attrs(&[("ingress", Value::Object(second))]);

        assert_eq!(
            fp.fingerprint("security_group", &a),
            fp.fingerprint("security_group", &b)
        );
    }

    #[test]
    fn test_type_and_value_change_fingerprint() {
        let fp = Fingerprinter::new();
        let a = attrs(&[("cidr", json!("10.0.0.0/18"))]);
        let b = attrs(&[("cidr", json!("10.1.0.0/18"))]);

        assert_ne!(fp.fingerprint("network", &a), fp.fingerprint("network", &b));
        assert_ne!(fp.fingerprint("network", &a), fp.fingerprint("subnet", &a));
    }

    #[test]
    fn test_short_and_matches() {
        assert_eq!(Fingerprinter::short("abcdef1234567890"), "abcdef12");
        assert!(Fingerprinter::matches("abc123", "abc123"));
        assert!(!Fingerprinter::matches("abc123", "abc124"));
        assert!(!Fingerprinter::matches("abc123", "abc12"));
    }
}
