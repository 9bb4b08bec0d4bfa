//! Canonical serialization and hashing of the stimulus-generating parameters.
//!
//! A pre-generated stimulus library is only reusable while every parameter
//! that could change a rendered pixel is unchanged. Those parameters (the
//! `monitor` and `stimulus` groups) are serialized canonically (object keys
//! sorted lexicographically, floats rounded to 12 significant digits so the
//! same physical value hashes identically across platforms) and digested
//! with SHA-256. The hex digest is the library's `generation_fingerprint`.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Round to 12 significant digits and render without an exponent where
/// possible. `Display` on the rounded value yields the shortest decimal that
/// round-trips, which is stable for our purposes once the rounding has
/// squashed platform noise in the low bits.
fn format_float(x: f64) -> String {
    if x == 0.0 {
        return "0".to_string();
    }
    if !x.is_finite() {
        // Non-finite values never validate, but canonicalization must not
        // panic on them.
        return format!("{x}");
    }
    let magnitude = x.abs().log10().floor() as i32;
    let scale = 11 - magnitude;
    let factor = 10f64.powi(scale);
    let rounded = (x * factor).round() / factor;
    format!("{rounded}")
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                out.push_str(&format_float(n.as_f64().unwrap_or(0.0)));
            }
        }
        Value::String(s) => {
            // serde_json's string escaping is already canonical.
            out.push_str(&Value::String(s.clone()).to_string());
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Canonical JSON text of `value`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 hex digest of the canonical serialization of `value`.
pub fn fingerprint(value: &Value) -> String {
    let canon = canonical_json(value);
    let digest = Sha256::digest(canon.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Flatten a two-level `{group: {field: value}}` object into dotted keys,
/// used to enumerate differences between a saved parameter snapshot and the
/// live one.
pub fn flatten_keys(value: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    if let Value::Object(groups) = value {
        let mut group_names: Vec<&String> = groups.keys().collect();
        group_names.sort();
        for group in group_names {
            match &groups[group] {
                Value::Object(fields) => {
                    let mut field_names: Vec<&String> = fields.keys().collect();
                    field_names.sort();
                    for field in field_names {
                        out.push((format!("{group}.{field}"), fields[field].clone()));
                    }
                }
                other => out.push((group.clone(), other.clone())),
            }
        }
    }
    out
}

/// Compare two parameter snapshots field by field. Numeric values are
/// compared after canonical float formatting so that e.g. `60` and `60.0`
/// are not reported as a difference.
pub fn diff_snapshots(saved: &Value, current: &Value) -> Vec<crate::error::ParameterDifference> {
    let saved_flat: std::collections::BTreeMap<String, Value> =
        flatten_keys(saved).into_iter().collect();
    let current_flat: std::collections::BTreeMap<String, Value> =
        flatten_keys(current).into_iter().collect();

    let mut keys: Vec<&String> = saved_flat.keys().chain(current_flat.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut differences = Vec::new();
    for key in keys {
        let a = saved_flat.get(key).cloned().unwrap_or(Value::Null);
        let b = current_flat.get(key).cloned().unwrap_or(Value::Null);
        if canonical_json(&a) != canonical_json(&b) {
            differences.push(crate::error::ParameterDifference {
                key: key.clone(),
                saved: a,
                current: b,
            });
        }
    }
    differences
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_canonical() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_float_rounding_absorbs_platform_noise() {
        let a = json!({ "x": 0.1 + 0.2 });
        let b = json!({ "x": 0.3 });
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_integral_float_and_integer_hash_alike() {
        assert_eq!(format_float(60.0), "60");
        let a = json!({ "fps": 60 });
        let b = json!({ "fps": 60.0 });
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_changes_with_value() {
        let a = json!({"monitor": {"monitor_fps": 60.0}});
        let b = json!({"monitor": {"monitor_fps": 120.0}});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_diff_enumerates_every_changed_key() {
        let saved = json!({"monitor": {"monitor_fps": 60.0, "width_px": 1920}});
        let current = json!({"monitor": {"monitor_fps": 120.0, "width_px": 1920}});
        let diffs = diff_snapshots(&saved, &current);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].key, "monitor.monitor_fps");
        assert_eq!(diffs[0].saved, json!(60.0));
        assert_eq!(diffs[0].current, json!(120.0));
    }

    #[test]
    fn test_diff_reports_missing_keys() {
        let saved = json!({"stimulus": {"contrast": 1.0}});
        let current = json!({"stimulus": {}});
        let diffs = diff_snapshots(&saved, &current);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].current, serde_json::Value::Null);
    }
}
