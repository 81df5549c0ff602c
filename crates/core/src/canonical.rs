//! Canonical rendering of structured payloads.
//!
//! Two payloads that are semantically identical must render to the same byte
//! string, whatever the key order of their objects or the spelling of their
//! numbers. The rendering is compact JSON with:
//!
//! - object keys sorted by byte order (recursively)
//! - array order preserved
//! - integral floats rendered as integers (`1.0` and `1` are the same value,
//!   `-0.0` is `0`)
//! - all other floats in shortest round-trip form

use serde_json::{Number, Value};

use crate::error::{DomainError, DomainResult};

/// Render `value` canonically.
pub fn canonicalize(value: &Value) -> DomainResult<String> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) -> DomainResult<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::String(s) => write_string(s, out)?,
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push('{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(key, out)?;
                out.push(':');
                write_value(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut String) -> DomainResult<()> {
    let escaped = serde_json::to_string(s)
        .map_err(|e| DomainError::validation(format!("unencodable string: {e}")))?;
    out.push_str(&escaped);
    Ok(())
}

// u64::MAX as f64 rounds up to 2^64, so the upper bound is exclusive.
const U64_UPPER: f64 = 18_446_744_073_709_551_616.0;
const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;

fn canonical_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }

    let f = match n.as_f64() {
        Some(f) => f,
        None => return n.to_string(),
    };

    if f.fract() == 0.0 {
        if (I64_LOWER..0.0).contains(&f) {
            return (f as i64).to_string();
        }
        if (0.0..U64_UPPER).contains(&f) {
            return (f.abs() as u64).to_string();
        }
    }

    Number::from_f64(f)
        .map(|n| n.to_string())
        .unwrap_or_else(|| n.to_string())
}
