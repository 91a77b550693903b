use sha2::{Digest, Sha256};

use crate::types::Value;

/// Largest magnitude below which every integral f64 is exact.
const EXACT_INTEGRAL_F64: f64 = 9_007_199_254_740_992.0;

/// Natural key for a transaction: SHA-256 over the key fields joined with `|`.
///
/// Returns `None` when any component is missing or blank, since a partial key
/// could collide with an unrelated transaction.
pub fn compute_record_key<'a, I>(parts: I) -> Option<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut s = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        let part = part.map(str::trim).filter(|p| !p.is_empty())?;
        if i > 0 {
            s.push('|');
        }
        s.push_str(part);
    }
    if s.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let out = hasher.finalize();
    Some(hex::encode(out))
}

/// Text of one key field that does not depend on the type its column was
/// inferred as in a particular batch.
///
/// `Real(4.5)`, `"4.5"` and `"4.50"` all give `4.5`; `Integer(45)` and
/// `"45.00"` give `45`. Digit strings are kept digit for digit so long card
/// numbers never pass through a float.
pub fn key_component(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(canonical_float(*f)),
        Value::Text(s) => canonical_text(s),
        Value::Blob(b) => canonical_text(&String::from_utf8_lossy(b)),
    }
}

fn canonical_text(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        let body = match digits.trim_start_matches('0') {
            "" => "0",
            body => body,
        };
        return Some(if negative && body != "0" {
            format!("-{}", body)
        } else {
            body.to_string()
        });
    }
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() => Some(canonical_float(f)),
        _ => Some(s.to_string()),
    }
}

fn canonical_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < EXACT_INTEGRAL_F64 {
        (f as i64).to_string()
    } else {
        f.to_string()
    }
}
