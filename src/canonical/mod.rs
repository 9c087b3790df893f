//! Canonical JSON encoding used as hashing input
//!
//! Output follows RFC 8785 (JCS):
//! 1. Object keys sorted by UTF-16 code units
//! 2. No insignificant whitespace
//! 3. Integers printed exactly, finite floats in ECMAScript shortest form
//! 4. Minimal string escaping
//!
//! On top of JCS a monetary policy applies: fields named in the policy must
//! carry decimal strings. A JSON number in such a field is rejected rather
//! than encoded, since binary floats cannot represent most decimal amounts
//! and two producers could disagree on their rendering.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use thiserror::Error;

/// Structures nested deeper than this are rejected.
pub const MAX_DEPTH: usize = 128;

/// Field names treated as monetary unless configured otherwise.
pub const DEFAULT_MONETARY_FIELDS: &[&str] = &[
    "amount",
    "price",
    "cost",
    "fee",
    "notional",
    "pnl",
    "market_value",
    "cash_balance",
    "total_value",
    "portfolio_value",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalizationError {
    #[error("monetary field '{path}' must be a decimal string, got a JSON number")]
    MonetaryNumber { path: String },

    #[error("monetary field '{path}' is not a decimal literal: {value:?}")]
    InvalidDecimal { path: String, value: String },

    #[error("non-finite number at '{path}'")]
    NonFiniteNumber { path: String },

    #[error("max depth exceeded: JSON nested deeper than {max_depth} levels")]
    MaxDepthExceeded { max_depth: usize },

    #[error("payload could not be serialized: {message}")]
    Serialization { message: String },

    #[error("payload is not valid JSON: {message}")]
    Parse { message: String },
}

type CanonResult<T> = std::result::Result<T, CanonicalizationError>;

/// Deterministic, key-order independent JSON encoder.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    monetary_fields: BTreeSet<String>,
}

impl Canonicalizer {
    pub fn new() -> Self {
        Self::with_monetary_fields(DEFAULT_MONETARY_FIELDS.iter().copied())
    }

    /// Plain RFC 8785 without the monetary policy.
    pub fn permissive() -> Self {
        Self {
            monetary_fields: BTreeSet::new(),
        }
    }

    pub fn with_monetary_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            monetary_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn monetary_fields(&self) -> impl Iterator<Item = &str> {
        self.monetary_fields.iter().map(String::as_str)
    }

    /// Canonical bytes of `payload`. Pure; no side effects.
    pub fn canonicalize(&self, payload: &Value) -> CanonResult<Vec<u8>> {
        let mut out = String::new();
        self.emit_value(payload, "$", 0, &mut out)?;
        Ok(out.into_bytes())
    }

    pub fn canonicalize_serializable<T: Serialize>(&self, value: &T) -> CanonResult<Vec<u8>> {
        let value = serde_json::to_value(value).map_err(|e| CanonicalizationError::Serialization {
            message: e.to_string(),
        })?;
        self.canonicalize(&value)
    }

    pub fn canonicalize_str(&self, json: &str) -> CanonResult<Vec<u8>> {
        let value: Value = serde_json::from_str(json).map_err(|e| CanonicalizationError::Parse {
            message: e.to_string(),
        })?;
        self.canonicalize(&value)
    }

    /// True when `bytes` already are the canonical encoding of themselves.
    pub fn is_canonical(&self, bytes: &[u8]) -> bool {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| self.canonicalize_str(s).ok())
            .is_some_and(|canonical| canonical == bytes)
    }

    fn is_monetary(&self, key: &str) -> bool {
        self.monetary_fields.contains(key)
    }

    fn emit_value(&self, value: &Value, path: &str, depth: usize, out: &mut String) -> CanonResult<()> {
        if depth > MAX_DEPTH {
            return Err(CanonicalizationError::MaxDepthExceeded {
                max_depth: MAX_DEPTH,
            });
        }

        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Number(n) => emit_number(n, path, out)?,
            Value::String(s) => emit_string(s, out),
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.emit_value(item, &format!("{path}[{i}]"), depth + 1, out)?;
                }
                out.push(']');
            }
            Value::Object(map) => self.emit_object(map, path, depth, out)?,
        }
        Ok(())
    }

    fn emit_object(&self, map: &Map<String, Value>, path: &str, depth: usize, out: &mut String) -> CanonResult<()> {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

        out.push('{');
        for (i, key) in keys.into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let value = &map[key];
            let child = format!("{path}.{key}");

            if self.is_monetary(key) {
                check_monetary(value, &child)?;
            }

            emit_string(key, out);
            out.push(':');
            self.emit_value(value, &child, depth + 1, out)?;
        }
        out.push('}');
        Ok(())
    }
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonicalize with the default monetary policy.
pub fn canonicalize(payload: &Value) -> CanonResult<Vec<u8>> {
    Canonicalizer::default().canonicalize(payload)
}

fn check_monetary(value: &Value, path: &str) -> CanonResult<()> {
    match value {
        Value::Number(_) => Err(CanonicalizationError::MonetaryNumber {
            path: path.to_string(),
        }),
        Value::String(s) if !is_decimal_literal(s) => Err(CanonicalizationError::InvalidDecimal {
            path: path.to_string(),
            value: s.clone(),
        }),
        _ => Ok(()),
    }
}

/// `-?[0-9]+(\.[0-9]+)?`
fn is_decimal_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let (int, frac) = match digits.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (digits, None),
    };
    let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    all_digits(int) && frac.map_or(true, all_digits)
}

fn emit_number(n: &Number, path: &str, out: &mut String) -> CanonResult<()> {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else {
        let f = n.as_f64().unwrap_or(f64::NAN);
        if !f.is_finite() {
            return Err(CanonicalizationError::NonFiniteNumber {
                path: path.to_string(),
            });
        }
        out.push_str(&format_float(f));
    }
    Ok(())
}

/// ECMAScript `Number.prototype.toString` for finite doubles.
fn format_float(f: f64) -> String {
    if f == 0.0 {
        return "0".to_string();
    }

    let abs = f.abs();
    if (1e-6..1e21).contains(&abs) {
        // Rust's Display is shortest round-trip without exponent.
        return format!("{f}");
    }

    let s = format!("{f:e}");
    match s.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => s,
    }
}

fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon(value: &Value) -> String {
        String::from_utf8(Canonicalizer::permissive().canonicalize(value).unwrap()).unwrap()
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"ticker":"AAPL","side":"buy","qty":10}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"qty":10,"side":"buy","ticker":"AAPL"}"#).unwrap();
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
        assert_eq!(canon(&a), r#"{"qty":10,"side":"buy","ticker":"AAPL"}"#);
    }

    #[test]
    fn test_nested_objects_and_arrays() {
        let value = json!({"outer": {"z": [3, {"b": 1, "a": 2}], "a": null}});
        assert_eq!(canon(&value), r#"{"outer":{"a":null,"z":[3,{"a":2,"b":1}]}}"#);
    }

    #[test]
    fn test_whitespace_is_removed() {
        let bytes = Canonicalizer::permissive()
            .canonicalize_str("{ \"b\" : true ,\n \"a\" : [ 1 , 2 ] }")
            .unwrap();
        assert_eq!(bytes, br#"{"a":[1,2],"b":true}"#);
    }

    #[test]
    fn test_decimal_string_differs_from_float() {
        let as_string = canon(&json!({"note": "100.10"}));
        let as_float = canon(&json!({"note": 100.10}));
        assert_eq!(as_string, r#"{"note":"100.10"}"#);
        assert_eq!(as_float, r#"{"note":100.1}"#);
        assert_ne!(as_string, as_float);
    }

    #[test]
    fn test_monetary_float_is_rejected() {
        let err = canonicalize(&json!({"order": {"price": 100.10}})).unwrap_err();
        assert_eq!(
            err,
            CanonicalizationError::MonetaryNumber {
                path: "$.order.price".to_string()
            }
        );
    }

    #[test]
    fn test_monetary_integer_is_rejected() {
        let err = canonicalize(&json!({"amount": 100})).unwrap_err();
        assert!(matches!(err, CanonicalizationError::MonetaryNumber { .. }));
    }

    #[test]
    fn test_monetary_string_must_be_decimal() {
        assert!(canonicalize(&json!({"amount": "100.10"})).is_ok());
        assert!(canonicalize(&json!({"amount": "-0.5"})).is_ok());
        assert!(canonicalize(&json!({"amount": null})).is_ok());

        for bad in ["1e3", "100.", ".5", "", "12,00", "NaN"] {
            let err = canonicalize(&json!({"amount": bad})).unwrap_err();
            assert!(matches!(err, CanonicalizationError::InvalidDecimal { .. }), "{bad}");
        }
    }

    #[test]
    fn test_custom_monetary_fields() {
        let canonicalizer = Canonicalizer::with_monetary_fields(["premium"]);
        assert!(canonicalizer.canonicalize(&json!({"premium": 1.5})).is_err());
        assert!(canonicalizer.canonicalize(&json!({"amount": 1.5})).is_ok());
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(canon(&json!(1.0)), "1");
        assert_eq!(canon(&json!(-0.0)), "0");
        assert_eq!(canon(&json!(0.1)), "0.1");
        assert_eq!(canon(&json!(1e21)), "1e+21");
        assert_eq!(canon(&json!(1e20)), "100000000000000000000");
        assert_eq!(canon(&json!(1.5e-7)), "1.5e-7");
        assert_eq!(canon(&json!(0.000001)), "0.000001");
        assert_eq!(canon(&json!(u64::MAX)), "18446744073709551615");
        assert_eq!(canon(&json!(-42)), "-42");
    }

    #[test]
    fn test_string_escaping() {
        let value = json!("quote\" slash\\ nl\n tab\t bell\u{0007} del\u{007f} é");
        assert_eq!(
            canon(&value),
            "\"quote\\\" slash\\\\ nl\\n tab\\t bell\\u0007 del\u{007f} é\""
        );
    }

    #[test]
    fn test_keys_sort_by_utf16_code_units() {
        // U+1F600 encodes as a surrogate pair (0xD83D...) which sorts before U+E000
        // in UTF-16 even though its UTF-8 encoding sorts after.
        let value = json!({"\u{e000}": 1, "\u{1F600}": 2});
        assert_eq!(canon(&value), "{\"\u{1F600}\":2,\"\u{e000}\":1}");
    }

    #[test]
    fn test_is_canonical() {
        let canonicalizer = Canonicalizer::default();
        assert!(canonicalizer.is_canonical(br#"{"a":1,"b":"2.00"}"#));
        assert!(!canonicalizer.is_canonical(br#"{"b":"2.00","a":1}"#));
        assert!(!canonicalizer.is_canonical(br#"{"a": 1}"#));
        assert!(!canonicalizer.is_canonical(b"not json"));
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!(0);
        for _ in 0..(MAX_DEPTH + 5) {
            value = json!([value]);
        }
        let err = Canonicalizer::permissive().canonicalize(&value).unwrap_err();
        assert!(matches!(err, CanonicalizationError::MaxDepthExceeded { .. }));
    }
}
