//! Type coercion helpers.

use tarn_core::string::StringInterner;
use tarn_core::value::{float_to_integer, Number, Value};

/// Parse a numeric string the way the lexer would: decimal or hex integers,
/// then floats. Surrounding whitespace is allowed.
pub fn str_to_number(bytes: &[u8]) -> Option<Number> {
    let s = std::str::from_utf8(bytes).ok()?.trim();
    if s.is_empty() {
        return None;
    }
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        // Hex integers wrap around like the lexer does.
        let mut acc: i64 = 0;
        if hex.is_empty() {
            return None;
        }
        for c in hex.chars() {
            let d = c.to_digit(16)? as i64;
            acc = acc.wrapping_mul(16).wrapping_add(d);
        }
        return Some(Number::Integer(if negative { acc.wrapping_neg() } else { acc }));
    }
    if body.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = s.parse::<i64>() {
            return Some(Number::Integer(i));
        }
    }
    // Reject forms Rust accepts but Lua does not.
    let lower = body.to_ascii_lowercase();
    if lower.starts_with("inf") || lower.starts_with("nan") {
        return None;
    }
    s.parse::<f64>().ok().map(Number::Float)
}

/// Number coercion: numbers pass through, numeric strings convert.
pub fn to_number(v: &Value, strings: &StringInterner) -> Option<Number> {
    match v {
        Value::Number(n) => Some(*n),
        Value::String(s) => str_to_number(strings.get_bytes(*s)),
        Value::Tuple(_) => to_number(&v.to_scalar(), strings),
        _ => None,
    }
}

/// Integer coercion: floats and numeric strings must be integral.
pub fn to_integer(v: &Value, strings: &StringInterner) -> Option<i64> {
    match to_number(v, strings)? {
        Number::Integer(i) => Some(i),
        Number::Float(f) => float_to_integer(f),
    }
}

/// Bytes a value contributes to a concatenation, if it is a string or a
/// number.
pub fn to_concat_bytes(v: &Value, strings: &StringInterner) -> Option<Vec<u8>> {
    match v {
        Value::String(s) => Some(strings.get_bytes(*s).to_vec()),
        Value::Number(n) => Some(n.to_string().into_bytes()),
        Value::Tuple(_) => to_concat_bytes(&v.to_scalar(), strings),
        _ => None,
    }
}
