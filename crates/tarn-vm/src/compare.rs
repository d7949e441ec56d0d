//! Comparison operations with Lua 5.4 semantics.

use tarn_core::string::StringInterner;
use tarn_core::value::Value;

/// Result of an ordering comparison that may need a metamethod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareResult {
    Ok(bool),
    NeedMetamethod,
}

/// Lua `<`: numbers by value (integers and floats mixed), strings bytewise.
pub fn less_than(a: &Value, b: &Value, strings: &StringInterner) -> CompareResult {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => CompareResult::Ok(x.lt(*y)),
        (Value::String(x), Value::String(y)) => {
            CompareResult::Ok(strings.get_bytes(*x) < strings.get_bytes(*y))
        }
        _ => CompareResult::NeedMetamethod,
    }
}

/// Lua `<=`.
pub fn less_equal(a: &Value, b: &Value, strings: &StringInterner) -> CompareResult {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => CompareResult::Ok(x.le(*y)),
        (Value::String(x), Value::String(y)) => {
            CompareResult::Ok(strings.get_bytes(*x) <= strings.get_bytes(*y))
        }
        _ => CompareResult::NeedMetamethod,
    }
}

/// Whether `==` on these operands may consult `__eq`: both tables or both
/// userdata, and not the same object.
pub fn eq_needs_metamethod(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Table(x), Value::Table(y)) => x != y,
        (Value::UserData(x), Value::UserData(y)) => x != y,
        _ => false,
    }
}
