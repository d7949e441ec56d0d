//! Runtime values.
//!
//! `Value` is a plain sum type. Heap objects are referenced through
//! generational handles (`GcIdx`), strings through interned `StringId`s, so
//! cloning a value never deep-copies anything.
use crate::gc::{GcIdx, LuaClosure, UserData};
use crate::string::StringId;
use crate::table::Table;
use std::fmt;
use std::rc::Rc;

/// A Lua number: integer and float subtypes are kept apart.
#[derive(Clone, Copy, Debug)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    /// Exact integer value, if any (floats must have no fractional part).
    pub fn to_integer(self) -> Option<i64> {
        match self {
            Number::Integer(i) => Some(i),
            Number::Float(f) => float_to_integer(f),
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Number::Integer(_))
    }

    /// Lua `<` on numbers.
    pub fn lt(self, other: Number) -> bool {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => a < b,
            (a, b) => a.as_f64() < b.as_f64(),
        }
    }

    /// Lua `<=` on numbers.
    pub fn le(self, other: Number) -> bool {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => a <= b,
            (a, b) => a.as_f64() <= b.as_f64(),
        }
    }
}

/// Mathematical equality across subtypes (`1 == 1.0`, `NaN ~= NaN`).
impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Number::Integer(a), Number::Integer(b)) => a == b,
            (Number::Float(a), Number::Float(b)) => a == b,
            (Number::Integer(i), Number::Float(f)) | (Number::Float(f), Number::Integer(i)) => {
                float_to_integer(f) == Some(i)
            }
        }
    }
}

/// Convert a float to integer if it has no fractional part and fits.
pub fn float_to_integer(f: f64) -> Option<i64> {
    if f.is_finite() && f >= -9.223_372_036_854_776e18 && f < 9.223_372_036_854_776e18 {
        let i = f as i64;
        if i as f64 == f {
            return Some(i);
        }
    }
    None
}

/// Handle of a registered native function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

/// Handle of a coroutine (thread). `ThreadId::MAIN` is the host thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId {
    pub const MAIN: ThreadId = ThreadId(0);
}

/// Basic Lua types, used to key per-type metatables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    UserData,
    Thread,
}

impl TypeTag {
    pub const COUNT: usize = 8;

    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Nil => "nil",
            TypeTag::Boolean => "boolean",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::Table => "table",
            TypeTag::Function => "function",
            TypeTag::UserData => "userdata",
            TypeTag::Thread => "thread",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A request, returned by a native function, to call `function` with `args`
/// from the interpreter loop instead of recursing.
#[derive(Debug, Clone)]
pub struct TailCallData {
    pub function: Value,
    pub args: Vec<Value>,
    /// Applied to the callee's result on normal return.
    pub continuation: Option<NativeId>,
    /// Turns a caught error into the call's result.
    pub error_handler: Option<NativeId>,
    /// Runs on the error before the stack is unwound (xpcall).
    pub message_handler: Option<Value>,
}

impl TailCallData {
    pub fn new(function: Value, args: Vec<Value>) -> Self {
        TailCallData {
            function,
            args,
            continuation: None,
            error_handler: None,
            message_handler: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(Number),
    String(StringId),
    Table(GcIdx<Table>),
    Function(GcIdx<LuaClosure>),
    NativeFunction(NativeId),
    UserData(GcIdx<UserData>),
    Thread(ThreadId),
    /// Multiple values; only meaningful as the last element of a list.
    Tuple(Rc<[Value]>),
    TailCallRequest(Rc<TailCallData>),
    YieldRequest(Rc<[Value]>),
    /// Result of a function that returned nothing. Behaves as nil.
    Void,
}

impl Value {
    pub fn integer(i: i64) -> Value {
        Value::Number(Number::Integer(i))
    }

    pub fn float(f: f64) -> Value {
        Value::Number(Number::Float(f))
    }

    pub fn tuple(values: Vec<Value>) -> Value {
        Value::Tuple(values.into())
    }

    pub fn empty_tuple() -> Value {
        Value::Tuple(Rc::from(Vec::new()))
    }

    pub fn is_nil(&self) -> bool {
        match self {
            Value::Nil | Value::Void => true,
            Value::Tuple(t) => t.first().map_or(true, Value::is_nil),
            _ => false,
        }
    }

    /// Lua truthiness: only nil and false are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil | Value::Void | Value::Boolean(false) => false,
            Value::Tuple(t) => t.first().is_some_and(Value::is_truthy),
            _ => true,
        }
    }

    /// Collapse a tuple to its first element (nil when empty).
    pub fn to_scalar(&self) -> Value {
        match self {
            Value::Tuple(t) => t.first().map_or(Value::Nil, Value::to_scalar),
            Value::Void => Value::Nil,
            other => other.clone(),
        }
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        Some(match self {
            Value::Nil | Value::Void => TypeTag::Nil,
            Value::Boolean(_) => TypeTag::Boolean,
            Value::Number(_) => TypeTag::Number,
            Value::String(_) => TypeTag::String,
            Value::Table(_) => TypeTag::Table,
            Value::Function(_) | Value::NativeFunction(_) => TypeTag::Function,
            Value::UserData(_) => TypeTag::UserData,
            Value::Thread(_) => TypeTag::Thread,
            Value::Tuple(_) => return self.to_scalar().type_tag(),
            Value::TailCallRequest(_) | Value::YieldRequest(_) => return None,
        })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_tag().map_or("request", TypeTag::name)
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        self.as_number().and_then(Number::to_integer)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_string_id(&self) -> Option<StringId> {
        match self {
            Value::String(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<GcIdx<Table>> {
        match self {
            Value::Table(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_) | Value::NativeFunction(_))
    }

    /// Raw equality (no metamethods). Strings are interned, so ids compare
    /// contents.
    pub fn raw_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Tuple(_), _) | (_, Value::Tuple(_)) => {
                self.to_scalar().raw_equals(&other.to_scalar())
            }
            (Value::Nil | Value::Void, Value::Nil | Value::Void) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::NativeFunction(a), Value::NativeFunction(b)) => a == b,
            (Value::UserData(a), Value::UserData(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            (Value::TailCallRequest(a), Value::TailCallRequest(b)) => Rc::ptr_eq(a, b),
            (Value::YieldRequest(a), Value::YieldRequest(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::float(f)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

impl From<StringId> for Value {
    fn from(s: StringId) -> Self {
        Value::String(s)
    }
}

impl From<GcIdx<Table>> for Value {
    fn from(t: GcIdx<Table>) -> Self {
        Value::Table(t)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Number::Integer(i) => write!(f, "{i}"),
            Number::Float(x) => f.write_str(&format_float(x)),
        }
    }
}

/// Format a float the way Lua's `%.14g` does for common cases, keeping a
/// trailing `.0` on integral values so the subtype stays visible.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return if f.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f.fract() == 0.0 && f.abs() < 1e16 {
        return format!("{f:.1}");
    }
    let s = format!("{f}");
    if s.len() > 17 {
        format!("{f:e}")
    } else {
        s
    }
}
