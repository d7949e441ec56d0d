//! Host functions callable from scripts.

use crate::error::LuaError;
use crate::vm::Vm;
use tarn_bytecode::SourceRef;
use tarn_core::gc::GcIdx;
use tarn_core::table::Table;
use tarn_core::value::{Number, ThreadId, Value};

/// Signature of a native function. Returning a `TailCallRequest` or
/// `YieldRequest` value asks the processor to perform that action.
pub type NativeFn = fn(&mut NativeContext<'_>) -> Result<Value, LuaError>;

#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// Everything a native function sees of its invocation.
pub struct NativeContext<'a> {
    pub vm: &'a mut Vm,
    /// Arguments with a trailing tuple expanded.
    pub args: Vec<Value>,
    pub name: &'static str,
    pub is_method_call: bool,
    /// Position of the calling instruction, if called from a script.
    pub callsite: Option<SourceRef>,
}

/// Flattens a trailing tuple into the argument list and drops a trailing
/// `Void`.
pub(crate) fn expand_args(mut args: Vec<Value>) -> Vec<Value> {
    match args.last() {
        Some(Value::Tuple(_)) => {
            if let Some(Value::Tuple(items)) = args.pop() {
                args.extend(items.iter().cloned());
            }
        }
        Some(Value::Void) => {
            args.pop();
        }
        _ => {}
    }
    args
}

impl<'a> NativeContext<'a> {
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Argument `i` (0-based) as a scalar; nil when absent.
    pub fn arg(&self, i: usize) -> Value {
        self.args.get(i).map(Value::to_scalar).unwrap_or_default()
    }

    /// Arguments from `i` onward.
    pub fn rest(&self, i: usize) -> Vec<Value> {
        self.args.get(i..).map(<[Value]>::to_vec).unwrap_or_default()
    }

    /// `bad argument #n to 'name' (msg)`.
    pub fn bad_argument(&self, i: usize, msg: &str) -> LuaError {
        LuaError::runtime(format!(
            "bad argument #{} to '{}' ({msg})",
            i + 1,
            self.name
        ))
    }

    fn type_error(&self, i: usize, expected: &str) -> LuaError {
        let got = if i < self.args.len() {
            self.arg(i).type_name()
        } else {
            "no value"
        };
        self.bad_argument(i, &format!("{expected} expected, got {got}"))
    }

    pub fn check_any(&self, i: usize) -> Result<Value, LuaError> {
        if i < self.args.len() {
            Ok(self.arg(i))
        } else {
            Err(self.bad_argument(i, "value expected"))
        }
    }

    pub fn check_table(&self, i: usize) -> Result<GcIdx<Table>, LuaError> {
        match self.arg(i) {
            Value::Table(t) => Ok(t),
            _ => Err(self.type_error(i, "table")),
        }
    }

    pub fn check_function(&self, i: usize) -> Result<Value, LuaError> {
        let v = self.arg(i);
        if v.is_function() {
            Ok(v)
        } else {
            Err(self.type_error(i, "function"))
        }
    }

    pub fn check_thread(&self, i: usize) -> Result<ThreadId, LuaError> {
        match self.arg(i) {
            Value::Thread(t) => Ok(t),
            _ => Err(self.type_error(i, "coroutine")),
        }
    }

    pub fn check_integer(&self, i: usize) -> Result<i64, LuaError> {
        let v = self.arg(i);
        match crate::coerce::to_number(&v, &self.vm.strings) {
            Some(Number::Integer(n)) => Ok(n),
            Some(Number::Float(f)) => tarn_core::value::float_to_integer(f)
                .ok_or_else(|| self.bad_argument(i, "number has no integer representation")),
            None => Err(self.type_error(i, "number")),
        }
    }

    pub fn opt_integer(&self, i: usize, default: i64) -> Result<i64, LuaError> {
        if self.arg(i).is_nil() {
            Ok(default)
        } else {
            self.check_integer(i)
        }
    }

    /// String argument, accepting numbers like the base library does.
    pub fn check_string(&self, i: usize) -> Result<Vec<u8>, LuaError> {
        crate::coerce::to_concat_bytes(&self.arg(i), &self.vm.strings)
            .ok_or_else(|| self.type_error(i, "string"))
    }

    /// Interns `s` and returns it as a string value.
    pub fn string_value(&mut self, s: &str) -> Value {
        Value::String(self.vm.strings.intern(s.as_bytes()))
    }
}
