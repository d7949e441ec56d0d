//! Runtime error types.

use std::fmt;
use tarn_bytecode::BytecodeError;
use tarn_core::value::Value;

/// One line of a stack traceback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackFrameInfo {
    /// Function name taken from its `Meta` instruction or native registration.
    pub name: Option<String>,
    /// `chunk:line` of the instruction executing in this frame.
    pub location: Option<String>,
    pub is_native: bool,
    /// Entry point of a Lua frame.
    pub entry_point: Option<usize>,
}

impl fmt::Display for StackFrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = match (&self.location, self.is_native) {
            (Some(loc), _) => loc.as_str(),
            (None, true) => "[native]",
            (None, false) => "?",
        };
        match &self.name {
            Some(name) => write!(f, "{location}: in function '{name}'"),
            None => write!(f, "{location}: in function <{}>", self.entry_point.unwrap_or(0)),
        }
    }
}

/// A script-visible error: the thrown value plus the diagnostics gathered
/// while it propagates.
#[derive(Clone, Debug, Default)]
pub struct ScriptError {
    /// Thrown value. `None` means the message string itself.
    pub value: Option<Value>,
    /// Undecorated message (or a description of a non-string value).
    pub message: String,
    /// Message prefixed with the source position, once known.
    pub decorated: Option<String>,
    /// Suppresses position decoration (`error(msg, 0)`, handler results).
    pub do_not_decorate: bool,
    /// 1 blames the faulting instruction, 2 the caller of the current
    /// function.
    pub level: u32,
    pub traceback: Vec<StackFrameInfo>,
    /// Instruction that raised the error.
    pub instruction_ptr: Option<usize>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        ScriptError {
            message: message.into(),
            level: 1,
            ..Default::default()
        }
    }

    /// Message as shown to the host: decorated when available.
    pub fn display_message(&self) -> &str {
        self.decorated.as_deref().unwrap_or(&self.message)
    }

    /// Whether the thrown value is (or will become) a string.
    pub fn has_string_payload(&self) -> bool {
        matches!(self.value, None | Some(Value::String(_)))
    }

    pub fn format_traceback(&self) -> String {
        format_traceback(&self.traceback)
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_message())
    }
}

/// Renders frames the way `debug.traceback` does.
pub fn format_traceback(frames: &[StackFrameInfo]) -> String {
    let mut out = String::from("stack traceback:");
    for frame in frames {
        out.push_str("\n\t");
        out.push_str(&frame.to_string());
    }
    out
}

/// Every failure the VM can report.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LuaError {
    /// Catchable by `pcall`/`xpcall`.
    #[error("{0}")]
    Runtime(Box<ScriptError>),
    /// Malformed bytecode or a broken VM invariant. Never caught by scripts.
    #[error("internal error: {0}")]
    Internal(String),
    /// Invalid input from the host API.
    #[error("{0}")]
    Argument(String),
}

impl From<BytecodeError> for LuaError {
    fn from(e: BytecodeError) -> Self {
        LuaError::Internal(e.to_string())
    }
}

impl From<ScriptError> for LuaError {
    fn from(e: ScriptError) -> Self {
        LuaError::Runtime(Box::new(e))
    }
}

impl LuaError {
    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::new(message).into()
    }

    /// `error(value)` with a non-string (or string) payload.
    pub fn with_value(value: Value, message: impl Into<String>, level: u32) -> Self {
        ScriptError {
            value: Some(value),
            message: message.into(),
            do_not_decorate: level == 0,
            level,
            ..Default::default()
        }
        .into()
    }

    pub fn internal(message: impl Into<String>) -> Self {
        LuaError::Internal(message.into())
    }

    pub fn as_script_error(&self) -> Option<&ScriptError> {
        match self {
            LuaError::Runtime(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_runtime(&self) -> bool {
        matches!(self, LuaError::Runtime(_))
    }

    pub fn arithmetic(type_name: &str) -> Self {
        Self::runtime(format!(
            "attempt to perform arithmetic on a {type_name} value"
        ))
    }

    pub fn bitwise(type_name: &str) -> Self {
        Self::runtime(format!(
            "attempt to perform bitwise operation on a {type_name} value"
        ))
    }

    pub fn no_integer_representation() -> Self {
        Self::runtime("number has no integer representation")
    }

    pub fn compare(left: &str, right: &str) -> Self {
        if left == right {
            Self::runtime(format!("attempt to compare two {left} values"))
        } else {
            Self::runtime(format!("attempt to compare {left} with {right}"))
        }
    }

    pub fn concat(type_name: &str) -> Self {
        Self::runtime(format!("attempt to concatenate a {type_name} value"))
    }

    pub fn length(type_name: &str) -> Self {
        Self::runtime(format!("attempt to get length of a {type_name} value"))
    }

    pub fn index(type_name: &str, key: Option<&str>) -> Self {
        match key {
            Some(key) => Self::runtime(format!(
                "attempt to index a {type_name} value (field '{key}')"
            )),
            None => Self::runtime(format!("attempt to index a {type_name} value")),
        }
    }

    pub fn index_loop(newindex: bool) -> Self {
        let event = if newindex { "__newindex" } else { "__index" };
        Self::runtime(format!("'{event}' chain too long; possible loop"))
    }

    pub fn call(type_name: &str, name: Option<&str>) -> Self {
        match name {
            Some(name) => Self::runtime(format!(
                "attempt to call a {type_name} value near '{name}'"
            )),
            None => Self::runtime(format!("attempt to call a {type_name} value")),
        }
    }

    pub fn non_closable(name: &str) -> Self {
        Self::runtime(format!("variable '{name}' got a non-closable value"))
    }

    pub fn for_loop(stage: i32) -> Self {
        let what = match stage {
            0 => "initial value",
            1 => "limit",
            _ => "step",
        };
        Self::runtime(format!("'for' {what} must be a number"))
    }

    pub fn stack_overflow() -> Self {
        Self::runtime("stack overflow")
    }

    pub fn dead_coroutine() -> Self {
        Self::runtime("cannot resume dead coroutine")
    }

    pub fn non_suspended_coroutine() -> Self {
        Self::runtime("cannot resume non-suspended coroutine")
    }

    pub fn yield_across_boundary() -> Self {
        Self::runtime("attempt to yield across a C-call boundary")
    }

    pub fn yield_outside_coroutine() -> Self {
        Self::runtime("attempt to yield from outside a coroutine")
    }
}
