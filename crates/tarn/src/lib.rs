//! tarn: an embeddable, stack-based Lua bytecode interpreter.
//!
//! A front-end emits instructions into [`Interpreter::code_mut`], then loads
//! a function entry point and runs it. The interpreter owns one [`Vm`] with
//! the base, coroutine and debug libraries opened.
//!
//! ```ignore
//! let mut lua = Interpreter::new();
//! let mark = lua.code_mut().begin_function(None, MetaKind::ChunkEntryPoint, &frame, &[]);
//! lua.code_mut().emit_literal(Value::integer(42));
//! lua.code_mut().emit_ret(1);
//! let entry = lua.code_mut().end_function(mark);
//! assert_eq!(lua.run(entry)?.as_integer(), Some(42));
//! ```

use std::ops::{Deref, DerefMut};

pub use tarn_bytecode::{
    ByteCode, BytecodeError, FunctionMark, IndexFlavor, Instruction, MetaKind, OpCode,
    RuntimeScopeBlock, RuntimeScopeFrame, SourceRef, SymbolAttributes, SymbolRef,
};
pub use tarn_core::string::{StringId, StringInterner};
pub use tarn_core::value::{Number, ThreadId, Value};
pub use tarn_vm::{
    CoroutineState, LuaError, NativeContext, NativeFn, ScriptError, StackFrameInfo, UpvaluesKind,
    Vm, VmOptions,
};

pub struct Interpreter {
    vm: Vm,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut vm = Vm::new(options);
        tarn_stdlib::open_libs(&mut vm);
        Interpreter { vm }
    }

    /// The instruction stream; functions emitted here can be loaded by
    /// entry point.
    pub fn code_mut(&mut self) -> &mut ByteCode {
        &mut self.vm.code
    }

    /// Interns `name`; emitters take string ids for symbol and debug names.
    pub fn intern(&mut self, name: &str) -> StringId {
        self.vm.strings.intern(name.as_bytes())
    }

    /// Wraps the function at `entry` in a closure bound to the globals.
    pub fn load(&mut self, entry: usize) -> Result<Value, LuaError> {
        self.vm.load_function(entry)
    }

    /// Loads the function at `entry` and calls it with no arguments.
    pub fn run(&mut self, entry: usize) -> Result<Value, LuaError> {
        let f = self.load(entry)?;
        self.vm.call(f, Vec::new())
    }

    /// Like [`Interpreter::run`], but converts a script error into its
    /// message and the call result into a flat value list.
    pub fn run_values(&mut self, entry: usize) -> Result<Vec<Value>, String> {
        match self.run(entry) {
            Ok(v) => Ok(flatten(v)),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Listing of the whole instruction stream.
    pub fn disassemble(&self) -> String {
        tarn_bytecode::disasm::disassemble(&self.vm.code, &self.vm.strings)
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn into_vm(self) -> Vm {
        self.vm
    }
}

impl Deref for Interpreter {
    type Target = Vm;

    fn deref(&self) -> &Vm {
        &self.vm
    }
}

impl DerefMut for Interpreter {
    fn deref_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

/// Spreads a call result into plain values: tuples expand, `Void` is empty.
pub fn flatten(value: Value) -> Vec<Value> {
    match value {
        Value::Tuple(items) => items.iter().cloned().collect(),
        Value::Void => Vec::new(),
        other => vec![other],
    }
}
