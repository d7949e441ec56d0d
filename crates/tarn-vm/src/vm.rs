//! The VM instance: heap, interned strings, the shared instruction stream
//! and the live state of the running thread.

use crate::builtins;
use crate::callstack::{CallStack, FLAG_CALL_ENTRY_POINT};
use crate::coroutine::Coroutine;
use crate::dispatch::{CallSite, Flow};
use crate::error::{LuaError, ScriptError, StackFrameInfo};
use crate::metamethod::MetamethodNames;
use crate::native::{expand_args, NativeContext, NativeFn, NativeFunction};
use crate::options::VmOptions;
use crate::stack::FastStack;
use std::rc::Rc;
use tarn_bytecode::{ByteCode, MetaKind, OpCode, SourceRef};
use tarn_core::gc::{ClosureContext, GcHeap, GcIdx, LuaClosure, UpVal};
use tarn_core::string::{StringId, StringInterner};
use tarn_core::table::Table;
use tarn_core::value::{NativeId, TailCallData, ThreadId, TypeTag, Value};

/// What a closure captures, as far as dumping is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpvaluesKind {
    None,
    /// Exactly one upvalue, `_ENV`.
    Environment,
    Closure,
}

pub struct Vm {
    /// The instruction stream shared by every function of this VM.
    pub code: ByteCode,
    pub heap: GcHeap,
    pub strings: StringInterner,
    pub options: VmOptions,
    pub globals: GcIdx<Table>,
    pub(crate) names: MetamethodNames,
    pub(crate) natives: Vec<NativeFunction>,
    pub(crate) type_metatables: [Option<GcIdx<Table>>; TypeTag::COUNT],
    // Live state of the running thread; swapped on resume/yield.
    pub(crate) stack: FastStack<Value>,
    pub(crate) call_stack: CallStack,
    pub(crate) can_yield: bool,
    pub(crate) saved_ip: Option<usize>,
    pub(crate) running: ThreadId,
    pub(crate) coroutines: Vec<Coroutine>,
    /// Nested host-side re-entries (host calls, resumes, closers).
    pub(crate) native_depth: usize,
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        let mut strings = StringInterner::new();
        let names = MetamethodNames::init(&mut strings);
        let mut heap = GcHeap::new();
        let globals = heap.alloc_table(0, 64);
        Vm {
            code: ByteCode::new(),
            heap,
            strings,
            options,
            globals,
            names,
            natives: builtins::natives(),
            type_metatables: [None; TypeTag::COUNT],
            stack: FastStack::with_capacity(1024),
            call_stack: CallStack::with_capacity(64),
            can_yield: false,
            saved_ip: None,
            running: ThreadId::MAIN,
            coroutines: vec![Coroutine::main()],
            native_depth: 0,
        }
    }

    pub fn names(&self) -> &MetamethodNames {
        &self.names
    }

    /// Registers a host function and returns its function value.
    pub fn register_native(&mut self, name: &'static str, func: NativeFn) -> Value {
        let id = NativeId(self.natives.len() as u32);
        self.natives.push(NativeFunction { name, func });
        Value::NativeFunction(id)
    }

    pub fn native(&self, id: NativeId) -> Option<&NativeFunction> {
        self.natives.get(id.0 as usize)
    }

    /// The first native registered under `name`.
    pub fn find_native(&self, name: &str) -> Option<Value> {
        self.natives
            .iter()
            .position(|n| n.name == name)
            .map(|i| Value::NativeFunction(NativeId(i as u32)))
    }

    /// The primitive `next`, also used by generic `for` over plain tables.
    pub fn next_function(&self) -> Value {
        Value::NativeFunction(builtins::NEXT)
    }

    /// Interns `s` as a string value.
    pub fn string_value(&mut self, s: &str) -> Value {
        Value::String(self.strings.intern(s.as_bytes()))
    }

    pub fn new_table(&mut self) -> Value {
        Value::Table(self.heap.alloc_table(0, 0))
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let key = self.strings.intern(name.as_bytes());
        self.heap.tables[self.globals].raw_set_str(key, value);
    }

    pub fn get_global(&self, name: &str) -> Value {
        match self.strings.find(name.as_bytes()) {
            Some(key) => self.heap.tables[self.globals].raw_get_str(key),
            None => Value::Nil,
        }
    }

    /// Sets `table[name] = value` without metamethods.
    pub fn set_field(&mut self, table: GcIdx<Table>, name: &str, value: Value) {
        let key = self.strings.intern(name.as_bytes());
        self.heap.tables[table].raw_set_str(key, value);
    }

    /// Value-stack height of the running thread.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Call-stack depth of the running thread.
    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub(crate) fn pop_value(&mut self) -> Result<Value, LuaError> {
        self.stack
            .pop()
            .ok_or_else(|| LuaError::internal("value stack underflow"))
    }

    pub(crate) fn peek_value(&self, offset: usize) -> Result<&Value, LuaError> {
        self.stack
            .peek(offset)
            .ok_or_else(|| LuaError::internal("value stack underflow"))
    }

    /// Creates a closure for the function whose `Meta` instruction is at
    /// `entry`, with the globals table as its `_ENV` upvalue.
    pub fn load_function(&mut self, entry: usize) -> Result<Value, LuaError> {
        match self.code.code.get(entry) {
            Some(instr) if instr.op == OpCode::Meta => {}
            _ => {
                return Err(LuaError::Argument(format!(
                    "instruction {entry} is not a function entry point"
                )))
            }
        }
        let context = self.env_context();
        Ok(Value::Function(self.heap.alloc_closure(entry, context)))
    }

    pub(crate) fn env_context(&mut self) -> GcIdx<ClosureContext> {
        let cell = self.heap.alloc_upval(Value::Table(self.globals));
        self.heap.alloc_context(ClosureContext {
            cells: vec![cell],
            names: vec![self.names.env],
        })
    }

    /// Calls `function` from the host and runs it to completion. Scripts
    /// running below this call cannot yield.
    pub fn call(&mut self, function: Value, args: Vec<Value>) -> Result<Value, LuaError> {
        if self.native_depth >= self.options.max_native_depth {
            return Err(LuaError::stack_overflow());
        }
        self.native_depth += 1;
        let (depth, height) = (self.call_stack.len(), self.stack.len());
        let saved = std::mem::replace(&mut self.can_yield, false);
        let result = self.call_inner(function, args, FLAG_CALL_ENTRY_POINT);
        if let Err(LuaError::Internal(_)) = &result {
            // Nothing unwound the frames this call pushed.
            self.call_stack.crop(depth);
            self.stack.crop(height);
        }
        self.can_yield = saved;
        self.native_depth -= 1;
        result
    }

    /// Pushes `function` and `args`, enters it and runs the processing loop
    /// until the entry frame returns. `entry_flag` marks the entry frame.
    pub(crate) fn call_inner(
        &mut self,
        function: Value,
        args: Vec<Value>,
        entry_flag: u8,
    ) -> Result<Value, LuaError> {
        match function {
            Value::Function(_) => {
                let fn_pos = self.stack.len();
                let argc = args.len();
                self.stack.push(function);
                self.stack.extend(args);
                let site = CallSite {
                    flags: entry_flag,
                    ..Default::default()
                };
                match self.exec_call(argc, None, site) {
                    Ok(Flow::Continue(ip)) => self.processing_loop(ip),
                    Ok(_) => Err(LuaError::internal("entry call did not enter a function")),
                    Err(e) => {
                        self.stack.crop(fn_pos);
                        Err(e)
                    }
                }
            }
            Value::NativeFunction(id) => {
                let result = self.invoke_native(id, args, false, None)?;
                self.resolve_host_request(result)
            }
            other => match self.get_metamethod(&other, self.names.call) {
                Some(handler) => {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(other);
                    full.extend(args);
                    self.call_inner(handler, full, entry_flag)
                }
                None => Err(LuaError::call(other.type_name(), None)),
            },
        }
    }

    /// Performs the request a native returned when there is no processing
    /// loop to hand it to.
    fn resolve_host_request(&mut self, value: Value) -> Result<Value, LuaError> {
        match value {
            Value::TailCallRequest(request) => {
                let result = match self.call_inner(
                    request.function.clone(),
                    request.args.clone(),
                    FLAG_CALL_ENTRY_POINT,
                ) {
                    Err(LuaError::Runtime(mut e)) if request.error_handler.is_some() => {
                        if let Some(handler) = request.message_handler.clone() {
                            self.apply_message_handler(handler, &mut e)?;
                        }
                        let value = self.error_value(&e);
                        let handler = request
                            .error_handler
                            .ok_or_else(|| LuaError::internal("missing error handler"))?;
                        return self.invoke_native(handler, vec![value], false, None);
                    }
                    other => other?,
                };
                match request.continuation {
                    Some(continuation) => {
                        let out = self.invoke_native(continuation, vec![result], false, None)?;
                        self.resolve_host_request(out)
                    }
                    None => Ok(result),
                }
            }
            Value::YieldRequest(_) => Err(self.yield_error()),
            other => Ok(other),
        }
    }

    pub(crate) fn yield_error(&self) -> LuaError {
        if self.running == ThreadId::MAIN {
            LuaError::yield_outside_coroutine()
        } else {
            LuaError::yield_across_boundary()
        }
    }

    /// Runs a native function with a fresh context.
    pub(crate) fn invoke_native(
        &mut self,
        id: NativeId,
        args: Vec<Value>,
        is_method_call: bool,
        callsite: Option<SourceRef>,
    ) -> Result<Value, LuaError> {
        let native = *self
            .natives
            .get(id.0 as usize)
            .ok_or_else(|| LuaError::internal(format!("unknown native function {}", id.0)))?;
        let mut ctx = NativeContext {
            vm: self,
            args: expand_args(args),
            name: native.name,
            is_method_call,
            callsite,
        };
        (native.func)(&mut ctx)
    }

    /// A request that calls `function(args...)` in protected mode: the result
    /// becomes `true, results...`, an error becomes `false, err`.
    /// `message_handler` (xpcall) sees the error before unwinding.
    pub fn protected_call_request(
        &self,
        function: Value,
        args: Vec<Value>,
        message_handler: Option<Value>,
    ) -> Value {
        Value::TailCallRequest(Rc::new(TailCallData {
            function,
            args,
            continuation: Some(builtins::PCALL_CONTINUATION),
            error_handler: Some(builtins::PCALL_ERROR_HANDLER),
            message_handler,
        }))
    }

    /// Runs an xpcall message handler on `e`; its result replaces the
    /// error value. A failing handler yields "error in error handling".
    pub(crate) fn apply_message_handler(
        &mut self,
        handler: Value,
        e: &mut ScriptError,
    ) -> Result<(), LuaError> {
        let value = self.error_value(e);
        match self.call(handler, vec![value]) {
            Ok(result) => {
                let result = result.to_scalar();
                e.message = self.tostring_raw(&result);
                e.value = Some(result);
            }
            Err(LuaError::Runtime(inner)) => {
                e.message = format!("error in error handling ({})", inner.display_message());
                e.value = None;
            }
            Err(other) => return Err(other),
        }
        e.decorated = None;
        e.do_not_decorate = true;
        Ok(())
    }

    /// The value a script sees for a caught error.
    pub fn error_value(&mut self, e: &ScriptError) -> Value {
        match (&e.decorated, &e.value) {
            (Some(decorated), _) => Value::String(self.strings.intern(decorated.as_bytes())),
            (None, Some(value)) => value.clone(),
            (None, None) => Value::String(self.strings.intern(e.message.as_bytes())),
        }
    }

    fn function_name(&self, entry_point: usize) -> Option<String> {
        let meta = self.code.code.get(entry_point)?;
        if meta.op != OpCode::Meta {
            return None;
        }
        if meta.num_val2 == MetaKind::ChunkEntryPoint as i32 {
            return Some("main chunk".to_string());
        }
        meta.name.map(|n| self.strings.get_str(n).into_owned())
    }

    /// Walks the call stack from the top. `current_ip` locates the topmost
    /// Lua frame; each deeper frame is located by the call site of the frame
    /// above it.
    pub(crate) fn stack_trace_from(
        &self,
        current_ip: Option<usize>,
        skip: usize,
    ) -> Vec<StackFrameInfo> {
        let mut location: Option<SourceRef> = current_ip
            .and_then(|ip| self.code.code.get(ip))
            .and_then(|i| i.source);
        let mut out = Vec::new();
        for (depth, frame) in self.call_stack.iter_from_top().enumerate() {
            let info = match frame.native {
                Some(id) => StackFrameInfo {
                    name: self.native(id).map(|n| n.name.to_string()),
                    location: None,
                    is_native: true,
                    entry_point: None,
                },
                None => StackFrameInfo {
                    name: self.function_name(frame.debug_entry_point),
                    location: location.map(|s| s.format(&self.strings)),
                    is_native: false,
                    entry_point: Some(frame.debug_entry_point),
                },
            };
            if depth >= skip {
                out.push(info);
            }
            location = frame.calling_source;
        }
        out
    }

    /// Current stack trace of the running thread, innermost first.
    pub fn get_stack_trace(&self, skip: usize) -> Vec<StackFrameInfo> {
        self.stack_trace_from(None, skip)
    }

    /// Plain string form of a value, without metamethods.
    pub fn tostring_raw(&self, value: &Value) -> String {
        match value {
            Value::Nil | Value::Void => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => self.strings.get_str(*s).into_owned(),
            Value::Table(t) => format!("table: 0x{:08x}", t.to_bits()),
            Value::Function(f) => format!("function: 0x{:08x}", f.to_bits()),
            Value::NativeFunction(id) => format!("function: builtin: 0x{:08x}", id.0),
            Value::UserData(u) => format!("userdata: 0x{:08x}", u.to_bits()),
            Value::Thread(t) => format!("thread: 0x{:08x}", t.0),
            Value::Tuple(_) => self.tostring_raw(&value.to_scalar()),
            Value::TailCallRequest(_) | Value::YieldRequest(_) => "request".to_string(),
        }
    }

    /// `tostring` semantics: `__tostring`, then `__name`, then the plain form.
    pub fn tostring(&mut self, value: &Value) -> Result<String, LuaError> {
        let value = value.to_scalar();
        if let Some(handler) = self.get_metamethod(&value, self.names.tostring) {
            return match self.call(handler, vec![value])?.to_scalar() {
                Value::String(s) => Ok(self.strings.get_str(s).into_owned()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(LuaError::runtime("'__tostring' must return a string")),
            };
        }
        if let Some(Value::String(name)) = self.get_metamethod(&value, self.names.name) {
            let plain = self.tostring_raw(&value);
            let address = plain.split_once(": ").map_or("", |(_, a)| a);
            return Ok(format!("{}: {address}", self.strings.get_str(name)));
        }
        Ok(self.tostring_raw(&value))
    }

    fn closure(&self, function: &Value) -> Option<LuaClosure> {
        match function {
            Value::Function(c) => self.heap.closures.get(*c).copied(),
            _ => None,
        }
    }

    pub fn closure_upvalues_kind(&self, function: &Value) -> Option<UpvaluesKind> {
        let closure = self.closure(function)?;
        let context = self.heap.contexts.get(closure.context)?;
        Some(match context.cells.len() {
            0 => UpvaluesKind::None,
            1 if context.names.first() == Some(&self.names.env) => UpvaluesKind::Environment,
            _ => UpvaluesKind::Closure,
        })
    }

    fn upvalue_cell(&self, function: &Value, index: usize) -> Option<(StringId, GcIdx<UpVal>)> {
        let closure = self.closure(function)?;
        let context = self.heap.contexts.get(closure.context)?;
        let cell = *context.cells.get(index)?;
        let name = context.names.get(index).copied().unwrap_or(self.names.varargs);
        Some((name, cell))
    }

    /// Name and value of upvalue `index` (0-based) of a Lua function.
    pub fn get_upvalue(&self, function: &Value, index: usize) -> Option<(StringId, Value)> {
        let (name, cell) = self.upvalue_cell(function, index)?;
        Some((name, self.heap.upvals.get(cell)?.value.clone()))
    }

    /// Assigns upvalue `index`; returns its name, or `None` if absent.
    pub fn set_upvalue(&mut self, function: &Value, index: usize, value: Value) -> Option<StringId> {
        let (name, cell) = self.upvalue_cell(function, index)?;
        self.heap.upvals.get_mut(cell)?.value = value.to_scalar();
        Some(name)
    }

    /// Identity of the cell behind upvalue `index`: equal ids mean shared
    /// cells.
    pub fn upvalue_id(&self, function: &Value, index: usize) -> Option<u64> {
        self.upvalue_cell(function, index)
            .map(|(_, cell)| cell.to_bits())
    }

    /// Makes upvalue `n1` of `f1` refer to the cell of upvalue `n2` of `f2`.
    pub fn upvalue_join(
        &mut self,
        f1: &Value,
        n1: usize,
        f2: &Value,
        n2: usize,
    ) -> Result<(), LuaError> {
        let (_, target) = self
            .upvalue_cell(f2, n2)
            .ok_or_else(|| LuaError::Argument("invalid upvalue index".into()))?;
        let closure = self
            .closure(f1)
            .ok_or_else(|| LuaError::Argument("Lua function expected".into()))?;
        let context = self
            .heap
            .contexts
            .get_mut(closure.context)
            .ok_or_else(|| LuaError::internal("stale closure context"))?;
        let slot = context
            .cells
            .get_mut(n1)
            .ok_or_else(|| LuaError::Argument("invalid upvalue index".into()))?;
        *slot = target;
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(VmOptions::default())
    }
}
