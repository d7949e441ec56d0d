//! The instruction processing loop: dispatch, the call/return protocol,
//! metamethod trampolines and error unwinding.

use crate::arith::{self, ArithOp, ArithResult};
use crate::callstack::{CallStackItem, FLAG_METHOD_CALL, FLAG_TAIL_CALL};
use crate::coerce;
use crate::compare::{self, CompareResult};
use crate::error::{LuaError, ScriptError};
use crate::vm::Vm;
use std::rc::Rc;
use tarn_bytecode::{Instruction, OpCode, SourceRef, SymbolRef};
use tarn_core::string::StringId;
use tarn_core::value::{NativeId, Number, TailCallData, Value};

/// Longest `__index` / `__newindex` chain followed before giving up.
const MAX_META_CHAIN: usize = 100;

/// What the loop does after an instruction.
pub(crate) enum Flow {
    Continue(usize),
    /// The entry frame returned; its value is on top of the stack.
    Return,
    /// A yield request is on top of the stack.
    Yield,
}

/// Per-call options for `exec_call`.
#[derive(Clone, Debug, Default)]
pub(crate) struct CallSite {
    pub flags: u8,
    pub debug_name: Option<StringId>,
    pub continuation: Option<NativeId>,
    pub error_handler: Option<NativeId>,
    pub message_handler: Option<Value>,
    pub no_tail_call: bool,
}

impl CallSite {
    fn from_request(request: &TailCallData) -> Self {
        CallSite {
            continuation: request.continuation,
            error_handler: request.error_handler,
            message_handler: request.message_handler.clone(),
            ..Default::default()
        }
    }

    fn has_handlers(&self) -> bool {
        self.continuation.is_some()
            || self.error_handler.is_some()
            || self.message_handler.is_some()
    }
}

fn operand(n: i32) -> Result<usize, LuaError> {
    usize::try_from(n).map_err(|_| LuaError::internal(format!("negative operand {n}")))
}

fn symbol(i: &Instruction) -> Result<&SymbolRef, LuaError> {
    i.symbol
        .as_ref()
        .ok_or_else(|| LuaError::internal(format!("{} without a symbol", i.op)))
}

fn number(v: &Value) -> Result<Number, LuaError> {
    v.as_number()
        .ok_or_else(|| LuaError::internal("numeric loop state expected"))
}

impl Vm {
    /// Runs from `ip` until the entry frame returns, yields, or an error
    /// escapes every handler of this loop.
    pub(crate) fn processing_loop(&mut self, mut ip: usize) -> Result<Value, LuaError> {
        loop {
            let err = match self.execute(&mut ip) {
                Ok(Flow::Return) => return self.pop_value(),
                Ok(Flow::Yield) => {
                    if self.can_yield {
                        return self.pop_value();
                    }
                    self.pop_value()?;
                    self.yield_error()
                }
                Ok(Flow::Continue(at)) => LuaError::internal(format!("dispatch stopped at {at}")),
                Err(e) => e,
            };
            match self.unwind(err, ip)? {
                Some(resume) => ip = resume,
                None => return self.pop_value(),
            }
        }
    }

    fn execute(&mut self, ip: &mut usize) -> Result<Flow, LuaError> {
        loop {
            let instr = match self.code.code.get(*ip) {
                Some(i) => i.clone(),
                None => {
                    return Err(LuaError::internal(format!(
                        "instruction pointer {} out of range",
                        *ip
                    )))
                }
            };
            tracing::trace!(ip = *ip, opcode = %instr.op, "next opcode");
            *ip += 1;
            match self.step(&instr, *ip)? {
                Flow::Continue(target) => *ip = target,
                exit => return Ok(exit),
            }
        }
    }

    fn step(&mut self, i: &Instruction, next: usize) -> Result<Flow, LuaError> {
        match i.op {
            OpCode::Nop | OpCode::Debug | OpCode::Meta => {}
            OpCode::Invalid => {
                let reason = i
                    .name
                    .map(|n| self.strings.get_str(n).into_owned())
                    .unwrap_or_default();
                return Err(LuaError::internal(format!(
                    "invalid opcode executed: {reason}"
                )));
            }
            OpCode::Pop => self.stack.remove_last(operand(i.num_val)?),
            OpCode::Copy => {
                let v = self.peek_value(operand(i.num_val)?)?.clone();
                self.stack.push(v);
            }
            OpCode::Swap => self.exec_swap(i)?,
            OpCode::Literal => self.stack.push(i.value.clone().unwrap_or_default()),
            OpCode::Closure => self.exec_closure(i)?,
            OpCode::NewTable => {
                let t = self.heap.alloc_table(0, 0);
                self.stack.push(Value::Table(t));
            }
            OpCode::TblInitN => self.exec_tbl_init_n()?,
            OpCode::TblInitI => self.exec_tbl_init_i(i)?,
            OpCode::StoreLcl => {
                let v = self.get_store_value(i)?;
                self.assign_local(symbol(i)?, v)?;
            }
            OpCode::Local => {
                let index = symbol(i)?.index().unwrap_or(usize::MAX);
                let v = self.read_local(index)?;
                self.stack.push(v);
            }
            OpCode::StoreUpv => {
                let v = self.get_store_value(i)?;
                let index = symbol(i)?.index().unwrap_or(usize::MAX);
                self.write_upvalue(index, v)?;
            }
            OpCode::UpValue => {
                let index = symbol(i)?.index().unwrap_or(usize::MAX);
                let v = self.read_upvalue(index)?;
                self.stack.push(v);
            }
            OpCode::IndexSet | OpCode::IndexSetN | OpCode::IndexSetL => {
                return self.exec_index_set(i, next)
            }
            OpCode::Index | OpCode::IndexN | OpCode::IndexL => return self.exec_index(i, next),
            OpCode::Clean => self.clear_block_data(i)?,
            OpCode::BeginFn => self.exec_begin_fn(i)?,
            OpCode::Args => self.exec_args(i)?,
            OpCode::Call | OpCode::ThisCall => {
                let flags = if i.op == OpCode::ThisCall {
                    FLAG_METHOD_CALL
                } else {
                    0
                };
                let site = CallSite {
                    flags,
                    debug_name: i.name,
                    ..Default::default()
                };
                return self.exec_call(operand(i.num_val)?, Some(next), site);
            }
            OpCode::Ret => return self.exec_ret(i.num_val),
            OpCode::Jump => return Ok(Flow::Continue(operand(i.num_val)?)),
            OpCode::Jf => {
                if !self.pop_value()?.is_truthy() {
                    return Ok(Flow::Continue(operand(i.num_val)?));
                }
            }
            OpCode::JNil => {
                if self.pop_value()?.is_nil() {
                    return Ok(Flow::Continue(operand(i.num_val)?));
                }
            }
            OpCode::JFor => return self.exec_jfor(i, next),
            OpCode::JtOrPop | OpCode::JfOrPop => {
                let truthy = self.peek_value(0)?.is_truthy();
                if truthy == (i.op == OpCode::JtOrPop) {
                    return Ok(Flow::Continue(operand(i.num_val)?));
                }
                self.pop_value()?;
            }
            OpCode::Concat => return self.exec_concat(next),
            OpCode::LessEq => return self.exec_less_eq(next),
            OpCode::Less => return self.exec_less(next),
            OpCode::Eq => return self.exec_eq(next),
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::FloorDiv
            | OpCode::Power
            | OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::ShiftLeft
            | OpCode::ShiftRight => return self.exec_arith(i.op, next),
            OpCode::BitNot | OpCode::Neg => return self.exec_unary(i.op, next),
            OpCode::Len => return self.exec_len(next),
            OpCode::Not => {
                let v = self.pop_value()?;
                self.stack.push(Value::Boolean(!v.is_truthy()));
            }
            OpCode::CNot => {
                let v = self.pop_value()?;
                let negate = match self.pop_value()? {
                    Value::Boolean(b) => b,
                    _ => return Err(LuaError::internal("CNot expects a boolean flag")),
                };
                self.stack.push(Value::Boolean(v.is_truthy() != negate));
            }
            OpCode::MkTuple => self.exec_mk_tuple(i)?,
            OpCode::Scalar => {
                let v = self.pop_value()?;
                self.stack.push(v.to_scalar());
            }
            OpCode::Incr => {
                let step = number(self.peek_value(operand(i.num_val)?)?)?;
                let value = number(&self.pop_value()?)?;
                self.stack
                    .push(Value::Number(arith::for_increment(value, step)));
            }
            OpCode::ToNum => {
                let v = self.pop_value()?.to_scalar();
                if !matches!(v, Value::Number(_)) {
                    return Err(LuaError::for_loop(i.num_val));
                }
                self.stack.push(v);
            }
            OpCode::ToBool => {
                let v = self.pop_value()?;
                self.stack.push(Value::Boolean(v.is_truthy()));
            }
            OpCode::ExpTuple => {
                let v = self.peek_value(operand(i.num_val)?)?.clone();
                match v {
                    Value::Tuple(items) => self.stack.extend(items.iter().cloned()),
                    other => self.stack.push(other),
                }
            }
            OpCode::Enter => self.exec_enter(i)?,
            OpCode::Leave | OpCode::Exit => self.exec_leave(i)?,
            OpCode::IterPrep => self.exec_iter_prep()?,
            OpCode::IterUpd => {
                let v = self.peek_value(0)?.to_scalar();
                let slot = self
                    .stack
                    .peek_mut(1)
                    .ok_or_else(|| LuaError::internal("value stack underflow"))?;
                let mut items = match slot {
                    Value::Tuple(items) if items.len() >= 3 => items.to_vec(),
                    _ => return Err(LuaError::internal("iterator tuple expected")),
                };
                items[2] = v;
                *slot = Value::tuple(items);
            }
        }
        Ok(Flow::Continue(next))
    }

    fn exec_swap(&mut self, i: &Instruction) -> Result<(), LuaError> {
        let len = self.stack.len();
        let (p1, p2) = (operand(i.num_val)?, operand(i.num_val2)?);
        if p1 >= len || p2 >= len {
            return Err(LuaError::internal("swap beyond the value stack"));
        }
        let (a, b) = (len - 1 - p1, len - 1 - p2);
        let va = self.stack[a].clone();
        self.stack[a] = std::mem::take(&mut self.stack[b]);
        self.stack[b] = va;
        Ok(())
    }

    /// The value a store instruction writes: stack slot `num_val`, or element
    /// `num_val2` of it when it holds a tuple.
    fn get_store_value(&self, i: &Instruction) -> Result<Value, LuaError> {
        let v = self.peek_value(operand(i.num_val)?)?;
        let tupleidx = operand(i.num_val2)?;
        Ok(match v {
            Value::Tuple(items) => items.get(tupleidx).cloned().unwrap_or_default(),
            other if tupleidx == 0 => other.clone(),
            _ => Value::Nil,
        }
        .to_scalar())
    }

    fn exec_tbl_init_n(&mut self) -> Result<(), LuaError> {
        let value = self.pop_value()?.to_scalar();
        let key = self.pop_value()?.to_scalar();
        let t = self
            .peek_value(0)?
            .as_table()
            .ok_or_else(|| LuaError::internal("table constructor without a table"))?;
        self.heap.tables[t]
            .raw_set(&key, value)
            .map_err(LuaError::runtime)
    }

    fn exec_tbl_init_i(&mut self, i: &Instruction) -> Result<(), LuaError> {
        let value = self.pop_value()?;
        let t = self
            .peek_value(0)?
            .as_table()
            .ok_or_else(|| LuaError::internal("table constructor without a table"))?;
        self.heap.tables[t].init_next_array_key(value, i.num_val != 0);
        Ok(())
    }

    fn exec_mk_tuple(&mut self, i: &Instruction) -> Result<(), LuaError> {
        let n = operand(i.num_val)?;
        if n > self.stack.len() {
            return Err(LuaError::internal("value stack underflow"));
        }
        let values = self.stack.split_off(self.stack.len() - n);
        let mut out = Vec::with_capacity(n);
        let last = values.len().saturating_sub(1);
        for (k, v) in values.into_iter().enumerate() {
            match v {
                Value::Tuple(items) if k == last => out.extend(items.iter().cloned()),
                Value::Void if k == last => {}
                other => out.push(other.to_scalar()),
            }
        }
        self.stack.push(Value::tuple(out));
        Ok(())
    }

    fn exec_jfor(&mut self, i: &Instruction, next: usize) -> Result<Flow, LuaError> {
        let value = number(self.peek_value(0)?)?;
        let step = number(self.peek_value(1)?)?;
        let stop = number(self.peek_value(2)?)?;
        let running = if step.as_f64() > 0.0 {
            value.le(stop)
        } else {
            stop.le(value)
        };
        if running {
            Ok(Flow::Continue(next))
        } else {
            Ok(Flow::Continue(operand(i.num_val)?))
        }
    }

    /// Normalises the iterator triple of a generic `for`: tables without
    /// `__call` iterate with `next`, `__iterator` supplies a custom triple.
    fn exec_iter_prep(&mut self) -> Result<(), LuaError> {
        let v = self.pop_value()?;
        let mut triple: Vec<Value> = match v {
            Value::Tuple(items) => items.iter().take(3).cloned().collect(),
            other => vec![other],
        };
        triple.resize(3, Value::Nil);
        let f = triple[0].to_scalar();
        if !f.is_function() {
            if let Some(iterator) = self.get_metamethod(&f, self.names.iterator) {
                let produced = self.call(iterator, triple.clone())?;
                triple = match produced {
                    Value::Tuple(items) => items.iter().take(3).cloned().collect(),
                    other => vec![other],
                };
                triple.resize(3, Value::Nil);
            } else if matches!(f, Value::Table(_))
                && self.get_metamethod(&f, self.names.call).is_none()
            {
                triple = vec![
                    Value::NativeFunction(crate::builtins::NEXT),
                    f,
                    Value::Nil,
                ];
            }
        }
        self.stack.push(Value::tuple(triple));
        Ok(())
    }

    // ─── Calls ──────────────────────────────────────────────────────────

    fn calling_source(&self, ret: Option<usize>) -> Option<SourceRef> {
        let at = ret?.checked_sub(1)?;
        self.code.code.get(at)?.source
    }

    /// Calls the function sitting below `argc` arguments on the value stack.
    /// Lua callees get a new frame and execution continues at their entry
    /// point; natives run immediately.
    pub(crate) fn exec_call(
        &mut self,
        argc: usize,
        ret: Option<usize>,
        site: CallSite,
    ) -> Result<Flow, LuaError> {
        let fn_pos = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| LuaError::internal("call beyond the value stack"))?;
        let function = self.stack[fn_pos].to_scalar();
        let calling_source = self.calling_source(ret);

        match function {
            Value::Function(c) => {
                if self.should_tail_call(ret, &site) {
                    return self.perform_tail_call(argc, site);
                }
                if self.call_stack.len() >= self.options.max_call_depth {
                    return Err(LuaError::stack_overflow());
                }
                let closure = *self
                    .heap
                    .closures
                    .get(c)
                    .ok_or_else(|| LuaError::internal("stale closure handle"))?;
                self.stack.push(Value::integer(argc as i64));
                self.call_stack.push(CallStackItem {
                    base_pointer: Some(self.stack.len()),
                    return_address: ret,
                    debug_entry_point: closure.entry_point,
                    calling_source,
                    closure_context: Some(closure.context),
                    error_handler: site.error_handler,
                    continuation: site.continuation,
                    message_handler: site.message_handler,
                    flags: site.flags,
                    ..Default::default()
                });
                tracing::trace!(
                    entry = closure.entry_point,
                    depth = self.call_stack.len(),
                    "enter function"
                );
                Ok(Flow::Continue(closure.entry_point))
            }
            Value::NativeFunction(id) => {
                let args = self.stack.split_off(fn_pos + 1);
                self.call_stack.push(CallStackItem {
                    base_pointer: Some(fn_pos),
                    return_address: ret,
                    calling_source,
                    native: Some(id),
                    error_handler: site.error_handler,
                    continuation: site.continuation,
                    message_handler: site.message_handler,
                    flags: site.flags,
                    ..Default::default()
                });
                let method = site.flags & FLAG_METHOD_CALL != 0;
                let result = self.invoke_native(id, args, method, calling_source)?;
                let frame = self
                    .call_stack
                    .pop()
                    .ok_or_else(|| LuaError::internal("call stack underflow"))?;
                self.stack.crop(fn_pos);
                if frame.has_handlers()
                    && matches!(result, Value::TailCallRequest(_) | Value::YieldRequest(_))
                {
                    return Err(LuaError::runtime(
                        "a native function that calls back or yields cannot be protected directly; wrap it in a Lua function",
                    ));
                }
                self.stack.push(result);
                self.finish_return(frame.continuation, ret)
            }
            other => match self.get_metamethod(&other, self.names.call) {
                Some(handler) => {
                    self.stack.insert(fn_pos, handler);
                    self.exec_call(argc + 1, ret, site)
                }
                None => {
                    let name = site.debug_name.map(|n| self.strings.get_str(n).into_owned());
                    Err(LuaError::call(other.type_name(), name.as_deref()))
                }
            },
        }
    }

    /// Above the threshold, a call followed by `Ret 1` replaces the
    /// current frame instead of stacking a new one. A frame with open
    /// to-be-closed locals is never replaced: they close after the callee
    /// returns.
    fn should_tail_call(&self, ret: Option<usize>, site: &CallSite) -> bool {
        if site.no_tail_call || site.has_handlers() || site.flags & !FLAG_METHOD_CALL != 0 {
            return false;
        }
        let threshold = self.options.tail_call_threshold;
        if self.call_stack.len() <= threshold && self.stack.len() <= threshold {
            return false;
        }
        let returns_next = ret
            .and_then(|r| self.code.code.get(r))
            .is_some_and(|n| n.op == OpCode::Ret && n.num_val == 1);
        returns_next
            && self
                .call_stack
                .peek(0)
                .is_some_and(|f| {
                    !f.is_native()
                        && !f.has_handlers()
                        && !f.is_entry_point()
                        && f.to_be_closed.is_empty()
                })
    }

    fn perform_tail_call(&mut self, argc: usize, site: CallSite) -> Result<Flow, LuaError> {
        let fn_pos = self.stack.len() - argc - 1;
        let moved = self.stack.split_off(fn_pos);
        self.close_all_pending_blocks(&Value::Nil)?;
        let frame = self
            .call_stack
            .pop()
            .ok_or_else(|| LuaError::internal("call stack underflow"))?;
        self.drop_frame_values(&frame)?;
        self.stack.extend(moved);
        tracing::trace!(depth = self.call_stack.len(), "tail call reuses frame");
        self.exec_call(
            argc,
            frame.return_address,
            CallSite {
                flags: site.flags | FLAG_TAIL_CALL,
                debug_name: site.debug_name,
                no_tail_call: true,
                ..Default::default()
            },
        )
    }

    /// Removes a popped Lua frame's values: temporaries, argument count,
    /// arguments and the function.
    fn drop_frame_values(&mut self, frame: &CallStackItem) -> Result<(), LuaError> {
        let base = frame
            .base_pointer
            .ok_or_else(|| LuaError::internal("frame without a base pointer"))?;
        self.stack.crop(base);
        if frame.native.is_none() {
            let argc = match self.pop_value()? {
                Value::Number(Number::Integer(n)) if n >= 0 => n as usize,
                _ => return Err(LuaError::internal("corrupted frame: argument count expected")),
            };
            self.stack.remove_last(argc + 1);
        }
        Ok(())
    }

    fn exec_ret(&mut self, count: i32) -> Result<Flow, LuaError> {
        let value = match count {
            0 => Value::Void,
            1 => self.pop_value()?,
            n => return Err(LuaError::internal(format!("RET supports 0 or 1 values, got {n}"))),
        };
        self.close_all_pending_blocks(&Value::Nil)?;
        let frame = self
            .call_stack
            .pop()
            .ok_or_else(|| LuaError::internal("call stack underflow"))?;
        self.drop_frame_values(&frame)?;
        self.stack.push(value);
        self.finish_return(frame.continuation, frame.return_address)
    }

    fn finish_return(
        &mut self,
        continuation: Option<NativeId>,
        ret: Option<usize>,
    ) -> Result<Flow, LuaError> {
        if let Some(continuation) = continuation {
            let v = self.pop_value()?;
            let out = self.invoke_native(continuation, vec![v], false, None)?;
            self.stack.push(out);
        }
        self.check_tail_requests(ret)
    }

    /// Acts on a request left on top of the stack by a native: tail call
    /// requests are performed, yield requests leave the loop.
    fn check_tail_requests(&mut self, ret: Option<usize>) -> Result<Flow, LuaError> {
        match self.stack.peek(0) {
            Some(Value::TailCallRequest(request)) => {
                let request = Rc::clone(request);
                self.stack.pop();
                self.exec_request(&request, ret)
            }
            Some(Value::YieldRequest(_)) => {
                self.saved_ip = ret;
                Ok(Flow::Yield)
            }
            _ => Ok(ret.map_or(Flow::Return, Flow::Continue)),
        }
    }

    fn exec_request(&mut self, request: &TailCallData, ret: Option<usize>) -> Result<Flow, LuaError> {
        self.stack.push(request.function.clone());
        self.stack.extend(request.args.iter().cloned());
        self.exec_call(request.args.len(), ret, CallSite::from_request(request))
    }

    // ─── Indexing ───────────────────────────────────────────────────────

    fn key_name(&self, key: &Value) -> Option<String> {
        key.as_string_id()
            .map(|s| self.strings.get_str(s).into_owned())
    }

    fn exec_index(&mut self, i: &Instruction, next: usize) -> Result<Flow, LuaError> {
        let key = match &i.value {
            Some(k) => k.clone(),
            None => self.pop_value()?,
        };
        let key = if i.op == OpCode::IndexL { key } else { key.to_scalar() };
        let mut obj = self.pop_value()?.to_scalar();
        for _ in 0..MAX_META_CHAIN {
            let handler = match obj {
                Value::Table(t) => {
                    if i.op == OpCode::IndexL {
                        return Err(LuaError::runtime(
                            "cannot multi-index a table. userdata expected",
                        ));
                    }
                    let v = self.heap.tables[t].raw_get(&key);
                    if !v.is_nil() {
                        self.stack.push(v);
                        return Ok(Flow::Continue(next));
                    }
                    match self.get_metamethod(&obj, self.names.index) {
                        Some(h) => h,
                        None => {
                            self.stack.push(Value::Nil);
                            return Ok(Flow::Continue(next));
                        }
                    }
                }
                _ => match self.get_metamethod(&obj, self.names.index) {
                    Some(h) => h,
                    None => {
                        return Err(LuaError::index(
                            obj.type_name(),
                            self.key_name(&key).as_deref(),
                        ))
                    }
                },
            };
            if handler.is_function() {
                self.stack.push(handler);
                self.stack.push(obj);
                self.stack.push(key);
                return self.exec_call(2, Some(next), CallSite::default());
            }
            obj = handler;
        }
        Err(LuaError::index_loop(false))
    }

    fn exec_index_set(&mut self, i: &Instruction, next: usize) -> Result<Flow, LuaError> {
        let key = match &i.value {
            Some(k) => k.clone(),
            None => self.pop_value()?,
        };
        let key = if i.op == OpCode::IndexSetL { key } else { key.to_scalar() };
        let mut obj = self.pop_value()?.to_scalar();
        let value = self.get_store_value(i)?;
        for _ in 0..MAX_META_CHAIN {
            let handler = match obj {
                Value::Table(t) => {
                    if i.op == OpCode::IndexSetL {
                        return Err(LuaError::runtime(
                            "cannot multi-index a table. userdata expected",
                        ));
                    }
                    let existing = self.heap.tables[t].raw_get(&key);
                    let handler = if existing.is_nil() {
                        self.get_metamethod(&obj, self.names.newindex)
                    } else {
                        None
                    };
                    match handler {
                        Some(h) => h,
                        None => {
                            self.heap.tables[t]
                                .raw_set(&key, value)
                                .map_err(LuaError::runtime)?;
                            return Ok(Flow::Continue(next));
                        }
                    }
                }
                _ => match self.get_metamethod(&obj, self.names.newindex) {
                    Some(h) => h,
                    None => {
                        return Err(LuaError::index(
                            obj.type_name(),
                            self.key_name(&key).as_deref(),
                        ))
                    }
                },
            };
            if handler.is_function() {
                // The call's result takes the stored value's place.
                self.pop_value()?;
                self.stack.push(handler);
                self.stack.push(obj);
                self.stack.push(key);
                self.stack.push(value);
                return self.exec_call(3, Some(next), CallSite::default());
            }
            obj = handler;
        }
        Err(LuaError::index_loop(true))
    }

    // ─── Operators ──────────────────────────────────────────────────────

    fn pop_operands(&mut self) -> Result<(Value, Value), LuaError> {
        let r = self.pop_value()?.to_scalar();
        let l = self.pop_value()?.to_scalar();
        Ok((l, r))
    }

    /// Calls `name` on the operands if either defines it.
    fn try_binary_metamethod(
        &mut self,
        l: &Value,
        r: &Value,
        name: StringId,
        next: usize,
    ) -> Result<Option<Flow>, LuaError> {
        match self.binary_metamethod_request(l, r, name) {
            Some(request) => self.exec_request(&request, Some(next)).map(Some),
            None => Ok(None),
        }
    }

    fn exec_arith(&mut self, op: OpCode, next: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        let aop = ArithOp::from_opcode(op)
            .ok_or_else(|| LuaError::internal(format!("{op} is not arithmetic")))?;
        match arith::arith_op(aop, &l, &r, &self.strings) {
            ArithResult::Ok(v) => {
                self.stack.push(v);
                Ok(Flow::Continue(next))
            }
            ArithResult::Error(e) => Err(e),
            ArithResult::NeedMetamethod => {
                if let Some(flow) =
                    self.try_binary_metamethod(&l, &r, self.names.for_arith(aop), next)?
                {
                    return Ok(flow);
                }
                let culprit = if coerce::to_number(&l, &self.strings).is_some() {
                    &r
                } else {
                    &l
                };
                Err(if aop.is_bitwise() {
                    LuaError::bitwise(culprit.type_name())
                } else {
                    LuaError::arithmetic(culprit.type_name())
                })
            }
        }
    }

    fn exec_unary(&mut self, op: OpCode, next: usize) -> Result<Flow, LuaError> {
        let v = self.pop_value()?.to_scalar();
        let (result, event) = if op == OpCode::Neg {
            (arith::arith_unm(&v, &self.strings), self.names.unm)
        } else {
            (arith::arith_bnot(&v, &self.strings), self.names.bnot)
        };
        match result {
            ArithResult::Ok(r) => {
                self.stack.push(r);
                Ok(Flow::Continue(next))
            }
            ArithResult::Error(e) => Err(e),
            ArithResult::NeedMetamethod => match self.get_metamethod(&v, event) {
                Some(handler) => {
                    let request = TailCallData::new(handler, vec![v.clone(), v]);
                    self.exec_request(&request, Some(next))
                }
                None if op == OpCode::Neg => Err(LuaError::arithmetic(v.type_name())),
                None => Err(LuaError::bitwise(v.type_name())),
            },
        }
    }

    fn exec_len(&mut self, next: usize) -> Result<Flow, LuaError> {
        let v = self.pop_value()?.to_scalar();
        if let Value::String(s) = v {
            let n = self.strings.get_bytes(s).len() as i64;
            self.stack.push(Value::integer(n));
            return Ok(Flow::Continue(next));
        }
        if let Some(handler) = self.get_metamethod(&v, self.names.len) {
            let request = TailCallData::new(handler, vec![v.clone(), v]);
            return self.exec_request(&request, Some(next));
        }
        match v {
            Value::Table(t) => {
                let n = self.heap.tables[t].length();
                self.stack.push(Value::integer(n));
                Ok(Flow::Continue(next))
            }
            other => Err(LuaError::length(other.type_name())),
        }
    }

    fn exec_concat(&mut self, next: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        let lb = coerce::to_concat_bytes(&l, &self.strings);
        let rb = coerce::to_concat_bytes(&r, &self.strings);
        match (lb, rb) {
            (Some(mut a), Some(b)) => {
                a.extend_from_slice(&b);
                let s = self.strings.intern(&a);
                self.stack.push(Value::String(s));
                Ok(Flow::Continue(next))
            }
            (lb, _) => {
                if let Some(flow) = self.try_binary_metamethod(&l, &r, self.names.concat, next)? {
                    return Ok(flow);
                }
                let culprit = if lb.is_none() { &l } else { &r };
                Err(LuaError::concat(culprit.type_name()))
            }
        }
    }

    fn exec_eq(&mut self, next: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        if compare::eq_needs_metamethod(&l, &r) {
            if let Some(flow) = self.try_binary_metamethod(&l, &r, self.names.eq, next)? {
                return Ok(flow);
            }
        }
        self.stack.push(Value::Boolean(l.raw_equals(&r)));
        Ok(Flow::Continue(next))
    }

    fn exec_less(&mut self, next: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        match compare::less_than(&l, &r, &self.strings) {
            CompareResult::Ok(b) => {
                self.stack.push(Value::Boolean(b));
                Ok(Flow::Continue(next))
            }
            CompareResult::NeedMetamethod => self
                .try_binary_metamethod(&l, &r, self.names.lt, next)?
                .ok_or_else(|| LuaError::compare(l.type_name(), r.type_name())),
        }
    }

    /// Pushes a negation flag below the result for the `CNot` that follows:
    /// `a <= b` falls back to `not (b < a)`.
    fn exec_less_eq(&mut self, next: usize) -> Result<Flow, LuaError> {
        let (l, r) = self.pop_operands()?;
        match compare::less_equal(&l, &r, &self.strings) {
            CompareResult::Ok(b) => {
                self.stack.push(Value::Boolean(false));
                self.stack.push(Value::Boolean(b));
                Ok(Flow::Continue(next))
            }
            CompareResult::NeedMetamethod => {
                if let Some(request) = self.binary_metamethod_request(&l, &r, self.names.le) {
                    self.stack.push(Value::Boolean(false));
                    return self.exec_request(&request, Some(next));
                }
                if let Some(request) = self.binary_metamethod_request(&r, &l, self.names.lt) {
                    self.stack.push(Value::Boolean(true));
                    return self.exec_request(&request, Some(next));
                }
                Err(LuaError::compare(l.type_name(), r.type_name()))
            }
        }
    }

    // ─── Errors ─────────────────────────────────────────────────────────

    /// Attaches position and traceback to an error raised at `ip - 1`.
    fn decorate(&self, e: &mut ScriptError, ip: usize) {
        let faulting = ip.saturating_sub(1);
        if e.instruction_ptr.is_none() {
            e.instruction_ptr = Some(faulting);
        }
        if e.traceback.is_empty() {
            e.traceback = self.stack_trace_from(Some(faulting), 0);
        }
        if e.decorated.is_some() || e.do_not_decorate || !e.has_string_payload() {
            return;
        }
        let source = if e.level >= 2 {
            self.call_stack
                .iter_from_top()
                .find(|f| !f.is_native())
                .and_then(|f| f.calling_source)
        } else {
            self.code.code.get(faulting).and_then(|i| i.source)
        };
        let prefix = match source {
            Some(src) => src.format(&self.strings),
            None => format!("bytecode:{faulting}"),
        };
        let message = match &e.value {
            Some(Value::String(s)) => self.strings.get_str(*s).into_owned(),
            _ => e.message.clone(),
        };
        e.decorated = Some(format!("{prefix}: {message}"));
    }

    /// Unwinds frames until a protected call catches `err`. Returns where
    /// to resume, `None` when the handled value should leave the loop, or
    /// the error when an entry frame is reached first.
    fn unwind(&mut self, err: LuaError, ip: usize) -> Result<Option<usize>, LuaError> {
        let LuaError::Runtime(mut e) = err else {
            return Err(err);
        };
        self.decorate(&mut e, ip);
        tracing::debug!(error = %e, depth = self.call_stack.len(), "unwinding");

        // The catching frame's message handler runs before anything is popped.
        let catcher = self
            .call_stack
            .iter_from_top()
            .find(|f| f.error_handler.is_some() || f.is_entry_point())
            .and_then(|f| f.message_handler.clone());
        if let Some(handler) = catcher {
            self.apply_message_handler(handler, &mut e)?;
        }

        let mut error_value = self.error_value(&e);
        let mut replaced = false;
        loop {
            if self.call_stack.is_empty() {
                return Err(LuaError::Runtime(e));
            }
            if let Err(close_err) = self.close_all_pending_blocks(&error_value) {
                match close_err {
                    LuaError::Runtime(ce) if !replaced => {
                        e = ce;
                        error_value = self.error_value(&e);
                        replaced = true;
                    }
                    LuaError::Runtime(_) => {}
                    other => return Err(other),
                }
            }
            let frame = self
                .call_stack
                .pop()
                .ok_or_else(|| LuaError::internal("call stack underflow"))?;
            self.drop_frame_values(&frame)?;
            if let Some(handler) = frame.error_handler {
                let handled = self.invoke_native(handler, vec![error_value], false, None)?;
                self.stack.push(handled);
                tracing::debug!(depth = self.call_stack.len(), "protected call caught error");
                return Ok(frame.return_address);
            }
            if frame.is_entry_point() {
                return Err(LuaError::Runtime(e));
            }
        }
    }
}
