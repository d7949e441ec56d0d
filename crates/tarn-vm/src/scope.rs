//! Locals, upvalues, lexical blocks and to-be-closed variables.

use crate::callstack::{CallStackItem, LocalSlot};
use crate::error::LuaError;
use crate::vm::Vm;
use tarn_bytecode::{Instruction, SymbolRef};
use tarn_core::gc::ClosureContext;
use tarn_core::value::Value;

fn no_frame() -> LuaError {
    LuaError::internal("no active frame")
}

fn closable_value(v: &Value) -> bool {
    !matches!(v.to_scalar(), Value::Nil | Value::Boolean(false))
}

impl Vm {
    fn top_frame(&self) -> Result<&CallStackItem, LuaError> {
        self.call_stack.peek(0).ok_or_else(no_frame)
    }

    fn top_frame_mut(&mut self) -> Result<&mut CallStackItem, LuaError> {
        self.call_stack.peek_mut(0).ok_or_else(no_frame)
    }

    pub(crate) fn read_local(&self, index: usize) -> Result<Value, LuaError> {
        match self.top_frame()?.local_scope.get(index) {
            Some(LocalSlot::Value(v)) => Ok(v.clone()),
            Some(LocalSlot::Cell(cell)) => Ok(self.heap.upvals[*cell].value.clone()),
            None => Err(LuaError::internal(format!("local slot {index} out of range"))),
        }
    }

    fn write_local(&mut self, index: usize, value: Value) -> Result<(), LuaError> {
        let slot = self
            .top_frame_mut()?
            .local_scope
            .get_mut(index)
            .ok_or_else(|| LuaError::internal(format!("local slot {index} out of range")))?;
        match slot {
            LocalSlot::Value(v) => *v = value,
            LocalSlot::Cell(cell) => {
                let cell = *cell;
                self.heap.upvals[cell].value = value;
            }
        }
        Ok(())
    }

    /// Stores into a local. Assigning to a live to-be-closed slot requires a
    /// closable value and closes the previous one.
    pub(crate) fn assign_local(&mut self, sym: &SymbolRef, value: Value) -> Result<(), LuaError> {
        let index = sym
            .index()
            .ok_or_else(|| LuaError::internal("local symbol expected"))?;
        if self.top_frame()?.to_be_closed.contains(&index) {
            if closable_value(&value) && self.get_metamethod(&value, self.names.close).is_none() {
                let name = sym
                    .name()
                    .map(|n| self.strings.get_str(n).into_owned())
                    .unwrap_or_default();
                return Err(LuaError::non_closable(&name));
            }
            let old = self.read_local(index)?;
            if closable_value(&old) {
                self.close_value(sym, old, &Value::Nil)?;
            }
        }
        self.write_local(index, value)
    }

    fn current_context(&self) -> Result<&ClosureContext, LuaError> {
        let ctx = self
            .top_frame()?
            .closure_context
            .ok_or_else(|| LuaError::internal("frame has no closure context"))?;
        self.heap
            .contexts
            .get(ctx)
            .ok_or_else(|| LuaError::internal("stale closure context"))
    }

    pub(crate) fn read_upvalue(&self, index: usize) -> Result<Value, LuaError> {
        let cell = *self
            .current_context()?
            .cells
            .get(index)
            .ok_or_else(|| LuaError::internal(format!("upvalue {index} out of range")))?;
        Ok(self.heap.upvals[cell].value.clone())
    }

    pub(crate) fn write_upvalue(&mut self, index: usize, value: Value) -> Result<(), LuaError> {
        let cell = *self
            .current_context()?
            .cells
            .get(index)
            .ok_or_else(|| LuaError::internal(format!("upvalue {index} out of range")))?;
        self.heap.upvals[cell].value = value;
        Ok(())
    }

    /// Builds a closure over `num_val`, capturing each listed symbol by cell.
    /// A captured local is promoted to a cell shared with its frame.
    pub(crate) fn exec_closure(&mut self, i: &Instruction) -> Result<(), LuaError> {
        let mut context = ClosureContext::default();
        for sym in i.symbols() {
            let cell = match sym {
                SymbolRef::Local { index, .. } => {
                    let index = *index;
                    let slot = self
                        .top_frame_mut()?
                        .local_scope
                        .get_mut(index)
                        .ok_or_else(|| LuaError::internal(format!("local slot {index} out of range")))?;
                    match slot {
                        LocalSlot::Cell(cell) => *cell,
                        LocalSlot::Value(v) => {
                            let v = std::mem::take(v);
                            let cell = self.heap.alloc_upval(v);
                            self.top_frame_mut()?.local_scope[index] = LocalSlot::Cell(cell);
                            cell
                        }
                    }
                }
                SymbolRef::UpValue { index, .. } => *self
                    .current_context()?
                    .cells
                    .get(*index)
                    .ok_or_else(|| LuaError::internal(format!("upvalue {index} out of range")))?,
                other => {
                    return Err(LuaError::internal(format!(
                        "cannot capture a {} symbol",
                        other.kind_name()
                    )))
                }
            };
            context.cells.push(cell);
            context.names.push(sym.name().unwrap_or(self.names.env));
        }
        let entry = usize::try_from(i.num_val)
            .map_err(|_| LuaError::internal("closure without an entry point"))?;
        let context = self.heap.alloc_context(context);
        let closure = self.heap.alloc_closure(entry, context);
        self.stack.push(Value::Function(closure));
        Ok(())
    }

    /// Allocates the frame's local slots and opens its root block.
    pub(crate) fn exec_begin_fn(&mut self, i: &Instruction) -> Result<(), LuaError> {
        let count = usize::try_from(i.num_val).unwrap_or(0);
        let root_last = i.num_val2;
        let frame = self.top_frame_mut()?;
        frame.debug_symbols = i.symbol_list.clone();
        frame.local_scope = vec![LocalSlot::default(); count];
        frame.blocks_to_close.clear();
        frame.to_be_closed.clear();
        let root: Vec<SymbolRef> = i
            .symbols()
            .iter()
            .filter(|s| s.is_to_be_closed() && s.index().is_some_and(|x| x as i32 <= root_last))
            .cloned()
            .collect();
        frame
            .to_be_closed
            .extend(root.iter().filter_map(SymbolRef::index));
        frame.blocks_to_close.push(root);
        Ok(())
    }

    /// Binds the arguments below the argument count to the parameters.
    /// A trailing `...` parameter receives the remaining values as a tuple.
    pub(crate) fn exec_args(&mut self, i: &Instruction) -> Result<(), LuaError> {
        let base = self
            .top_frame()?
            .base_pointer
            .ok_or_else(|| LuaError::internal("frame without a base pointer"))?;
        let argc = match base.checked_sub(1).and_then(|p| self.stack.get(p)) {
            Some(Value::Number(n)) => n
                .to_integer()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| LuaError::internal("corrupted argument count"))?,
            _ => return Err(LuaError::internal("argument count expected")),
        };
        let first = base
            .checked_sub(1 + argc)
            .ok_or_else(|| LuaError::internal("argument count exceeds the stack"))?;
        let mut args: Vec<Value> = self.stack.as_slice()[first..base - 1].to_vec();
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

        let params = i.symbols();
        for (k, param) in params.iter().enumerate() {
            let is_varargs = k + 1 == params.len() && param.name() == Some(self.names.varargs);
            let value = if is_varargs {
                Value::tuple(args.get(k..).map(<[Value]>::to_vec).unwrap_or_default())
            } else {
                args.get(k).map(Value::to_scalar).unwrap_or_default()
            };
            if is_varargs {
                let index = param
                    .index()
                    .ok_or_else(|| LuaError::internal("local symbol expected"))?;
                self.write_local(index, value)?;
            } else {
                self.assign_local(param, value)?;
            }
        }
        Ok(())
    }

    /// Closes the listed to-be-closed locals and resets slots
    /// `num_val..=num_val2`.
    pub(crate) fn clear_block_data(&mut self, i: &Instruction) -> Result<(), LuaError> {
        let closers: Vec<SymbolRef> = i.symbols().to_vec();
        let result = self.close_block_symbols(&closers, &Value::Nil);
        let frame = self.top_frame_mut()?;
        let len = frame.local_scope.len();
        let from = usize::try_from(i.num_val).unwrap_or(0);
        let to = usize::try_from(i.num_val2).map_or(0, |t| (t + 1).min(len));
        for slot in frame.local_scope.iter_mut().take(to).skip(from) {
            *slot = LocalSlot::default();
        }
        result
    }

    pub(crate) fn exec_enter(&mut self, i: &Instruction) -> Result<(), LuaError> {
        self.clear_block_data(i)?;
        let block: Vec<SymbolRef> = i
            .symbols()
            .iter()
            .filter(|s| s.is_to_be_closed())
            .cloned()
            .collect();
        let frame = self.top_frame_mut()?;
        frame
            .to_be_closed
            .extend(block.iter().filter_map(SymbolRef::index));
        frame.blocks_to_close.push(block);
        Ok(())
    }

    /// `Leave` and `Exit`: closes the innermost block, then clears its slots.
    pub(crate) fn exec_leave(&mut self, i: &Instruction) -> Result<(), LuaError> {
        let block = self.top_frame_mut()?.blocks_to_close.pop();
        let closed = match block {
            Some(symbols) => self.close_block_symbols(&symbols, &Value::Nil),
            None => Ok(()),
        };
        let cleared = self.clear_block_data(i);
        closed.and(cleared)
    }

    /// Closes `symbols` in reverse declaration order. Every closer runs;
    /// the first error is reported.
    fn close_block_symbols(&mut self, symbols: &[SymbolRef], error: &Value) -> Result<(), LuaError> {
        let mut first_error = None;
        for sym in symbols.iter().rev() {
            let Some(index) = sym.index() else { continue };
            let live = self.top_frame_mut()?.to_be_closed.shift_remove(&index);
            if !live {
                continue;
            }
            let value = self.read_local(index)?;
            if let Err(e) = self.close_value(sym, value, error) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Closes every open block of the top frame, innermost first.
    pub(crate) fn close_all_pending_blocks(&mut self, error: &Value) -> Result<(), LuaError> {
        let mut first_error = None;
        while let Some(block) = self
            .call_stack
            .peek_mut(0)
            .and_then(|f| f.blocks_to_close.pop())
        {
            if let Err(e) = self.close_block_symbols(&block, error) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Calls `__close(value, error)`. Nil and false need no closing.
    pub(crate) fn close_value(&mut self, sym: &SymbolRef, value: Value, error: &Value) -> Result<(), LuaError> {
        if !closable_value(&value) {
            return Ok(());
        }
        let Some(closer) = self.get_metamethod(&value, self.names.close) else {
            let name = sym
                .name()
                .map(|n| self.strings.get_str(n).into_owned())
                .unwrap_or_default();
            return Err(LuaError::non_closable(&name));
        };
        tracing::trace!(slot = ?sym.index(), "closing variable");
        self.call(closer, vec![value.to_scalar(), error.clone()])?;
        Ok(())
    }
}
