//! The append-only instruction buffer and its emission helpers.
//!
//! A front-end drives these emitters; every helper appends one or more
//! instructions, stamps them with the current source position and updates the
//! statically tracked operand-stack depth.

use crate::error::BytecodeError;
use crate::instruction::{Instruction, SourceRef};
use crate::opcode::{FieldUsage, OpCode};
use crate::symbol::{RuntimeScopeBlock, RuntimeScopeFrame, SymbolRef};
use tarn_core::string::StringId;
use tarn_core::value::Value;

/// What a `Meta` instruction marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum MetaKind {
    FunctionEntryPoint = 0,
    ChunkEntryPoint = 1,
}

/// Which index opcode family to emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFlavor {
    /// `t[k]`
    Expr,
    /// `t.name` / `t:name`
    Name,
    /// `t[a, b]` (userdata multi-index)
    ExprList,
}

/// Positions recorded by `begin_function`, consumed by `end_function`.
#[derive(Debug)]
#[must_use]
pub struct FunctionMark {
    jump: usize,
    meta: usize,
    saved_depth: i32,
}

#[derive(Debug, Default, Clone)]
pub struct ByteCode {
    pub code: Vec<Instruction>,
    source_stack: Vec<SourceRef>,
    depth: i32,
}

impl ByteCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Index the next emitted instruction will get.
    pub fn next_index(&self) -> usize {
        self.code.len()
    }

    /// Static operand-stack depth relative to the enclosing function start.
    pub fn stack_depth(&self) -> i32 {
        self.depth
    }

    /// Resets the tracked depth, e.g. at a join point after branches.
    pub fn set_stack_depth(&mut self, depth: i32) {
        self.depth = depth;
    }

    pub fn push_source_ref(&mut self, source: SourceRef) {
        self.source_stack.push(source);
    }

    pub fn pop_source_ref(&mut self) -> Option<SourceRef> {
        self.source_stack.pop()
    }

    /// Appends a fully built instruction and returns its index.
    pub fn append(&mut self, mut instr: Instruction) -> usize {
        if instr.source.is_none() {
            instr.source = self.source_stack.last().copied();
        }
        self.depth += instr.stack_delta();
        self.code.push(instr);
        self.code.len() - 1
    }

    /// Backpatches the code address of a jump or closure instruction.
    pub fn set_jump_target(&mut self, at: usize, target: usize) -> Result<(), BytecodeError> {
        let instr = self.code.get_mut(at).ok_or(BytecodeError::OutOfRange(at))?;
        if !instr
            .op
            .field_usage()
            .contains(FieldUsage::NUM_VAL_AS_CODE_ADDRESS)
        {
            return Err(BytecodeError::NotAJump(at, instr.op));
        }
        instr.num_val = target as i32;
        Ok(())
    }

    pub fn emit_nop(&mut self, comment: Option<StringId>) -> usize {
        let mut instr = Instruction::new(OpCode::Nop);
        instr.name = comment;
        self.append(instr)
    }

    pub fn emit_debug(&mut self, text: StringId) -> usize {
        self.append(Instruction::new(OpCode::Debug).with_name(text))
    }

    /// An instruction that raises an internal error when executed.
    pub fn emit_invalid(&mut self, reason: StringId) -> usize {
        self.append(Instruction::new(OpCode::Invalid).with_name(reason))
    }

    pub fn emit_pop(&mut self, count: i32) -> usize {
        self.append(Instruction::new(OpCode::Pop).with_num(count))
    }

    pub fn emit_copy(&mut self, offset: i32) -> usize {
        self.append(Instruction::new(OpCode::Copy).with_num(offset))
    }

    pub fn emit_swap(&mut self, p1: i32, p2: i32) -> usize {
        self.append(Instruction::new(OpCode::Swap).with_num(p1).with_num2(p2))
    }

    pub fn emit_literal(&mut self, value: Value) -> usize {
        self.append(Instruction::new(OpCode::Literal).with_value(value))
    }

    /// `entry` may be patched later with `set_jump_target`.
    pub fn emit_closure(&mut self, upvalues: &[SymbolRef], entry: i32) -> usize {
        self.append(
            Instruction::new(OpCode::Closure)
                .with_symbols(upvalues.to_vec())
                .with_num(entry),
        )
    }

    pub fn emit_new_table(&mut self) -> usize {
        self.append(Instruction::new(OpCode::NewTable))
    }

    pub fn emit_tbl_init_n(&mut self) -> usize {
        self.append(Instruction::new(OpCode::TblInitN))
    }

    /// `last_pos` marks the final positional item, whose tuple is expanded.
    pub fn emit_tbl_init_i(&mut self, last_pos: bool) -> usize {
        self.append(Instruction::new(OpCode::TblInitI).with_num(last_pos as i32))
    }

    /// Pushes the value of `sym`. Returns the operand-stack depth delta.
    pub fn emit_load(&mut self, sym: &SymbolRef) -> Result<i32, BytecodeError> {
        let before = self.depth;
        match sym {
            SymbolRef::Global { name, env } => {
                self.emit_load(env)?;
                self.append(Instruction::new(OpCode::Index).with_value(Value::String(*name)));
            }
            SymbolRef::Local { .. } => {
                self.append(Instruction::new(OpCode::Local).with_symbol(sym.clone()));
            }
            SymbolRef::UpValue { .. } => {
                self.append(Instruction::new(OpCode::UpValue).with_symbol(sym.clone()));
            }
            SymbolRef::DefaultEnv => return Err(BytecodeError::LoadDefaultEnv),
        }
        Ok(self.depth - before)
    }

    /// Stores the value at `stackofs` (element `tupleidx` if it is a tuple)
    /// into `sym`, leaving the operand stack's values in place. Returns the
    /// operand-stack depth delta.
    pub fn emit_store(
        &mut self,
        sym: &SymbolRef,
        stackofs: i32,
        tupleidx: i32,
    ) -> Result<i32, BytecodeError> {
        let before = self.depth;
        match sym {
            SymbolRef::Global { name, env } => {
                self.emit_load(env)?;
                self.append(
                    Instruction::new(OpCode::IndexSet)
                        .with_symbol(sym.clone())
                        .with_num(stackofs)
                        .with_num2(tupleidx)
                        .with_value(Value::String(*name)),
                );
            }
            SymbolRef::Local { .. } => {
                self.append(
                    Instruction::new(OpCode::StoreLcl)
                        .with_symbol(sym.clone())
                        .with_num(stackofs)
                        .with_num2(tupleidx),
                );
            }
            SymbolRef::UpValue { .. } => {
                self.append(
                    Instruction::new(OpCode::StoreUpv)
                        .with_symbol(sym.clone())
                        .with_num(stackofs)
                        .with_num2(tupleidx),
                );
            }
            SymbolRef::DefaultEnv => return Err(BytecodeError::StoreDefaultEnv),
        }
        Ok(self.depth - before)
    }

    /// Index the value on top of the stack. With `key == None` the key is
    /// popped from the stack first.
    pub fn emit_index(&mut self, key: Option<Value>, flavor: IndexFlavor) -> usize {
        let op = match flavor {
            IndexFlavor::Expr => OpCode::Index,
            IndexFlavor::Name => OpCode::IndexN,
            IndexFlavor::ExprList => OpCode::IndexL,
        };
        let mut instr = Instruction::new(op);
        instr.value = key;
        self.append(instr)
    }

    pub fn emit_index_set(
        &mut self,
        stackofs: i32,
        tupleidx: i32,
        key: Option<Value>,
        flavor: IndexFlavor,
    ) -> usize {
        let op = match flavor {
            IndexFlavor::Expr => OpCode::IndexSet,
            IndexFlavor::Name => OpCode::IndexSetN,
            IndexFlavor::ExprList => OpCode::IndexSetL,
        };
        let mut instr = Instruction::new(op).with_num(stackofs).with_num2(tupleidx);
        instr.value = key;
        self.append(instr)
    }

    fn scope_instruction(op: OpCode, block: &RuntimeScopeBlock) -> Instruction {
        Instruction::new(op)
            .with_num(block.from as i32)
            .with_num2(block.to_inclusive as i32)
            .with_symbols(block.to_be_closed.clone())
    }

    pub fn emit_enter(&mut self, block: &RuntimeScopeBlock) -> usize {
        self.append(Self::scope_instruction(OpCode::Enter, block))
    }

    pub fn emit_leave(&mut self, block: &RuntimeScopeBlock) -> usize {
        self.append(Self::scope_instruction(OpCode::Leave, block))
    }

    /// Leaves `block` early (`break`, `goto`).
    pub fn emit_exit(&mut self, block: &RuntimeScopeBlock) -> usize {
        self.append(Self::scope_instruction(OpCode::Exit, block))
    }

    /// Clears the nested-block slots of `block` (loop bodies re-entered on
    /// each iteration).
    pub fn emit_clean(&mut self, block: &RuntimeScopeBlock) -> usize {
        let nested: Vec<SymbolRef> = block
            .to_be_closed
            .iter()
            .filter(|s| s.index().is_some_and(|i| i > block.to))
            .cloned()
            .collect();
        self.append(
            Instruction::new(OpCode::Clean)
                .with_num(block.to as i32 + 1)
                .with_num2(block.to_inclusive as i32)
                .with_symbols(nested),
        )
    }

    pub fn emit_meta(&mut self, name: Option<StringId>, kind: MetaKind) -> usize {
        let mut instr = Instruction::new(OpCode::Meta).with_num2(kind as i32);
        instr.name = name;
        self.append(instr)
    }

    pub fn emit_begin_fn(&mut self, frame: &RuntimeScopeFrame) -> usize {
        self.append(
            Instruction::new(OpCode::BeginFn)
                .with_symbols(frame.debug_symbols.clone())
                .with_num(frame.count() as i32)
                .with_num2(frame.to_first_block as i32),
        )
    }

    pub fn emit_args(&mut self, params: &[SymbolRef]) -> usize {
        self.append(Instruction::new(OpCode::Args).with_symbols(params.to_vec()))
    }

    pub fn emit_call(&mut self, argc: i32, debug_name: Option<StringId>) -> usize {
        let mut instr = Instruction::new(OpCode::Call).with_num(argc);
        instr.name = debug_name;
        self.append(instr)
    }

    /// Method call; `argc` includes the receiver.
    pub fn emit_this_call(&mut self, argc: i32, debug_name: Option<StringId>) -> usize {
        let mut instr = Instruction::new(OpCode::ThisCall).with_num(argc);
        instr.name = debug_name;
        self.append(instr)
    }

    /// `Ret 0` returns nothing, `Ret 1` returns the value on top.
    pub fn emit_ret(&mut self, count: i32) -> usize {
        self.append(Instruction::new(OpCode::Ret).with_num(count))
    }

    pub fn emit_jump(&mut self, op: OpCode, target: i32) -> usize {
        self.append(Instruction::new(op).with_num(target))
    }

    /// Emits an operator. Comparisons get their boolean normalisation:
    /// `Eq`/`Less` are followed by `ToBool`, `LessEq` by `CNot`.
    pub fn emit_operator(&mut self, op: OpCode) -> usize {
        let at = self.append(Instruction::new(op));
        match op {
            OpCode::LessEq => {
                self.append(Instruction::new(OpCode::CNot));
            }
            OpCode::Eq | OpCode::Less => {
                self.append(Instruction::new(OpCode::ToBool));
            }
            _ => {}
        }
        at
    }

    pub fn emit_mk_tuple(&mut self, count: i32) -> usize {
        self.append(Instruction::new(OpCode::MkTuple).with_num(count))
    }

    pub fn emit_scalar(&mut self) -> usize {
        self.append(Instruction::new(OpCode::Scalar))
    }

    pub fn emit_incr(&mut self, step_offset: i32) -> usize {
        self.append(Instruction::new(OpCode::Incr).with_num(step_offset))
    }

    /// `stage` selects the error message: 0 initial value, 1 limit, 2 step.
    pub fn emit_to_num(&mut self, stage: i32) -> usize {
        self.append(Instruction::new(OpCode::ToNum).with_num(stage))
    }

    pub fn emit_jfor(&mut self, exit: i32) -> usize {
        self.append(Instruction::new(OpCode::JFor).with_num(exit))
    }

    pub fn emit_exp_tuple(&mut self, offset: i32) -> usize {
        self.append(Instruction::new(OpCode::ExpTuple).with_num(offset))
    }

    pub fn emit_iter_prep(&mut self) -> usize {
        self.append(Instruction::new(OpCode::IterPrep))
    }

    pub fn emit_iter_upd(&mut self) -> usize {
        self.append(Instruction::new(OpCode::IterUpd))
    }

    /// Emits the prologue of a function body:
    /// `Jump` over the body, `Meta`, `BeginFn` and `Args` when there are
    /// parameters. The entry point is the `Meta` instruction.
    pub fn begin_function(
        &mut self,
        name: Option<StringId>,
        kind: MetaKind,
        frame: &RuntimeScopeFrame,
        params: &[SymbolRef],
    ) -> FunctionMark {
        let saved_depth = self.depth;
        let jump = self.emit_jump(OpCode::Jump, -1);
        let meta = self.emit_meta(name, kind);
        self.depth = 0;
        self.emit_begin_fn(frame);
        if !params.is_empty() {
            self.emit_args(params);
        }
        FunctionMark {
            jump,
            meta,
            saved_depth,
        }
    }

    /// Closes a function opened by `begin_function` with `Ret 0`, patches the
    /// function length and the skip jump, and returns the entry point.
    pub fn end_function(&mut self, mark: FunctionMark) -> usize {
        let ret = self.emit_ret(0);
        self.code[mark.meta].num_val = (ret - mark.meta + 1) as i32;
        let after = self.code.len() as i32;
        self.code[mark.jump].num_val = after;
        self.depth = mark.saved_depth;
        mark.meta
    }
}
