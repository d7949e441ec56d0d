//! Binary chunk serialization (dump) and deserialization (undump) of a
//! single function's instruction range.
//!
//! Layout, little endian:
//! `[u64 magic][i32 version][u8 has_env][i32 count][instructions][symbols]`.
//! Code addresses are stored relative to the function's `Meta`
//! instruction, so a chunk can be appended anywhere in another VM.

use crate::error::LuaError;
use crate::vm::{UpvaluesKind, Vm};
use indexmap::IndexSet;
use std::rc::Rc;
use tarn_bytecode::{FieldUsage, Instruction, OpCode, SymbolAttributes, SymbolRef};
use tarn_core::gc::ClosureContext;
use tarn_core::string::StringInterner;
use tarn_core::value::{Number, Value};

const CHUNK_MAGIC: u64 = 0x1A0D_234E_5241_541D;
const CHUNK_VERSION: i32 = 0x0101;

// Value tags
const TAG_NIL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STRING: u8 = 5;

// Symbol kinds
const SYM_LOCAL: u8 = 0;
const SYM_UPVALUE: u8 = 1;
const SYM_GLOBAL: u8 = 2;
const SYM_DEFAULT_ENV: u8 = 3;

fn chunk_error(message: impl Into<String>) -> LuaError {
    LuaError::Argument(message.into())
}

// ─── Dumper ─────────────────────────────────────────────────────────────

struct Writer<'a> {
    out: Vec<u8>,
    strings: &'a StringInterner,
    symbols: IndexSet<SymbolRef>,
}

impl<'a> Writer<'a> {
    fn u8(&mut self, b: u8) {
        self.out.push(b);
    }

    fn i32(&mut self, n: i32) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn string(&mut self, bytes: &[u8]) {
        self.i32(bytes.len() as i32);
        self.out.extend_from_slice(bytes);
    }

    fn name(&mut self, name: Option<tarn_core::string::StringId>) {
        match name {
            Some(id) => {
                self.u8(1);
                let strings = self.strings;
                self.string(strings.get_bytes(id));
            }
            None => self.u8(0),
        }
    }

    fn value(&mut self, value: &Value) -> Result<(), LuaError> {
        match value.to_scalar() {
            Value::Nil => self.u8(TAG_NIL),
            Value::Boolean(false) => self.u8(TAG_FALSE),
            Value::Boolean(true) => self.u8(TAG_TRUE),
            Value::Number(Number::Integer(i)) => {
                self.u8(TAG_INTEGER);
                self.out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Number(Number::Float(f)) => {
                self.u8(TAG_FLOAT);
                self.out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Value::String(s) => {
                self.u8(TAG_STRING);
                let strings = self.strings;
                self.string(strings.get_bytes(s));
            }
            other => {
                return Err(chunk_error(format!(
                    "cannot dump a {} literal",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }

    /// Index of `sym` in the symbol table. A global's environment is
    /// registered first so readers can resolve entries in order.
    fn symbol_id(&mut self, sym: &SymbolRef) -> i32 {
        if let SymbolRef::Global { env, .. } = sym {
            self.symbol_id(env);
        }
        self.symbols.insert_full(sym.clone()).0 as i32
    }

    fn instruction(&mut self, instr: &Instruction, base: usize) -> Result<(), LuaError> {
        let usage = instr.op.field_usage();
        self.u8(instr.op as u8);
        if usage.contains(FieldUsage::NUM_VAL_AS_CODE_ADDRESS) {
            self.i32(instr.num_val - base as i32);
        } else if usage.contains(FieldUsage::NUM_VAL) {
            self.i32(instr.num_val);
        }
        if usage.contains(FieldUsage::NUM_VAL2) {
            self.i32(instr.num_val2);
        }
        if usage.contains(FieldUsage::NAME) {
            self.name(instr.name);
        }
        if usage.contains(FieldUsage::VALUE) {
            match &instr.value {
                Some(v) => {
                    self.u8(1);
                    self.value(v)?;
                }
                None => self.u8(0),
            }
        }
        if usage.contains(FieldUsage::SYMBOL) {
            let id = match &instr.symbol {
                Some(sym) => self.symbol_id(sym),
                None => -1,
            };
            self.i32(id);
        }
        if usage.contains(FieldUsage::SYMBOL_LIST) {
            match &instr.symbol_list {
                Some(list) => {
                    let ids: Vec<i32> = list.iter().map(|s| self.symbol_id(s)).collect();
                    self.i32(ids.len() as i32);
                    for id in ids {
                        self.i32(id);
                    }
                }
                None => self.i32(-1),
            }
        }
        Ok(())
    }

    fn symbol_table(&mut self) {
        let symbols = std::mem::take(&mut self.symbols);
        self.i32(symbols.len() as i32);
        for sym in &symbols {
            let (kind, index, attrs, env) = match sym {
                SymbolRef::Local {
                    index, attributes, ..
                } => (SYM_LOCAL, *index as i32, attributes.bits(), -1),
                SymbolRef::UpValue { index, .. } => (SYM_UPVALUE, *index as i32, 0, -1),
                SymbolRef::Global { env, .. } => {
                    let env = symbols.get_index_of(env.as_ref()).map_or(-1, |i| i as i32);
                    (SYM_GLOBAL, -1, 0, env)
                }
                SymbolRef::DefaultEnv => (SYM_DEFAULT_ENV, -1, 0, -1),
            };
            self.u8(kind);
            self.i32(index);
            self.name(sym.name());
            self.u8(attrs);
            self.i32(env);
        }
    }
}

/// Serializes the instructions of the function starting at `base`.
pub fn dump_function(
    code: &[Instruction],
    base: usize,
    has_env: bool,
    strings: &StringInterner,
) -> Result<Vec<u8>, LuaError> {
    let len = match code.get(base) {
        Some(meta) if meta.op == OpCode::Meta => usize::try_from(meta.num_val).unwrap_or(0),
        _ => return Err(chunk_error("invalid baseAddress")),
    };
    let body = code
        .get(base..base + len)
        .ok_or_else(|| chunk_error("function extends past the end of the code"))?;
    let mut w = Writer {
        out: Vec::new(),
        strings,
        symbols: IndexSet::new(),
    };
    w.out.extend_from_slice(&CHUNK_MAGIC.to_le_bytes());
    w.i32(CHUNK_VERSION);
    w.u8(has_env as u8);
    w.i32(body.len() as i32);
    for instr in body {
        w.instruction(instr, base)?;
    }
    w.symbol_table();
    Ok(w.out)
}

// ─── Undumper ───────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], LuaError> {
        if n > self.remaining() {
            return Err(chunk_error("truncated chunk"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, LuaError> {
        Ok(self.bytes(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, LuaError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(4)?);
        Ok(i32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, LuaError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// A count field; never more than the bytes left, since every counted
    /// item takes at least `min_size` bytes.
    fn count(&mut self, min_size: usize) -> Result<usize, LuaError> {
        let n = self.i32()?;
        let n = usize::try_from(n).map_err(|_| chunk_error(format!("invalid count {n}")))?;
        if n.saturating_mul(min_size) > self.remaining() {
            return Err(chunk_error("truncated chunk"));
        }
        Ok(n)
    }

    fn string(&mut self) -> Result<&'a [u8], LuaError> {
        let len = self.count(1)?;
        self.bytes(len)
    }

    fn name(&mut self, strings: &mut StringInterner) -> Result<Option<tarn_core::string::StringId>, LuaError> {
        match self.u8()? {
            0 => Ok(None),
            _ => Ok(Some(strings.intern(self.string()?))),
        }
    }

    fn value(&mut self, strings: &mut StringInterner) -> Result<Value, LuaError> {
        Ok(match self.u8()? {
            TAG_NIL => Value::Nil,
            TAG_FALSE => Value::Boolean(false),
            TAG_TRUE => Value::Boolean(true),
            TAG_INTEGER => Value::integer(self.u64()? as i64),
            TAG_FLOAT => Value::float(f64::from_bits(self.u64()?)),
            TAG_STRING => Value::String(strings.intern(self.string()?)),
            tag => return Err(chunk_error(format!("invalid value tag {tag}"))),
        })
    }
}

/// An instruction whose symbols are still symbol-table indices.
struct RawInstruction {
    instr: Instruction,
    symbol: Option<i32>,
    symbol_list: Option<Vec<i32>>,
}

fn read_instruction(
    r: &mut Reader<'_>,
    base: usize,
    strings: &mut StringInterner,
) -> Result<RawInstruction, LuaError> {
    let byte = r.u8()?;
    let op = OpCode::from_u8(byte).ok_or_else(|| chunk_error(format!("invalid opcode {byte}")))?;
    let usage = op.field_usage();
    let mut instr = Instruction::new(op);
    if usage.contains(FieldUsage::NUM_VAL_AS_CODE_ADDRESS) {
        instr.num_val = r
            .i32()?
            .checked_add(base as i32)
            .ok_or_else(|| chunk_error("code address out of range"))?;
    } else if usage.contains(FieldUsage::NUM_VAL) {
        instr.num_val = r.i32()?;
    }
    if usage.contains(FieldUsage::NUM_VAL2) {
        instr.num_val2 = r.i32()?;
    }
    if usage.contains(FieldUsage::NAME) {
        instr.name = r.name(strings)?;
    }
    if usage.contains(FieldUsage::VALUE) && r.u8()? != 0 {
        instr.value = Some(r.value(strings)?);
    }
    let symbol = if usage.contains(FieldUsage::SYMBOL) {
        Some(r.i32()?).filter(|&id| id >= 0)
    } else {
        None
    };
    let symbol_list = if usage.contains(FieldUsage::SYMBOL_LIST) {
        match r.i32()? {
            -1 => None,
            n => {
                let n = usize::try_from(n).map_err(|_| chunk_error(format!("invalid count {n}")))?;
                if n.saturating_mul(4) > r.remaining() {
                    return Err(chunk_error("truncated chunk"));
                }
                Some((0..n).map(|_| r.i32()).collect::<Result<Vec<_>, _>>()?)
            }
        }
    } else {
        None
    };
    Ok(RawInstruction {
        instr,
        symbol,
        symbol_list,
    })
}

fn read_symbols(r: &mut Reader<'_>, strings: &mut StringInterner) -> Result<Vec<SymbolRef>, LuaError> {
    let count = r.count(11)?;
    let mut symbols: Vec<SymbolRef> = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = r.u8()?;
        let index = r.i32()?;
        let name = r.name(strings)?;
        let attrs = SymbolAttributes::from_bits(r.u8()?);
        let env = r.i32()?;
        let slot = || usize::try_from(index).map_err(|_| chunk_error(format!("invalid symbol index {index}")));
        let named = || name.ok_or_else(|| chunk_error("symbol without a name"));
        let sym = match kind {
            SYM_LOCAL => SymbolRef::local_with(slot()?, named()?, attrs),
            SYM_UPVALUE => SymbolRef::upvalue(slot()?, named()?),
            SYM_GLOBAL => {
                let env = usize::try_from(env)
                    .ok()
                    .and_then(|e| symbols.get(e))
                    .cloned()
                    .ok_or_else(|| chunk_error(format!("invalid symbol id {env}")))?;
                SymbolRef::Global {
                    name: named()?,
                    env: Rc::new(env),
                }
            }
            SYM_DEFAULT_ENV => SymbolRef::DefaultEnv,
            other => return Err(chunk_error(format!("invalid symbol kind {other}"))),
        };
        symbols.push(sym);
    }
    Ok(symbols)
}

/// Parses a chunk whose first instruction will live at `base`. Returns the
/// instructions and whether the function expects an `_ENV` upvalue.
pub fn undump_function(
    data: &[u8],
    base: usize,
    strings: &mut StringInterner,
) -> Result<(Vec<Instruction>, bool), LuaError> {
    let mut r = Reader { data, pos: 0 };
    if data.len() < 8 || r.u64()? != CHUNK_MAGIC {
        return Err(chunk_error("not a tarn chunk"));
    }
    if r.i32()? != CHUNK_VERSION {
        return Err(chunk_error("invalid version"));
    }
    let has_env = r.u8()? != 0;
    let count = r.count(1)?;
    let mut raw = Vec::with_capacity(count);
    for _ in 0..count {
        raw.push(read_instruction(&mut r, base, strings)?);
    }
    let symbols = read_symbols(&mut r, strings)?;
    let resolve = |id: i32| {
        usize::try_from(id)
            .ok()
            .and_then(|i| symbols.get(i))
            .cloned()
            .ok_or_else(|| chunk_error(format!("invalid symbol id {id}")))
    };

    let mut code = Vec::with_capacity(raw.len());
    for RawInstruction {
        mut instr,
        symbol,
        symbol_list,
    } in raw
    {
        if let Some(id) = symbol {
            instr.symbol = Some(resolve(id)?);
        }
        if let Some(ids) = symbol_list {
            let list = ids.into_iter().map(resolve).collect::<Result<Vec<_>, _>>()?;
            instr.symbol_list = Some(list.into());
        }
        code.push(instr);
    }
    if code.first().map(|i| i.op) != Some(OpCode::Meta) {
        return Err(chunk_error("invalid baseAddress"));
    }
    Ok((code, has_env))
}

impl Vm {
    /// Serializes a Lua function. Only functions without upvalues, or with
    /// `_ENV` as their single upvalue, can be dumped.
    pub fn dump(&self, function: &Value) -> Result<Vec<u8>, LuaError> {
        let Value::Function(c) = function.to_scalar() else {
            return Err(chunk_error("unable to dump given function"));
        };
        let has_env = match self.closure_upvalues_kind(function) {
            Some(UpvaluesKind::None) => false,
            Some(UpvaluesKind::Environment) => true,
            _ => return Err(chunk_error("function has upvalues other than _ENV")),
        };
        let base = self
            .heap
            .closures
            .get(c)
            .ok_or_else(|| LuaError::internal("stale closure handle"))?
            .entry_point;
        let bytes = dump_function(&self.code.code, base, has_env, &self.strings)?;
        tracing::debug!(base, bytes = bytes.len(), "dumped function");
        Ok(bytes)
    }

    /// Loads a dumped function at the end of this VM's code. A function
    /// dumped with `_ENV` gets the globals table as its environment.
    pub fn undump(&mut self, data: &[u8]) -> Result<Value, LuaError> {
        let base = self.code.len();
        let (code, has_env) = undump_function(data, base, &mut self.strings)?;
        let count = code.len();
        self.code.code.extend(code);
        let context = if has_env {
            self.env_context()
        } else {
            self.heap.alloc_context(ClosureContext::default())
        };
        tracing::debug!(base, instructions = count, "undumped function");
        Ok(Value::Function(self.heap.alloc_closure(base, context)))
    }
}
