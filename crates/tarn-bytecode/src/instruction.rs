//! A single instruction of the stream.

use crate::opcode::{FieldUsage, OpCode};
use crate::symbol::SymbolRef;
use std::fmt::{self, Write};
use std::rc::Rc;
use tarn_core::string::{StringId, StringInterner};
use tarn_core::value::Value;

/// Source position attached to an instruction for error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub chunk: StringId,
    pub line: u32,
    pub column: u32,
}

impl SourceRef {
    pub fn new(chunk: StringId, line: u32, column: u32) -> Self {
        SourceRef {
            chunk,
            line,
            column,
        }
    }

    /// `chunk:line`, the prefix used when decorating error messages.
    pub fn format(&self, strings: &StringInterner) -> String {
        format!("{}:{}", strings.get_str(self.chunk), self.line)
    }
}

/// One tagged instruction. Fields an opcode does not use stay at their
/// defaults (see `OpCode::field_usage`).
#[derive(Clone, Debug)]
pub struct Instruction {
    pub op: OpCode,
    pub num_val: i32,
    pub num_val2: i32,
    pub value: Option<Value>,
    pub symbol: Option<SymbolRef>,
    pub symbol_list: Option<Rc<[SymbolRef]>>,
    pub name: Option<StringId>,
    pub source: Option<SourceRef>,
}

impl Instruction {
    pub fn new(op: OpCode) -> Self {
        Instruction {
            op,
            num_val: 0,
            num_val2: 0,
            value: None,
            symbol: None,
            symbol_list: None,
            name: None,
            source: None,
        }
    }

    pub fn with_num(mut self, num_val: i32) -> Self {
        self.num_val = num_val;
        self
    }

    pub fn with_num2(mut self, num_val2: i32) -> Self {
        self.num_val2 = num_val2;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_symbol(mut self, symbol: SymbolRef) -> Self {
        self.symbol = Some(symbol);
        self
    }

    pub fn with_symbols(mut self, symbols: impl Into<Rc<[SymbolRef]>>) -> Self {
        self.symbol_list = Some(symbols.into());
        self
    }

    pub fn with_name(mut self, name: StringId) -> Self {
        self.name = Some(name);
        self
    }

    pub fn symbols(&self) -> &[SymbolRef] {
        self.symbol_list.as_deref().unwrap_or(&[])
    }

    /// Static effect on the operand-stack depth, taking the fall-through path
    /// of conditional jumps. Tuple expansion (`ExpTuple`, trailing call
    /// results) is counted as one value.
    pub fn stack_delta(&self) -> i32 {
        let n = self.num_val;
        match self.op {
            OpCode::Pop => -n,
            OpCode::Copy
            | OpCode::Literal
            | OpCode::Closure
            | OpCode::NewTable
            | OpCode::Local
            | OpCode::UpValue
            | OpCode::ExpTuple => 1,
            OpCode::TblInitN => -2,
            OpCode::TblInitI => -1,
            OpCode::IndexSet | OpCode::IndexSetN | OpCode::IndexSetL => {
                if self.value.is_some() {
                    -1
                } else {
                    -2
                }
            }
            OpCode::Index | OpCode::IndexN | OpCode::IndexL => {
                if self.value.is_some() {
                    0
                } else {
                    -1
                }
            }
            OpCode::Call | OpCode::ThisCall => -n,
            OpCode::Ret => {
                if n == 1 {
                    -1
                } else {
                    0
                }
            }
            OpCode::Jf | OpCode::JNil | OpCode::JtOrPop | OpCode::JfOrPop => -1,
            OpCode::LessEq => 0,
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
            | OpCode::ShiftRight
            | OpCode::Concat
            | OpCode::Eq
            | OpCode::Less
            | OpCode::CNot => -1,
            OpCode::MkTuple => 1 - n,
            _ => 0,
        }
    }

    /// One-line textual form used by the disassembler.
    pub fn display<'a>(&'a self, strings: &'a StringInterner) -> InstructionDisplay<'a> {
        InstructionDisplay {
            instr: self,
            strings,
        }
    }
}

pub struct InstructionDisplay<'a> {
    instr: &'a Instruction,
    strings: &'a StringInterner,
}

/// Literal rendering for instruction operands.
pub fn format_literal(value: &Value, strings: &StringInterner) -> String {
    match value {
        Value::Nil | Value::Void => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{:?}", strings.get_str(*s)),
        other => format!("<{}>", other.type_name()),
    }
}

impl fmt::Display for InstructionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = self.instr;
        let usage = i.op.field_usage();
        let mut out = format!("{:<10}", i.op.name());
        if usage.contains(FieldUsage::NUM_VAL) {
            write!(out, " {}", i.num_val)?;
        }
        if usage.contains(FieldUsage::NUM_VAL2) {
            write!(out, " {}", i.num_val2)?;
        }
        if usage.contains(FieldUsage::NAME) {
            if let Some(name) = i.name {
                write!(out, " {}", self.strings.get_str(name))?;
            }
        }
        if usage.contains(FieldUsage::VALUE) {
            if let Some(v) = &i.value {
                write!(out, " {}", format_literal(v, self.strings))?;
            }
        }
        if usage.contains(FieldUsage::SYMBOL) {
            if let Some(s) = &i.symbol {
                write!(out, " [{}]", s.display(self.strings))?;
            }
        }
        if usage.contains(FieldUsage::SYMBOL_LIST) && !i.symbols().is_empty() {
            let list: Vec<String> = i
                .symbols()
                .iter()
                .map(|s| s.display(self.strings).to_string())
                .collect();
            write!(out, " {{{}}}", list.join(", "))?;
        }
        f.write_str(out.trim_end())
    }
}
