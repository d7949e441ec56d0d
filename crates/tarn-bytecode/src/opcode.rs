/// Opcodes of the stack machine and the operand fields each one uses.
///
/// Every instruction carries the same set of optional fields (`num_val`,
/// `num_val2`, `value`, `symbol`, `symbol_list`, `name`); `field_usage`
/// tells the dumper, the disassembler and tooling which of them matter.
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0,
    Debug,
    Invalid,
    Pop,
    Copy,
    Swap,
    Literal,
    Closure,
    NewTable,
    TblInitN,
    TblInitI,
    StoreLcl,
    Local,
    StoreUpv,
    UpValue,
    IndexSet,
    Index,
    IndexSetN,
    IndexN,
    IndexSetL,
    IndexL,
    Clean,
    Meta,
    BeginFn,
    Args,
    Call,
    ThisCall,
    Ret,
    Jump,
    Jf,
    JNil,
    JFor,
    JtOrPop,
    JfOrPop,
    Concat,
    LessEq,
    Less,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    FloorDiv,
    Power,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    BitNot,
    Not,
    Len,
    Neg,
    CNot,
    MkTuple,
    Scalar,
    Incr,
    ToNum,
    ToBool,
    ExpTuple,
    Enter,
    Leave,
    Exit,
    IterPrep,
    IterUpd,
}

/// Bit set of the instruction fields an opcode reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldUsage(u8);

impl FieldUsage {
    pub const NONE: FieldUsage = FieldUsage(0);
    pub const NUM_VAL: FieldUsage = FieldUsage(1);
    pub const NUM_VAL2: FieldUsage = FieldUsage(2);
    pub const VALUE: FieldUsage = FieldUsage(4);
    pub const SYMBOL: FieldUsage = FieldUsage(8);
    pub const SYMBOL_LIST: FieldUsage = FieldUsage(16);
    pub const NAME: FieldUsage = FieldUsage(32);
    /// `num_val` holds an instruction index (relocated on dump).
    pub const NUM_VAL_AS_CODE_ADDRESS: FieldUsage = FieldUsage(64 | 1);

    pub const fn union(self, other: FieldUsage) -> FieldUsage {
        FieldUsage(self.0 | other.0)
    }

    pub const fn contains(self, other: FieldUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for FieldUsage {
    type Output = FieldUsage;

    fn bitor(self, rhs: FieldUsage) -> FieldUsage {
        self.union(rhs)
    }
}

impl OpCode {
    pub const ALL: [OpCode; 66] = [
        OpCode::Nop,
        OpCode::Debug,
        OpCode::Invalid,
        OpCode::Pop,
        OpCode::Copy,
        OpCode::Swap,
        OpCode::Literal,
        OpCode::Closure,
        OpCode::NewTable,
        OpCode::TblInitN,
        OpCode::TblInitI,
        OpCode::StoreLcl,
        OpCode::Local,
        OpCode::StoreUpv,
        OpCode::UpValue,
        OpCode::IndexSet,
        OpCode::Index,
        OpCode::IndexSetN,
        OpCode::IndexN,
        OpCode::IndexSetL,
        OpCode::IndexL,
        OpCode::Clean,
        OpCode::Meta,
        OpCode::BeginFn,
        OpCode::Args,
        OpCode::Call,
        OpCode::ThisCall,
        OpCode::Ret,
        OpCode::Jump,
        OpCode::Jf,
        OpCode::JNil,
        OpCode::JFor,
        OpCode::JtOrPop,
        OpCode::JfOrPop,
        OpCode::Concat,
        OpCode::LessEq,
        OpCode::Less,
        OpCode::Eq,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::FloorDiv,
        OpCode::Power,
        OpCode::BitAnd,
        OpCode::BitOr,
        OpCode::BitXor,
        OpCode::ShiftLeft,
        OpCode::ShiftRight,
        OpCode::BitNot,
        OpCode::Not,
        OpCode::Len,
        OpCode::Neg,
        OpCode::CNot,
        OpCode::MkTuple,
        OpCode::Scalar,
        OpCode::Incr,
        OpCode::ToNum,
        OpCode::ToBool,
        OpCode::ExpTuple,
        OpCode::Enter,
        OpCode::Leave,
        OpCode::Exit,
        OpCode::IterPrep,
        OpCode::IterUpd,
    ];

    pub fn from_u8(val: u8) -> Option<OpCode> {
        OpCode::ALL.get(val as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Nop => "NOP",
            OpCode::Debug => "DEBUG",
            OpCode::Invalid => "INVALID",
            OpCode::Pop => "POP",
            OpCode::Copy => "COPY",
            OpCode::Swap => "SWAP",
            OpCode::Literal => "LITERAL",
            OpCode::Closure => "CLOSURE",
            OpCode::NewTable => "NEWTABLE",
            OpCode::TblInitN => "TBLINITN",
            OpCode::TblInitI => "TBLINITI",
            OpCode::StoreLcl => "STORELCL",
            OpCode::Local => "LOCAL",
            OpCode::StoreUpv => "STOREUPV",
            OpCode::UpValue => "UPVALUE",
            OpCode::IndexSet => "INDEXSET",
            OpCode::Index => "INDEX",
            OpCode::IndexSetN => "INDEXSETN",
            OpCode::IndexN => "INDEXN",
            OpCode::IndexSetL => "INDEXSETL",
            OpCode::IndexL => "INDEXL",
            OpCode::Clean => "CLEAN",
            OpCode::Meta => "META",
            OpCode::BeginFn => "BEGINFN",
            OpCode::Args => "ARGS",
            OpCode::Call => "CALL",
            OpCode::ThisCall => "THISCALL",
            OpCode::Ret => "RET",
            OpCode::Jump => "JUMP",
            OpCode::Jf => "JF",
            OpCode::JNil => "JNIL",
            OpCode::JFor => "JFOR",
            OpCode::JtOrPop => "JTORPOP",
            OpCode::JfOrPop => "JFORPOP",
            OpCode::Concat => "CONCAT",
            OpCode::LessEq => "LESSEQ",
            OpCode::Less => "LESS",
            OpCode::Eq => "EQ",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::FloorDiv => "FLOORDIV",
            OpCode::Power => "POWER",
            OpCode::BitAnd => "BITAND",
            OpCode::BitOr => "BITOR",
            OpCode::BitXor => "BITXOR",
            OpCode::ShiftLeft => "SHL",
            OpCode::ShiftRight => "SHR",
            OpCode::BitNot => "BITNOT",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Neg => "NEG",
            OpCode::CNot => "CNOT",
            OpCode::MkTuple => "MKTUPLE",
            OpCode::Scalar => "SCALAR",
            OpCode::Incr => "INCR",
            OpCode::ToNum => "TONUM",
            OpCode::ToBool => "TOBOOL",
            OpCode::ExpTuple => "EXPTUPLE",
            OpCode::Enter => "ENTER",
            OpCode::Leave => "LEAVE",
            OpCode::Exit => "EXIT",
            OpCode::IterPrep => "ITERPREP",
            OpCode::IterUpd => "ITERUPD",
        }
    }

    pub fn field_usage(self) -> FieldUsage {
        use FieldUsage as F;
        match self {
            OpCode::Pop
            | OpCode::Copy
            | OpCode::TblInitI
            | OpCode::NewTable
            | OpCode::Ret
            | OpCode::MkTuple
            | OpCode::Incr
            | OpCode::ToNum
            | OpCode::ExpTuple => F::NUM_VAL,
            OpCode::Call | OpCode::ThisCall => F::NUM_VAL | F::NAME,
            OpCode::Swap => F::NUM_VAL | F::NUM_VAL2,
            OpCode::Literal => F::VALUE,
            OpCode::Closure => F::SYMBOL_LIST | F::NUM_VAL_AS_CODE_ADDRESS,
            OpCode::StoreLcl | OpCode::StoreUpv => F::SYMBOL | F::NUM_VAL | F::NUM_VAL2,
            OpCode::Local | OpCode::UpValue => F::SYMBOL,
            OpCode::IndexSet | OpCode::IndexSetN | OpCode::IndexSetL => {
                F::SYMBOL | F::NUM_VAL | F::NUM_VAL2 | F::VALUE
            }
            OpCode::Index | OpCode::IndexN | OpCode::IndexL => F::VALUE,
            OpCode::Clean | OpCode::Enter | OpCode::Leave | OpCode::Exit => {
                F::NUM_VAL | F::NUM_VAL2 | F::SYMBOL_LIST
            }
            OpCode::Meta => F::NUM_VAL | F::NUM_VAL2 | F::NAME,
            OpCode::BeginFn => F::SYMBOL_LIST | F::NUM_VAL | F::NUM_VAL2,
            OpCode::Args => F::SYMBOL_LIST,
            OpCode::Jump
            | OpCode::Jf
            | OpCode::JNil
            | OpCode::JFor
            | OpCode::JtOrPop
            | OpCode::JfOrPop => F::NUM_VAL_AS_CODE_ADDRESS,
            OpCode::Debug | OpCode::Invalid | OpCode::Nop => F::NAME,
            _ => F::NONE,
        }
    }

    /// True for the binary operators that consume two values and may fall
    /// back to a metamethod.
    pub fn is_binary_operator(self) -> bool {
        matches!(
            self,
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
                | OpCode::LessEq
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
