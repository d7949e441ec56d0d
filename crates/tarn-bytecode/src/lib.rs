//! Instruction stream of the tarn VM: opcodes, instructions, compile-time
//! symbol references and the `ByteCode` emitter a front-end drives.
pub mod bytecode;
pub mod disasm;
pub mod error;
pub mod instruction;
pub mod opcode;
pub mod symbol;

pub use bytecode::{ByteCode, FunctionMark, IndexFlavor, MetaKind};
pub use error::BytecodeError;
pub use instruction::{Instruction, SourceRef};
pub use opcode::{FieldUsage, OpCode};
pub use symbol::{RuntimeScopeBlock, RuntimeScopeFrame, SymbolAttributes, SymbolRef};
