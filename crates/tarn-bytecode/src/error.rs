use crate::opcode::OpCode;
use thiserror::Error;

/// Misuse of the emitter; always a front-end bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    #[error("cannot load the default environment symbol")]
    LoadDefaultEnv,
    #[error("cannot store into the default environment symbol")]
    StoreDefaultEnv,
    #[error("instruction {0} ({1}) has no code address to patch")]
    NotAJump(usize, OpCode),
    #[error("instruction index {0} out of range")]
    OutOfRange(usize),
}
