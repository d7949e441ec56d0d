//! tarn virtual machine: the stack-based bytecode processor.

pub mod arith;
pub mod binary_chunk;
mod builtins;
pub mod callstack;
pub mod coerce;
pub mod compare;
pub mod coroutine;
mod dispatch;
pub mod error;
pub mod metamethod;
pub mod native;
pub mod options;
mod scope;
pub mod stack;
pub mod vm;

pub use coroutine::CoroutineState;
pub use error::{LuaError, ScriptError, StackFrameInfo};
pub use native::{NativeContext, NativeFn, NativeFunction};
pub use options::VmOptions;
pub use vm::{UpvaluesKind, Vm};
