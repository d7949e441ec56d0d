//! Call frame information for the VM.

use crate::stack::FastStack;
use indexmap::IndexSet;
use std::rc::Rc;
use tarn_bytecode::{SourceRef, SymbolRef};
use tarn_core::gc::{ClosureContext, GcIdx, UpVal};
use tarn_core::value::{NativeId, Value};

// Flags for CallStackItem boolean fields
pub const FLAG_CALL_ENTRY_POINT: u8 = 1;
pub const FLAG_RESUME_ENTRY_POINT: u8 = 2;
pub const FLAG_METHOD_CALL: u8 = 4;
pub const FLAG_TAIL_CALL: u8 = 8;

/// One local slot. A slot becomes a shared cell once a closure captures it.
#[derive(Clone, Debug)]
pub enum LocalSlot {
    Value(Value),
    Cell(GcIdx<UpVal>),
}

impl Default for LocalSlot {
    fn default() -> Self {
        LocalSlot::Value(Value::Nil)
    }
}

/// A frame on the VM call stack.
#[derive(Clone, Debug, Default)]
pub struct CallStackItem {
    /// Value-stack height at which this frame's temporaries begin. For a
    /// native frame, the position of the function value itself.
    pub base_pointer: Option<usize>,
    /// Where execution continues after return. `None` returns to the host.
    pub return_address: Option<usize>,
    /// `Meta` instruction of the running function (0 for natives).
    pub debug_entry_point: usize,
    /// Position of the call instruction that created this frame.
    pub calling_source: Option<SourceRef>,
    pub closure_context: Option<GcIdx<ClosureContext>>,
    /// Set for frames of native functions.
    pub native: Option<NativeId>,
    pub debug_symbols: Option<Rc<[SymbolRef]>>,
    pub local_scope: Vec<LocalSlot>,
    /// Open blocks, innermost last; each lists its to-be-closed locals.
    pub blocks_to_close: Vec<Vec<SymbolRef>>,
    /// Slots of to-be-closed locals whose block is still open.
    pub to_be_closed: IndexSet<usize>,
    /// Turns an error caught at this frame into its return value.
    pub error_handler: Option<NativeId>,
    /// Applied to the return value on normal return.
    pub continuation: Option<NativeId>,
    /// Runs on a caught error before unwinding (xpcall).
    pub message_handler: Option<Value>,
    pub flags: u8,
}

impl CallStackItem {
    #[inline]
    fn flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_call_entry_point(&self) -> bool {
        self.flag(FLAG_CALL_ENTRY_POINT)
    }

    pub fn is_resume_entry_point(&self) -> bool {
        self.flag(FLAG_RESUME_ENTRY_POINT)
    }

    /// Execution must leave the processing loop when this frame is popped.
    pub fn is_entry_point(&self) -> bool {
        self.flag(FLAG_CALL_ENTRY_POINT | FLAG_RESUME_ENTRY_POINT)
    }

    pub fn is_method_call(&self) -> bool {
        self.flag(FLAG_METHOD_CALL)
    }

    pub fn is_tail_call(&self) -> bool {
        self.flag(FLAG_TAIL_CALL)
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    /// Frames with protected-call or continuation state cannot be replaced
    /// by a tail call.
    pub fn has_handlers(&self) -> bool {
        self.error_handler.is_some()
            || self.continuation.is_some()
            || self.message_handler.is_some()
    }
}

pub type CallStack = FastStack<CallStackItem>;
