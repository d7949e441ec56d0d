//! tarn standard library: the base, coroutine and debug libraries.

pub mod base_lib;
pub mod coroutine_lib;
pub mod debug_lib;

use tarn_core::gc::GcIdx;
use tarn_core::table::Table;
use tarn_core::value::Value;
use tarn_vm::{NativeFn, Vm};

/// Registers every library into the VM's globals.
pub fn open_libs(vm: &mut Vm) {
    base_lib::register(vm);
    coroutine_lib::register(vm);
    debug_lib::register(vm);
    tracing::debug!("standard libraries opened");
}

/// Registers `func` as `table[name]`; `name` is also what argument errors
/// and tracebacks show.
pub(crate) fn register_fn(vm: &mut Vm, table: GcIdx<Table>, name: &'static str, func: NativeFn) {
    let f = vm.register_native(name, func);
    vm.set_field(table, name, f);
}

/// A library table stored in the globals under `name`.
pub(crate) fn new_library(vm: &mut Vm, name: &str) -> GcIdx<Table> {
    let table = vm.heap.alloc_table(0, 16);
    vm.set_global(name, Value::Table(table));
    table
}

/// Spreads a call result into a result list: tuples expand, `Void`
/// contributes nothing.
pub(crate) fn push_results(out: &mut Vec<Value>, result: Value) {
    match result {
        Value::Tuple(items) => out.extend(items.iter().cloned()),
        Value::Void => {}
        other => out.push(other),
    }
}
