//! Coroutine library.
//!
//! Coroutine handles are `thread` values naming a coroutine owned by the VM.
//! `wrap` returns a table whose `__call` resumes the coroutine and re-raises
//! its errors.

use crate::{new_library, push_results, register_fn};
use tarn_core::value::{ThreadId, Value};
use tarn_vm::{LuaError, NativeContext, Vm};

const WRAP_CALL: &str = "wrapped coroutine";

pub fn register(vm: &mut Vm) {
    let co = new_library(vm, "coroutine");
    register_fn(vm, co, "create", native_create);
    register_fn(vm, co, "resume", native_resume);
    register_fn(vm, co, "yield", native_yield);
    register_fn(vm, co, "status", native_status);
    register_fn(vm, co, "running", native_running);
    register_fn(vm, co, "isyieldable", native_isyieldable);
    register_fn(vm, co, "close", native_close);
    register_fn(vm, co, "wrap", native_wrap);
    // Reached only through the `__call` of wrap handles.
    vm.register_native(WRAP_CALL, native_wrap_call);
}

fn create(ctx: &mut NativeContext<'_>) -> Result<ThreadId, LuaError> {
    let f = ctx.check_function(0)?;
    match ctx.vm.create_coroutine(f) {
        Ok(Value::Thread(id)) => Ok(id),
        Ok(_) => Err(LuaError::internal("coroutine handle expected")),
        Err(LuaError::Argument(msg)) => Err(ctx.bad_argument(0, &msg)),
        Err(e) => Err(e),
    }
}

fn native_create(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    create(ctx).map(Value::Thread)
}

// ---------------------------------------------------------------------------
// coroutine.resume(co, ...)
// Returns true plus the yielded or returned values, or false plus the error.
// ---------------------------------------------------------------------------

fn native_resume(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let co = ctx.check_thread(0)?;
    let args = ctx.rest(1);
    match ctx.vm.resume(co, args) {
        Ok(result) => {
            let mut out = vec![Value::Boolean(true)];
            push_results(&mut out, result);
            Ok(Value::tuple(out))
        }
        Err(LuaError::Runtime(e)) => {
            let value = ctx.vm.error_value(&e);
            Ok(Value::tuple(vec![Value::Boolean(false), value]))
        }
        Err(e) => Err(e),
    }
}

fn native_yield(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    if !ctx.vm.is_yieldable() {
        return Err(if ctx.vm.running().1 {
            LuaError::yield_outside_coroutine()
        } else {
            LuaError::yield_across_boundary()
        });
    }
    Ok(Value::YieldRequest(std::mem::take(&mut ctx.args).into()))
}

fn native_status(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let co = ctx.check_thread(0)?;
    let state = ctx.vm.coroutine_status(co)?;
    Ok(ctx.string_value(state.name()))
}

fn native_running(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let (thread, is_main) = ctx.vm.running();
    Ok(Value::tuple(vec![thread, Value::Boolean(is_main)]))
}

fn native_isyieldable(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    Ok(Value::Boolean(ctx.vm.is_yieldable()))
}

// ---------------------------------------------------------------------------
// coroutine.close(co)
// true on success; false plus the error when a closer failed or the
// coroutine had died with an error.
// ---------------------------------------------------------------------------

fn native_close(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let co = ctx.check_thread(0)?;
    match ctx.vm.close_coroutine(co)? {
        None => Ok(Value::Boolean(true)),
        Some(err) => Ok(Value::tuple(vec![Value::Boolean(false), err])),
    }
}

// ---------------------------------------------------------------------------
// coroutine.wrap(f)
// ---------------------------------------------------------------------------

fn native_wrap(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let co = create(ctx)?;
    let call = ctx
        .vm
        .find_native(WRAP_CALL)
        .ok_or_else(|| LuaError::internal("coroutine library not opened"))?;
    let handle = ctx.vm.heap.alloc_table(1, 0);
    ctx.vm.heap.tables[handle].raw_seti(1, Value::Thread(co));
    let mt = ctx.vm.heap.alloc_table(0, 1);
    ctx.vm.set_field(mt, "__call", call);
    ctx.vm.heap.tables[handle].metatable = Some(mt);
    Ok(Value::Table(handle))
}

/// `__call(handle, ...)` of a wrap handle.
fn native_wrap_call(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let handle = ctx.check_table(0)?;
    let Value::Thread(co) = ctx.vm.heap.tables[handle].raw_geti(1) else {
        return Err(ctx.bad_argument(0, "coroutine expected"));
    };
    let args = ctx.rest(1);
    match ctx.vm.resume(co, args) {
        Ok(result) => Ok(result),
        Err(LuaError::Runtime(e)) => {
            let value = ctx.vm.error_value(&e);
            Err(LuaError::with_value(value, e.display_message(), 0))
        }
        Err(e) => Err(e),
    }
}
