//! Debug library: tracebacks and upvalue introspection.

use crate::{new_library, register_fn};
use tarn_core::value::Value;
use tarn_vm::error::format_traceback;
use tarn_vm::{LuaError, NativeContext, Vm};

pub fn register(vm: &mut Vm) {
    let debug = new_library(vm, "debug");
    register_fn(vm, debug, "traceback", native_traceback);
    register_fn(vm, debug, "getupvalue", native_getupvalue);
    register_fn(vm, debug, "setupvalue", native_setupvalue);
    register_fn(vm, debug, "upvalueid", native_upvalueid);
    register_fn(vm, debug, "upvaluejoin", native_upvaluejoin);
}

// ---------------------------------------------------------------------------
// debug.traceback([message [, level]])
// A non-string message is returned untouched. Level 1 is the caller.
// ---------------------------------------------------------------------------

fn native_traceback(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let message = ctx.arg(0);
    if !matches!(message, Value::Nil | Value::String(_) | Value::Number(_)) {
        return Ok(message);
    }
    let level = ctx.opt_integer(1, 1)?.max(0) as usize;
    let trace = format_traceback(&ctx.vm.get_stack_trace(level));
    let text = if message.is_nil() {
        trace
    } else {
        format!("{}\n{trace}", ctx.vm.tostring_raw(&message))
    };
    Ok(ctx.string_value(&text))
}

/// 0-based upvalue index from the 1-based argument `i`.
fn upvalue_index(ctx: &NativeContext<'_>, i: usize) -> Result<Option<usize>, LuaError> {
    let n = ctx.check_integer(i)?;
    Ok(usize::try_from(n).ok().and_then(|n| n.checked_sub(1)))
}

// ---------------------------------------------------------------------------
// debug.getupvalue(f, n) / debug.setupvalue(f, n, v)
// Natives have no visible upvalues; out-of-range indices yield nothing.
// ---------------------------------------------------------------------------

fn native_getupvalue(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let f = ctx.check_function(0)?;
    let Some(index) = upvalue_index(ctx, 1)? else {
        return Ok(Value::Void);
    };
    match ctx.vm.get_upvalue(&f, index) {
        Some((name, value)) => Ok(Value::tuple(vec![Value::String(name), value])),
        None => Ok(Value::Void),
    }
}

fn native_setupvalue(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let f = ctx.check_function(0)?;
    let value = ctx.check_any(2)?;
    let Some(index) = upvalue_index(ctx, 1)? else {
        return Ok(Value::Void);
    };
    match ctx.vm.set_upvalue(&f, index, value) {
        Some(name) => Ok(Value::String(name)),
        None => Ok(Value::Void),
    }
}

// ---------------------------------------------------------------------------
// debug.upvalueid(f, n) / debug.upvaluejoin(f1, n1, f2, n2)
// Ids are equal exactly when two closures share a cell.
// ---------------------------------------------------------------------------

fn native_upvalueid(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let f = ctx.check_function(0)?;
    let id = upvalue_index(ctx, 1)?.and_then(|i| ctx.vm.upvalue_id(&f, i));
    match id {
        Some(id) => Ok(Value::integer(id as i64)),
        None => Err(ctx.bad_argument(1, "invalid upvalue index")),
    }
}

fn check_lua_function(ctx: &NativeContext<'_>, i: usize) -> Result<Value, LuaError> {
    let f = ctx.check_function(i)?;
    if ctx.vm.closure_upvalues_kind(&f).is_some() {
        Ok(f)
    } else {
        Err(ctx.bad_argument(i, "Lua function expected"))
    }
}

fn native_upvaluejoin(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let f1 = check_lua_function(ctx, 0)?;
    let f2 = check_lua_function(ctx, 2)?;
    let n1 = upvalue_index(ctx, 1)?.ok_or_else(|| ctx.bad_argument(1, "invalid upvalue index"))?;
    let n2 = upvalue_index(ctx, 3)?.ok_or_else(|| ctx.bad_argument(3, "invalid upvalue index"))?;
    if ctx.vm.upvalue_id(&f1, n1).is_none() {
        return Err(ctx.bad_argument(1, "invalid upvalue index"));
    }
    if ctx.vm.upvalue_id(&f2, n2).is_none() {
        return Err(ctx.bad_argument(3, "invalid upvalue index"));
    }
    ctx.vm.upvalue_join(&f1, n1, &f2, n2)?;
    Ok(Value::Void)
}
