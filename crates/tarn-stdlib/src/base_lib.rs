//! Base library: protected calls, errors, raw access, metatables and
//! value inspection.

use crate::register_fn;
use tarn_core::value::Value;
use tarn_vm::{LuaError, NativeContext, Vm};

pub fn register(vm: &mut Vm) {
    let g = vm.globals;
    register_fn(vm, g, "pcall", native_pcall);
    register_fn(vm, g, "xpcall", native_xpcall);
    register_fn(vm, g, "error", native_error);
    register_fn(vm, g, "assert", native_assert);
    register_fn(vm, g, "type", native_type);
    register_fn(vm, g, "tostring", native_tostring);
    register_fn(vm, g, "select", native_select);
    register_fn(vm, g, "rawget", native_rawget);
    register_fn(vm, g, "rawset", native_rawset);
    register_fn(vm, g, "rawequal", native_rawequal);
    register_fn(vm, g, "rawlen", native_rawlen);
    register_fn(vm, g, "setmetatable", native_setmetatable);
    register_fn(vm, g, "getmetatable", native_getmetatable);
    let next = vm.next_function();
    vm.set_global("next", next);
    vm.set_global("_G", Value::Table(g));
}

// ---------------------------------------------------------------------------
// pcall(f, ...) / xpcall(f, msgh, ...)
// Both hand the call back to the processor as a request carrying the error
// handler and continuation, so the callee runs on the same loop.
// ---------------------------------------------------------------------------

fn native_pcall(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let f = ctx.check_any(0)?;
    let args = ctx.rest(1);
    Ok(ctx.vm.protected_call_request(f, args, None))
}

fn native_xpcall(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let f = ctx.check_any(0)?;
    let handler = ctx.check_function(1)?;
    let args = ctx.rest(2);
    Ok(ctx.vm.protected_call_request(f, args, Some(handler)))
}

// ---------------------------------------------------------------------------
// error(value [, level])
// ---------------------------------------------------------------------------

fn native_error(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let value = ctx.arg(0);
    let level = ctx.opt_integer(1, 1)?;
    let message = ctx.vm.tostring_raw(&value);
    Err(LuaError::with_value(
        value,
        message,
        u32::try_from(level).unwrap_or(0),
    ))
}

// ---------------------------------------------------------------------------
// assert(v [, message, ...])
// Returns all arguments when v is truthy.
// ---------------------------------------------------------------------------

fn native_assert(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let v = ctx.check_any(0)?;
    if v.is_truthy() {
        return Ok(Value::tuple(std::mem::take(&mut ctx.args)));
    }
    if ctx.arg_count() < 2 {
        return Err(LuaError::runtime("assertion failed!"));
    }
    let message = ctx.arg(1);
    let text = ctx.vm.tostring_raw(&message);
    Err(LuaError::with_value(message, text, 0))
}

fn native_type(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let v = ctx.check_any(0)?;
    Ok(ctx.string_value(v.type_name()))
}

fn native_tostring(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let v = ctx.check_any(0)?;
    let s = ctx.vm.tostring(&v)?;
    Ok(ctx.string_value(&s))
}

// ---------------------------------------------------------------------------
// select(n, ...) / select('#', ...)
// Negative n counts from the end.
// ---------------------------------------------------------------------------

fn native_select(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let count = ctx.arg_count().saturating_sub(1) as i64;
    if let Value::String(s) = ctx.arg(0) {
        if ctx.vm.strings.get_bytes(s) == b"#" {
            return Ok(Value::integer(count));
        }
    }
    let n = ctx.check_integer(0)?;
    let start = if n < 0 {
        if -n > count {
            return Err(ctx.bad_argument(0, "index out of range"));
        }
        count + n
    } else if n == 0 {
        return Err(ctx.bad_argument(0, "index out of range"));
    } else {
        n - 1
    };
    let start = (start as usize + 1).min(ctx.args.len());
    Ok(Value::tuple(ctx.args.split_off(start)))
}

// ---------------------------------------------------------------------------
// Raw access
// ---------------------------------------------------------------------------

fn native_rawget(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let t = ctx.check_table(0)?;
    let key = ctx.check_any(1)?;
    Ok(ctx.vm.heap.tables[t].raw_get(&key))
}

fn native_rawset(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let t = ctx.check_table(0)?;
    let key = ctx.check_any(1)?;
    let value = ctx.check_any(2)?;
    ctx.vm.heap.tables[t]
        .raw_set(&key, value)
        .map_err(LuaError::runtime)?;
    Ok(Value::Table(t))
}

fn native_rawequal(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let a = ctx.check_any(0)?;
    let b = ctx.check_any(1)?;
    Ok(Value::Boolean(a.raw_equals(&b)))
}

fn native_rawlen(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    match ctx.arg(0) {
        Value::Table(t) => Ok(Value::integer(ctx.vm.heap.tables[t].length())),
        Value::String(s) => Ok(Value::integer(ctx.vm.strings.get_bytes(s).len() as i64)),
        _ => Err(ctx.bad_argument(0, "table or string expected")),
    }
}

// ---------------------------------------------------------------------------
// Metatables
// A metatable with a `__metatable` field is protected: getmetatable returns
// that field and setmetatable refuses to replace it.
// ---------------------------------------------------------------------------

fn native_setmetatable(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let t = ctx.check_table(0)?;
    let mt = match ctx.arg(1) {
        Value::Nil if ctx.arg_count() >= 2 => None,
        Value::Table(mt) => Some(mt),
        _ => return Err(ctx.bad_argument(1, "nil or table expected")),
    };
    let protect = ctx.vm.names().metatable;
    if let Some(current) = ctx.vm.heap.tables[t].metatable {
        if !ctx.vm.heap.tables[current].raw_get_str(protect).is_nil() {
            return Err(LuaError::runtime("cannot change a protected metatable"));
        }
    }
    ctx.vm.heap.tables[t].metatable = mt;
    Ok(Value::Table(t))
}

fn native_getmetatable(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let v = ctx.check_any(0)?;
    let Some(mt) = ctx.vm.metatable(&v) else {
        return Ok(Value::Nil);
    };
    let protect = ctx.vm.names().metatable;
    let field = ctx.vm.heap.tables[mt].raw_get_str(protect);
    if field.is_nil() {
        Ok(Value::Table(mt))
    } else {
        Ok(field)
    }
}
