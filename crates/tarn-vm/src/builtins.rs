//! Natives the processor itself refers to by id. They occupy the first
//! slots of the native table, in this order.

use crate::error::LuaError;
use crate::native::{NativeContext, NativeFunction};
use tarn_core::value::{NativeId, Value};

pub(crate) const PCALL_CONTINUATION: NativeId = NativeId(0);
pub(crate) const PCALL_ERROR_HANDLER: NativeId = NativeId(1);
pub(crate) const NEXT: NativeId = NativeId(2);

pub(crate) fn natives() -> Vec<NativeFunction> {
    vec![
        NativeFunction {
            name: "pcall_continuation",
            func: pcall_continuation,
        },
        NativeFunction {
            name: "pcall_error_handler",
            func: pcall_error_handler,
        },
        NativeFunction {
            name: "next",
            func: next,
        },
    ]
}

/// `true, results...`
fn pcall_continuation(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let mut out = Vec::with_capacity(ctx.args.len() + 1);
    out.push(Value::Boolean(true));
    out.extend(ctx.args.drain(..));
    Ok(Value::tuple(out))
}

/// `false, err`
fn pcall_error_handler(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    Ok(Value::tuple(vec![Value::Boolean(false), ctx.arg(0)]))
}

pub(crate) fn next(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let t = ctx.check_table(0)?;
    let key = ctx.arg(1);
    match ctx.vm.heap.tables[t].next(&key) {
        Ok(Some((k, v))) => Ok(Value::tuple(vec![k, v])),
        Ok(None) => Ok(Value::Nil),
        Err(()) => Err(LuaError::runtime("invalid key to 'next'")),
    }
}
