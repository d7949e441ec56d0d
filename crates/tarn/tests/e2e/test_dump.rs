use super::helpers::*;
use tarn::{Number, OpCode, Value};

/// function(a) return a * 2 + K, 2.0, "tag" end
fn scale(asm: &mut Asm) -> Value {
    let a = asm.local(0, "a");
    let k = asm.global("K");
    let mark = asm.begin("scale", vec![a.clone()], 0, &[a.clone()]);
    asm.line(3);
    asm.load(&a);
    asm.int(2);
    asm.op(OpCode::Mul);
    asm.load(&k);
    asm.op(OpCode::Add);
    asm.lit(Value::float(2.0));
    asm.lit_str("tag");
    asm.code().emit_mk_tuple(3);
    asm.ret(1);
    let entry = asm.end(mark);
    asm.function(entry)
}

fn check_scale_results(asm: &Asm, out: &[Value]) {
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].as_integer(), Some(41));
    assert!(matches!(out[1], Value::Number(Number::Float(f)) if f == 2.0));
    assert_eq!(asm.text(&out[2]), "tag");
}

#[test]
fn test_dumped_function_runs_in_a_fresh_interpreter() {
    let mut source = Asm::new();
    source.lua.set_global("K", Value::integer(1));
    let f = scale(&mut source);
    let out = source.call_value(&f, vec![Value::integer(20)]).unwrap();
    check_scale_results(&source, &out);
    let bytes = source.lua.dump(&f).unwrap();

    let mut target = Asm::new();
    // Offset the target's instruction stream so relocation matters.
    let pad = target.begin("pad", vec![], 0, &[]);
    target.end(pad);
    target.lua.set_global("K", Value::integer(1));
    let g = target.lua.undump(&bytes).unwrap();
    let out = target.call_value(&g, vec![Value::integer(20)]).unwrap();
    check_scale_results(&target, &out);
}

#[test]
fn test_undumped_function_raises_errors() {
    let mut source = Asm::new();
    let error = source.global("error");
    let mark = source.begin("fails", vec![], 0, &[]);
    source.line(9);
    source.load(&error);
    source.lit_str("late");
    source.call(1, "error");
    source.ret(0);
    let entry = source.end(mark);
    let f = source.function(entry);
    let bytes = source.lua.dump(&f).unwrap();

    let mut target = Asm::new();
    let g = target.lua.undump(&bytes).unwrap();
    let err = target.call_value(&g, vec![]).unwrap_err();
    // Source positions are not part of a chunk.
    let msg = err.to_string();
    assert!(msg.starts_with("bytecode:") && msg.ends_with(": late"), "{msg}");
}

#[test]
fn test_closures_with_captured_locals_cannot_be_dumped() {
    // local x; return function() return x end
    let mut asm = Asm::new();
    let x = asm.local(0, "x");
    let mark = asm.begin("outer", vec![x.clone()], 0, &[]);
    let inner = asm.begin("inner", vec![], 0, &[]);
    let up = asm.upvalue(0, "x");
    asm.load(&up);
    asm.ret(1);
    let inner = asm.end(inner);
    asm.code().emit_closure(&[x.clone()], inner as i32);
    asm.ret(1);
    let entry = asm.end(mark);
    let outer = asm.function(entry);
    let closure = asm.call_value(&outer, vec![]).unwrap().remove(0);
    let err = asm.lua.dump(&closure).unwrap_err();
    assert!(
        err.to_string().contains("function has upvalues other than _ENV"),
        "{err}"
    );
}

#[test]
fn test_natives_cannot_be_dumped() {
    let asm = Asm::new();
    let pcall = asm.global_fn("pcall");
    assert!(asm.lua.dump(&pcall).is_err());
}

#[test]
fn test_undump_rejects_garbage() {
    let mut asm = Asm::new();
    let before = asm.lua.code_mut().len();
    assert!(asm.lua.undump(b"\x1bLua").is_err());
    assert!(asm.lua.undump(&[0u8; 64]).is_err());
    assert_eq!(asm.lua.code_mut().len(), before);
}

#[test]
fn test_forged_argument_count_is_an_internal_error() {
    // Overwrites the argument count slot below the frame with 1000.
    let mut source = Asm::new();
    let a = source.local(0, "a");
    let mark = source.begin("forged", vec![a.clone()], 0, &[]);
    source.code().emit_pop(1);
    source.int(1000);
    source.code().emit_args(&[a.clone()]);
    source.ret(0);
    let entry = source.end(mark);
    let f = source.function(entry);
    let bytes = source.lua.dump(&f).unwrap();
    let err = source.call_value(&f, vec![]).unwrap_err();
    assert!(matches!(err, tarn::LuaError::Internal(_)), "{err:?}");
    assert_eq!(source.lua.call_depth(), 0);
    assert_eq!(source.lua.stack_len(), 0);

    let mut target = Asm::new();
    let g = target.lua.undump(&bytes).unwrap();
    let err = target.call_value(&g, vec![]).unwrap_err();
    assert!(matches!(err, tarn::LuaError::Internal(_)), "{err:?}");
}
