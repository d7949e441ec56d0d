use super::helpers::*;
use tarn::{OpCode, Value};

/// local sum = 0; for i = start, stop, step do sum = sum + i end; return sum
fn numeric_for(asm: &mut Asm, start: Value, stop: Value, step: Value) -> usize {
    let sum = asm.local(0, "sum");
    let i = asm.local(1, "i");
    let body = block(1, 1, vec![]);
    let mark = asm.begin("main", vec![sum.clone(), i.clone()], 0, &[]);
    asm.int(0);
    asm.store(&sum);
    asm.lit(stop);
    asm.code().emit_to_num(1);
    asm.lit(step);
    asm.code().emit_to_num(2);
    asm.lit(start);
    asm.code().emit_to_num(0);
    let top = asm.code().next_index();
    let exit = asm.code().emit_jfor(-1);
    asm.code().emit_enter(&body);
    asm.code().emit_store(&i, 0, 0).unwrap();
    asm.load(&sum);
    asm.load(&i);
    asm.op(OpCode::Add);
    asm.store(&sum);
    asm.code().emit_leave(&body);
    asm.code().emit_incr(1);
    asm.code().emit_jump(OpCode::Jump, top as i32);
    asm.here(exit);
    asm.code().emit_pop(3);
    asm.load(&sum);
    asm.ret(1);
    asm.end(mark)
}

#[test]
fn test_numeric_for_counts_up_and_down() {
    let mut asm = Asm::new();
    let up = numeric_for(&mut asm, Value::integer(1), Value::integer(10), Value::integer(1));
    let down = numeric_for(&mut asm, Value::integer(10), Value::integer(1), Value::integer(-3));
    let empty = numeric_for(&mut asm, Value::integer(5), Value::integer(1), Value::integer(1));
    assert_eq!(asm.lua.run(up).unwrap().as_integer(), Some(55));
    // 10 + 7 + 4 + 1
    assert_eq!(asm.lua.run(down).unwrap().as_integer(), Some(22));
    assert_eq!(asm.lua.run(empty).unwrap().as_integer(), Some(0));
}

#[test]
fn test_numeric_for_with_float_step() {
    let mut asm = Asm::new();
    let entry = numeric_for(&mut asm, Value::integer(0), Value::integer(1), Value::float(0.5));
    let out = asm.lua.run(entry).unwrap();
    // 0 + 0.5 + 1.0
    assert_eq!(out.as_number().map(|n| n.as_f64()), Some(1.5));
}

#[test]
fn test_numeric_for_rejects_non_numbers() {
    let mut asm = Asm::new();
    let limit = asm.str("x");
    let entry = numeric_for(&mut asm, Value::integer(1), limit, Value::integer(1));
    let err = asm.lua.run(entry).unwrap_err();
    assert!(
        err.to_string().ends_with("'for' limit must be a number"),
        "{err}"
    );
}

/// local sum = 0; for k, v in <explist> do sum = sum + v end; return sum
fn generic_for(asm: &mut Asm, explist: &[&str]) -> usize {
    let sum = asm.local(0, "sum");
    let k = asm.local(1, "k");
    let v = asm.local(2, "v");
    let body = block(1, 2, vec![]);
    let exprs: Vec<_> = explist.iter().map(|name| asm.global(name)).collect();
    let mark = asm.begin("main", vec![sum.clone(), k.clone(), v.clone()], 0, &[]);
    asm.int(0);
    asm.store(&sum);
    for e in &exprs {
        asm.load(e);
    }
    if exprs.len() > 1 {
        asm.code().emit_mk_tuple(exprs.len() as i32);
    }
    asm.code().emit_iter_prep();
    let top = asm.code().next_index();
    asm.code().emit_enter(&body);
    asm.code().emit_exp_tuple(0);
    asm.call(2, "for..in");
    asm.code().emit_store(&k, 0, 0).unwrap();
    asm.code().emit_store(&v, 0, 1).unwrap();
    asm.code().emit_pop(1);
    asm.load(&k);
    asm.code().emit_iter_upd();
    let done = asm.jump(OpCode::JNil);
    asm.load(&sum);
    asm.load(&v);
    asm.op(OpCode::Add);
    asm.store(&sum);
    asm.code().emit_leave(&body);
    asm.code().emit_jump(OpCode::Jump, top as i32);
    asm.here(done);
    asm.code().emit_leave(&body);
    asm.code().emit_pop(1);
    asm.load(&sum);
    asm.ret(1);
    asm.end(mark)
}

#[test]
fn test_generic_for_over_a_plain_table() {
    let mut asm = Asm::new();
    let t = asm.lua.new_table();
    let idx = t.as_table().unwrap();
    for (i, v) in [10, 20, 30].into_iter().enumerate() {
        asm.lua.heap.tables[idx].raw_seti(i as i64 + 1, Value::integer(v));
    }
    asm.lua.set_global("items", t);
    let entry = generic_for(&mut asm, &["items"]);
    assert_eq!(asm.lua.run(entry).unwrap().as_integer(), Some(60));
}

#[test]
fn test_generic_for_with_explicit_next() {
    // for k, v in next, items do ... end
    let mut asm = Asm::new();
    let t = asm.lua.new_table();
    let idx = t.as_table().unwrap();
    asm.lua.heap.tables[idx].raw_seti(1, Value::integer(4));
    asm.lua.heap.tables[idx].raw_seti(2, Value::integer(5));
    asm.lua.set_global("items", t);
    let entry = generic_for(&mut asm, &["next", "items"]);
    assert_eq!(asm.lua.run(entry).unwrap().as_integer(), Some(9));
}
