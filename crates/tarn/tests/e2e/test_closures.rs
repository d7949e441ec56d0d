use super::helpers::*;
use tarn::{OpCode, Value};

/// function make()
///   local x = 0
///   local function inc() x = x + 1 end
///   local function get() return x end
///   return inc, get
/// end
fn counter_factory(asm: &mut Asm) -> Value {
    let x = asm.local(0, "x");
    let inc = asm.local(1, "inc");
    let get = asm.local(2, "get");
    let mark = asm.begin("make", vec![x.clone(), inc.clone(), get.clone()], 2, &[]);
    asm.int(0);
    asm.store(&x);

    let inc_fn = asm.begin("inc", vec![], 0, &[]);
    let up = asm.upvalue(0, "x");
    asm.load(&up);
    asm.int(1);
    asm.op(OpCode::Add);
    asm.store(&up);
    let inc_fn = asm.end(inc_fn);
    asm.code().emit_closure(&[x.clone()], inc_fn as i32);
    asm.store(&inc);

    let get_fn = asm.begin("get", vec![], 0, &[]);
    asm.load(&up);
    asm.ret(1);
    let get_fn = asm.end(get_fn);
    asm.code().emit_closure(&[x.clone()], get_fn as i32);
    asm.store(&get);

    asm.load(&inc);
    asm.load(&get);
    asm.code().emit_mk_tuple(2);
    asm.ret(1);
    let entry = asm.end(mark);
    asm.function(entry)
}

fn make_counter(asm: &mut Asm, factory: &Value) -> (Value, Value) {
    let mut out = asm.call_value(factory, vec![]).unwrap();
    let get = out.pop().unwrap();
    let inc = out.pop().unwrap();
    (inc, get)
}

fn read(asm: &mut Asm, get: &Value) -> i64 {
    ints(&asm.call_value(get, vec![]).unwrap())[0]
}

#[test]
fn test_closures_share_a_captured_local() {
    let mut asm = Asm::new();
    let factory = counter_factory(&mut asm);
    let (inc, get) = make_counter(&mut asm, &factory);
    asm.call_value(&inc, vec![]).unwrap();
    asm.call_value(&inc, vec![]).unwrap();
    assert_eq!(read(&mut asm, &get), 2);
}

#[test]
fn test_each_activation_gets_its_own_cell() {
    let mut asm = Asm::new();
    let factory = counter_factory(&mut asm);
    let (inc1, get1) = make_counter(&mut asm, &factory);
    let (_, get2) = make_counter(&mut asm, &factory);
    asm.call_value(&inc1, vec![]).unwrap();
    assert_eq!(read(&mut asm, &get1), 1);
    assert_eq!(read(&mut asm, &get2), 0);
}

#[test]
fn test_upvalue_identity_and_join() {
    let mut asm = Asm::new();
    let factory = counter_factory(&mut asm);
    let (inc1, get1) = make_counter(&mut asm, &factory);
    let (inc2, get2) = make_counter(&mut asm, &factory);
    let upvalueid = asm.global_fn("debug.upvalueid");
    let upvaluejoin = asm.global_fn("debug.upvaluejoin");
    let id = |asm: &mut Asm, f: &Value| {
        asm.call_value(&upvalueid, vec![f.clone(), Value::integer(1)])
            .unwrap()
            .remove(0)
    };
    let (a, b, c) = (id(&mut asm, &inc1), id(&mut asm, &get1), id(&mut asm, &inc2));
    assert!(a.raw_equals(&b));
    assert!(!a.raw_equals(&c));

    // get1 now reads the second counter's cell.
    asm.call_value(
        &upvaluejoin,
        vec![get1.clone(), Value::integer(1), inc2.clone(), Value::integer(1)],
    )
    .unwrap();
    asm.call_value(&inc2, vec![]).unwrap();
    asm.call_value(&inc2, vec![]).unwrap();
    asm.call_value(&inc1, vec![]).unwrap();
    assert_eq!(read(&mut asm, &get1), 2);
    assert_eq!(read(&mut asm, &get2), 2);
    let joined = id(&mut asm, &get1);
    assert!(joined.raw_equals(&c));
}

#[test]
fn test_get_and_set_upvalue() {
    let mut asm = Asm::new();
    let factory = counter_factory(&mut asm);
    let (_, get) = make_counter(&mut asm, &factory);
    let getupvalue = asm.global_fn("debug.getupvalue");
    let setupvalue = asm.global_fn("debug.setupvalue");
    let out = asm
        .call_value(&setupvalue, vec![get.clone(), Value::integer(1), Value::integer(41)])
        .unwrap();
    assert_eq!(asm.text(&out[0]), "x");
    let out = asm
        .call_value(&getupvalue, vec![get.clone(), Value::integer(1)])
        .unwrap();
    assert_eq!(asm.text(&out[0]), "x");
    assert_eq!(out[1].as_integer(), Some(41));
    let out = asm
        .call_value(&getupvalue, vec![get.clone(), Value::integer(2)])
        .unwrap();
    assert!(out.is_empty());
    assert_eq!(read(&mut asm, &get), 41);
}

#[test]
fn test_loop_body_locals_are_fresh_per_iteration() {
    // for i = 1, 3 do local v = i; fns[i] = function() return v end end
    let mut asm = Asm::new();
    let fns = asm.lua.new_table();
    asm.lua.set_global("fns", fns.clone());
    let i = asm.local(0, "i");
    let v = asm.local(1, "v");
    let body = block(0, 1, vec![]);
    let fns_g = asm.global("fns");
    let mark = asm.begin("main", vec![i.clone(), v.clone()], 0, &[]);
    asm.int(3);
    asm.code().emit_to_num(1);
    asm.int(1);
    asm.code().emit_to_num(2);
    asm.int(1);
    asm.code().emit_to_num(0);
    let start = asm.code().next_index();
    let exit = asm.code().emit_jfor(-1);
    asm.code().emit_enter(&body);
    asm.code().emit_store(&i, 0, 0).unwrap();
    asm.load(&i);
    asm.store(&v);
    // fns[i] = closure
    let reader = asm.begin("reader", vec![], 0, &[]);
    let up = asm.upvalue(0, "v");
    asm.load(&up);
    asm.ret(1);
    let reader = asm.end(reader);
    asm.code().emit_closure(&[v.clone()], reader as i32);
    asm.load(&fns_g);
    asm.load(&i);
    asm.code().emit_index_set(0, 0, None, tarn::IndexFlavor::Expr);
    asm.code().emit_pop(1);
    asm.code().emit_leave(&body);
    asm.code().emit_incr(1);
    asm.code().emit_jump(OpCode::Jump, start as i32);
    asm.here(exit);
    asm.code().emit_pop(3);
    let entry = asm.end(mark);
    asm.lua.run(entry).unwrap();

    let t = fns.as_table().unwrap();
    for n in 1..=3 {
        let f = asm.lua.heap.tables[t].raw_geti(n);
        assert_eq!(read(&mut asm, &f), n);
    }
}
