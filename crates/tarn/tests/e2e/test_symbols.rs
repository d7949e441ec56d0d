use super::helpers::*;
use proptest::prelude::*;
use tarn::Value;

#[derive(Clone, Debug)]
enum Lit {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

fn lit() -> impl Strategy<Value = Lit> {
    prop_oneof![
        any::<i64>().prop_map(Lit::Int),
        proptest::num::f64::NORMAL.prop_map(Lit::Float),
        "[a-z_]{0,12}".prop_map(Lit::Str),
        any::<bool>().prop_map(Lit::Bool),
    ]
}

fn to_value(asm: &mut Asm, lit: &Lit) -> Value {
    match lit {
        Lit::Int(i) => Value::integer(*i),
        Lit::Float(f) => Value::float(*f),
        Lit::Str(s) => asm.str(s),
        Lit::Bool(b) => Value::Boolean(*b),
    }
}

fn same(a: &Value, b: &Value) -> bool {
    a.raw_equals(b) && a.type_name() == b.type_name() && {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => x.is_integer() == y.is_integer(),
            _ => true,
        }
    }
}

/// `local x = v; g = x; return (function() return x end)(), x, g`
fn store_and_reload(asm: &mut Asm, v: Value) -> Vec<Value> {
    let x = asm.local(0, "x");
    let g = asm.global("g");
    let mark = asm.begin("main", vec![x.clone()], 0, &[]);
    asm.lit(v);
    asm.store(&x);
    asm.load(&x);
    asm.store(&g);

    let reader = asm.begin("reader", vec![], 0, &[]);
    let captured = asm.upvalue(0, "x");
    asm.load(&captured);
    asm.ret(1);
    let reader = asm.end(reader);
    asm.code().emit_closure(&[x.clone()], reader as i32);
    asm.call(0, "reader");

    asm.load(&x);
    asm.load(&g);
    asm.code().emit_mk_tuple(3);
    asm.ret(1);
    let entry = asm.end(mark);
    let f = asm.function(entry);
    asm.call_value(&f, vec![]).unwrap()
}

proptest! {
    #[test]
    fn prop_store_then_load_returns_the_value(l in lit()) {
        let mut asm = Asm::new();
        let v = to_value(&mut asm, &l);
        let out = store_and_reload(&mut asm, v.clone());
        prop_assert_eq!(out.len(), 3);
        for got in &out {
            prop_assert!(same(got, &v), "{:?} != {:?}", got, v);
        }
    }
}

#[test]
fn test_upvalue_store_is_seen_by_the_enclosing_function() {
    // local x = 1; (function() x = 7 end)(); return x
    let mut asm = Asm::new();
    let x = asm.local(0, "x");
    let mark = asm.begin("main", vec![x.clone()], 0, &[]);
    asm.int(1);
    asm.store(&x);
    let writer = asm.begin("writer", vec![], 0, &[]);
    let captured = asm.upvalue(0, "x");
    asm.int(7);
    asm.store(&captured);
    let writer = asm.end(writer);
    asm.code().emit_closure(&[x.clone()], writer as i32);
    asm.call(0, "writer");
    asm.code().emit_pop(1);
    asm.load(&x);
    asm.ret(1);
    let entry = asm.end(mark);
    let f = asm.function(entry);
    assert_eq!(ints(&asm.call_value(&f, vec![]).unwrap()), vec![7]);
}

#[test]
fn test_global_store_goes_through_newindex() {
    // With __newindex on the globals, `g = 5` is redirected.
    let mut asm = Asm::new();
    let sink = asm.lua.new_table();
    let mt = asm.lua.new_table().as_table().unwrap();
    asm.lua.set_field(mt, "__newindex", sink.clone());
    let g = asm.global("fresh");
    let mark = asm.begin("main", vec![], 0, &[]);
    asm.int(5);
    asm.store(&g);
    let entry = asm.end(mark);
    let globals = asm.lua.globals;
    asm.lua.heap.tables[globals].metatable = Some(mt);
    asm.lua.run(entry).unwrap();
    assert!(asm.lua.get_global("fresh").is_nil());
    let key = asm.lua.strings.find(b"fresh").unwrap();
    let stored = asm.lua.heap.tables[sink.as_table().unwrap()].raw_get_str(key);
    assert_eq!(stored.as_integer(), Some(5));
}
