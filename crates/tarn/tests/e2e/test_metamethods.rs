use super::helpers::*;
use tarn::{LuaError, NativeContext, OpCode, Value};

/// `__add` handler reporting which side the table was on: 1 for `t + 5`,
/// 2 for `5 + t`.
fn add_probe(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let side = match (ctx.arg(0), ctx.arg(1)) {
        (Value::Table(_), r) if r.as_integer() == Some(5) => 1,
        (l, Value::Table(_)) if l.as_integer() == Some(5) => 2,
        _ => 0,
    };
    Ok(Value::integer(side))
}

fn always_true(_ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    Ok(Value::Boolean(true))
}

/// A global table `name` whose metatable has `event = handler`.
fn with_meta(asm: &mut Asm, name: &str, event: &str, handler: Value) -> Value {
    let t = asm.lua.new_table();
    let mt = asm.lua.new_table().as_table().unwrap();
    asm.lua.set_field(mt, event, handler);
    asm.lua.heap.tables[t.as_table().unwrap()].metatable = Some(mt);
    asm.lua.set_global(name, t.clone());
    t
}

/// `return <lhs> op <rhs>` where operands are globals or integers.
enum Operand<'a> {
    Global(&'a str),
    Int(i64),
}

fn binary(asm: &mut Asm, lhs: Operand<'_>, op: OpCode, rhs: Operand<'_>) -> usize {
    let mark = asm.begin("main", vec![], 0, &[]);
    for operand in [lhs, rhs] {
        match operand {
            Operand::Global(name) => {
                let g = asm.global(name);
                asm.load(&g);
            }
            Operand::Int(i) => asm.int(i),
        }
    }
    asm.op(op);
    asm.ret(1);
    asm.end(mark)
}

#[test]
fn test_add_passes_operands_in_order() {
    let mut asm = Asm::new();
    let probe = asm.lua.register_native("add_probe", add_probe);
    with_meta(&mut asm, "t", "__add", probe);
    let left = binary(&mut asm, Operand::Global("t"), OpCode::Add, Operand::Int(5));
    let right = binary(&mut asm, Operand::Int(5), OpCode::Add, Operand::Global("t"));
    assert_eq!(asm.lua.run(left).unwrap().as_integer(), Some(1));
    assert_eq!(asm.lua.run(right).unwrap().as_integer(), Some(2));
}

#[test]
fn test_arithmetic_error_names_the_operand_type() {
    let mut asm = Asm::new();
    let t = asm.lua.new_table();
    asm.lua.set_global("t", t);
    let entry = binary(&mut asm, Operand::Int(1), OpCode::Add, Operand::Global("t"));
    let err = asm.lua.run(entry).unwrap_err();
    assert!(
        err.to_string()
            .ends_with("attempt to perform arithmetic on a table value"),
        "{err}"
    );
    let entry = binary(&mut asm, Operand::Global("missing"), OpCode::Mul, Operand::Int(2));
    let err = asm.lua.run(entry).unwrap_err();
    assert!(
        err.to_string()
            .ends_with("attempt to perform arithmetic on a nil value"),
        "{err}"
    );
}

#[test]
fn test_string_operands_are_coerced() {
    let mut asm = Asm::new();
    let ten = asm.str("10");
    asm.lua.set_global("s", ten);
    let entry = binary(&mut asm, Operand::Global("s"), OpCode::Add, Operand::Int(5));
    assert_eq!(asm.lua.run(entry).unwrap().as_integer(), Some(15));
}

#[test]
fn test_index_follows_the_chain() {
    // t1 -> __index t2 -> __index t3 { x = 7 }
    let mut asm = Asm::new();
    let t3 = asm.lua.new_table();
    let seven = Value::integer(7);
    asm.lua.set_field(t3.as_table().unwrap(), "x", seven);
    let t2 = with_meta(&mut asm, "t2", "__index", t3);
    with_meta(&mut asm, "t1", "__index", t2);
    let t1 = asm.global("t1");
    let mark = asm.begin("main", vec![], 0, &[]);
    asm.load(&t1);
    asm.field("x");
    asm.ret(1);
    let entry = asm.end(mark);
    assert_eq!(asm.lua.run(entry).unwrap().as_integer(), Some(7));
}

#[test]
fn test_index_loop_is_detected() {
    let mut asm = Asm::new();
    let t = asm.lua.new_table();
    let mt = asm.lua.new_table().as_table().unwrap();
    asm.lua.set_field(mt, "__index", t.clone());
    asm.lua.heap.tables[t.as_table().unwrap()].metatable = Some(mt);
    asm.lua.set_global("t", t);
    let g = asm.global("t");
    let mark = asm.begin("main", vec![], 0, &[]);
    asm.load(&g);
    asm.field("nope");
    asm.ret(1);
    let entry = asm.end(mark);
    let err = asm.lua.run(entry).unwrap_err();
    assert!(
        err.to_string()
            .ends_with("'__index' chain too long; possible loop"),
        "{err}"
    );
}

#[test]
fn test_index_of_nil_names_the_field() {
    let mut asm = Asm::new();
    let g = asm.global("nothing");
    let mark = asm.begin("main", vec![], 0, &[]);
    asm.load(&g);
    asm.field("x");
    asm.ret(1);
    let entry = asm.end(mark);
    let err = asm.lua.run(entry).unwrap_err();
    assert!(
        err.to_string()
            .ends_with("attempt to index a nil value (field 'x')"),
        "{err}"
    );
}

#[test]
fn test_less_equal_falls_back_to_negated_less_than() {
    // Only __lt is defined: a <= b is evaluated as not (b < a).
    let mut asm = Asm::new();
    let lt = asm.lua.register_native("always_true", always_true);
    let a = with_meta(&mut asm, "a", "__lt", lt);
    let mt = asm.lua.heap.tables[a.as_table().unwrap()].metatable;
    let b = asm.lua.new_table();
    asm.lua.heap.tables[b.as_table().unwrap()].metatable = mt;
    asm.lua.set_global("b", b);
    let le = binary(&mut asm, Operand::Global("a"), OpCode::LessEq, Operand::Global("b"));
    let lt = binary(&mut asm, Operand::Global("a"), OpCode::Less, Operand::Global("b"));
    assert!(matches!(asm.lua.run(le).unwrap(), Value::Boolean(false)));
    assert!(matches!(asm.lua.run(lt).unwrap(), Value::Boolean(true)));
}

#[test]
fn test_comparing_unrelated_types_fails() {
    let mut asm = Asm::new();
    let t = asm.lua.new_table();
    asm.lua.set_global("t", t);
    let entry = binary(&mut asm, Operand::Int(1), OpCode::Less, Operand::Global("t"));
    let err = asm.lua.run(entry).unwrap_err();
    assert!(
        err.to_string().ends_with("attempt to compare number with table"),
        "{err}"
    );
}

#[test]
fn test_eq_calls_handler_for_distinct_tables() {
    let mut asm = Asm::new();
    let eq = asm.lua.register_native("always_true", always_true);
    let a = with_meta(&mut asm, "a", "__eq", eq);
    let mt = asm.lua.heap.tables[a.as_table().unwrap()].metatable;
    let b = asm.lua.new_table();
    asm.lua.heap.tables[b.as_table().unwrap()].metatable = mt;
    asm.lua.set_global("b", b);
    let entry = binary(&mut asm, Operand::Global("a"), OpCode::Eq, Operand::Global("b"));
    assert!(matches!(asm.lua.run(entry).unwrap(), Value::Boolean(true)));
}

fn call_probe(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    // self first, then the call arguments
    let is_table = matches!(ctx.arg(0), Value::Table(_));
    let n = ctx.check_integer(1)?;
    Ok(Value::integer(if is_table { n * 10 } else { -1 }))
}

#[test]
fn test_call_metamethod_receives_the_table_first() {
    let mut asm = Asm::new();
    let probe = asm.lua.register_native("call_probe", call_probe);
    with_meta(&mut asm, "callable", "__call", probe);
    let g = asm.global("callable");
    let mark = asm.begin("main", vec![], 0, &[]);
    asm.load(&g);
    asm.int(4);
    asm.call(1, "callable");
    asm.ret(1);
    let entry = asm.end(mark);
    assert_eq!(asm.lua.run(entry).unwrap().as_integer(), Some(40));
}

#[test]
fn test_concat_and_len() {
    let mut asm = Asm::new();
    let mark = asm.begin("main", vec![], 0, &[]);
    asm.lit_str("ab");
    asm.int(12);
    asm.op(OpCode::Concat);
    asm.op(OpCode::Len);
    asm.ret(1);
    let entry = asm.end(mark);
    assert_eq!(asm.lua.run(entry).unwrap().as_integer(), Some(4));
}
