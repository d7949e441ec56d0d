use super::helpers::*;
use tarn::{LuaError, NativeContext, OpCode, Value};

/// local a <close>, b <close>, c <close> = A, B, C  (root block)
fn assign_root(asm: &mut Asm) -> Vec<tarn::SymbolRef> {
    let syms = vec![asm.tbc(0, "a"), asm.tbc(1, "b"), asm.tbc(2, "c")];
    for (sym, global) in syms.iter().zip(["A", "B", "C"]) {
        let g = asm.global(global);
        asm.load(&g);
        asm.store(sym);
    }
    syms
}

#[test]
fn test_close_in_reverse_order_on_return() {
    let mut asm = Asm::new();
    closables(&mut asm, &["A", "B", "C"]);
    let syms = vec![asm.tbc(0, "a"), asm.tbc(1, "b"), asm.tbc(2, "c")];
    let mark = asm.begin("main", syms, 2, &[]);
    assign_root(&mut asm);
    asm.int(1);
    asm.ret(1);
    let entry = asm.end(mark);
    let out = asm.lua.run(entry).unwrap();
    assert_eq!(out.as_integer(), Some(1));
    assert_eq!(close_log(&asm), ["C", "B", "A"]);
}

#[test]
fn test_early_exit_closes_the_block_once() {
    // do local a <close>, b <close>, c <close> = A, B, C; break end
    let mut asm = Asm::new();
    closables(&mut asm, &["A", "B", "C"]);
    let dummy = asm.local(0, "n");
    let a = asm.tbc(1, "a");
    let b = asm.tbc(2, "b");
    let c = asm.tbc(3, "c");
    let inner = block(1, 3, vec![a.clone(), b.clone(), c.clone()]);
    let mark = asm.begin("main", vec![dummy, a.clone(), b.clone(), c.clone()], 0, &[]);
    asm.code().emit_enter(&inner);
    for (sym, global) in [&a, &b, &c].into_iter().zip(["A", "B", "C"]) {
        let g = asm.global(global);
        asm.load(&g);
        asm.store(sym);
    }
    asm.code().emit_exit(&inner);
    let out = asm.jump(OpCode::Jump);
    asm.code().emit_leave(&inner);
    asm.here(out);
    let log = asm.global("log");
    asm.load(&log);
    asm.code().emit_operator(OpCode::Len);
    asm.ret(1);
    let entry = asm.end(mark);
    let out = asm.lua.run(entry).unwrap();
    // Closed at the exit, before the length was taken.
    assert_eq!(out.as_integer(), Some(3));
    assert_eq!(close_log(&asm), ["C", "B", "A"]);
}

#[test]
fn test_error_closes_pending_variables() {
    let mut asm = Asm::new();
    closables(&mut asm, &["A", "B", "C"]);
    let syms = vec![asm.tbc(0, "a"), asm.tbc(1, "b"), asm.tbc(2, "c")];
    let mark = asm.begin("main", syms, 2, &[]);
    assign_root(&mut asm);
    let error = asm.global("error");
    asm.load(&error);
    asm.lit_str("boom");
    asm.int(0);
    asm.call(2, "error");
    asm.ret(1);
    let entry = asm.end(mark);
    let f = asm.function(entry);
    let pcall = asm.global_fn("pcall");
    let out = asm.call_value(&pcall, vec![f]).unwrap();
    assert!(matches!(out[0], Value::Boolean(false)));
    assert_eq!(asm.text(&out[1]), "boom");
    assert_eq!(close_log(&asm), ["C", "B", "A"]);
}

fn failing_close(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let obj = ctx.check_table(0)?;
    let tag = ctx.vm.heap.tables[obj].raw_geti(1);
    let text = ctx.vm.tostring_raw(&tag);
    Err(LuaError::with_value(tag, text, 0))
}

#[test]
fn test_first_closer_error_replaces_the_error() {
    let mut asm = Asm::new();
    closables(&mut asm, &["A", "B"]);
    // B's closer fails; A still gets closed.
    let failing = asm.lua.register_native("failing_close", failing_close);
    let mt = asm.lua.new_table().as_table().unwrap();
    asm.lua.set_field(mt, "__close", failing);
    let b = asm.lua.get_global("B").as_table().unwrap();
    asm.lua.heap.tables[b].metatable = Some(mt);

    let syms = vec![asm.tbc(0, "a"), asm.tbc(1, "b")];
    let mark = asm.begin("main", syms.clone(), 1, &[]);
    for (sym, global) in syms.iter().zip(["A", "B"]) {
        let g = asm.global(global);
        asm.load(&g);
        asm.store(sym);
    }
    let error = asm.global("error");
    asm.load(&error);
    asm.lit_str("original");
    asm.int(0);
    asm.call(2, "error");
    asm.ret(0);
    let entry = asm.end(mark);
    let f = asm.function(entry);
    let pcall = asm.global_fn("pcall");
    let out = asm.call_value(&pcall, vec![f]).unwrap();
    assert!(matches!(out[0], Value::Boolean(false)));
    assert_eq!(asm.text(&out[1]), "B");
    assert_eq!(close_log(&asm), ["A"]);
}

#[test]
fn test_non_closable_value_is_rejected() {
    // local x <close> = 42
    let mut asm = Asm::new();
    let x = asm.tbc(0, "x");
    let mark = asm.begin("main", vec![x.clone()], 0, &[]);
    asm.int(42);
    asm.store(&x);
    let entry = asm.end(mark);
    let err = asm.lua.run(entry).unwrap_err();
    assert!(
        err.to_string()
            .ends_with("variable 'x' got a non-closable value"),
        "{err}"
    );
}

#[test]
fn test_nil_and_false_need_no_closer() {
    let mut asm = Asm::new();
    let x = asm.tbc(0, "x");
    let y = asm.tbc(1, "y");
    let mark = asm.begin("main", vec![x.clone(), y.clone()], 1, &[]);
    asm.lit(Value::Nil);
    asm.store(&x);
    asm.lit(Value::Boolean(false));
    asm.store(&y);
    asm.int(5);
    asm.ret(1);
    let entry = asm.end(mark);
    assert_eq!(asm.lua.run(entry).unwrap().as_integer(), Some(5));
}

/// `__close` handler logging the error it was closed with.
fn record_close_error(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let error = ctx.arg(1);
    let text = ctx.vm.tostring_raw(&error);
    let entry = ctx.string_value(&text);
    let log = ctx.vm.get_global("log").as_table().unwrap();
    ctx.vm.heap.tables[log].append(entry);
    Ok(Value::Void)
}

#[test]
fn test_closer_receives_the_error_in_flight() {
    let mut asm = Asm::new();
    closables(&mut asm, &["A"]);
    let closer = asm.lua.register_native("record_close_error", record_close_error);
    let mt = asm.lua.new_table().as_table().unwrap();
    asm.lua.set_field(mt, "__close", closer);
    let a = asm.lua.get_global("A").as_table().unwrap();
    asm.lua.heap.tables[a].metatable = Some(mt);

    let x = asm.tbc(0, "x");
    let mark = asm.begin("main", vec![x.clone()], 0, &[]);
    let g = asm.global("A");
    asm.load(&g);
    asm.store(&x);
    let error = asm.global("error");
    asm.load(&error);
    asm.lit_str("boom");
    asm.int(0);
    asm.call(2, "error");
    asm.ret(0);
    let entry = asm.end(mark);
    let f = asm.function(entry);
    let pcall = asm.global_fn("pcall");
    let out = asm.call_value(&pcall, vec![f]).unwrap();
    assert!(matches!(out[0], Value::Boolean(false)));
    assert_eq!(close_log(&asm), ["boom"]);
}

#[test]
fn test_closer_receives_nil_on_normal_exit() {
    let mut asm = Asm::new();
    closables(&mut asm, &["A"]);
    let closer = asm.lua.register_native("record_close_error", record_close_error);
    let mt = asm.lua.new_table().as_table().unwrap();
    asm.lua.set_field(mt, "__close", closer);
    let a = asm.lua.get_global("A").as_table().unwrap();
    asm.lua.heap.tables[a].metatable = Some(mt);

    let x = asm.tbc(0, "x");
    let mark = asm.begin("main", vec![x.clone()], 0, &[]);
    let g = asm.global("A");
    asm.load(&g);
    asm.store(&x);
    let entry = asm.end(mark);
    asm.lua.run(entry).unwrap();
    assert_eq!(close_log(&asm), ["nil"]);
}

/// `note(tag)` appends `tag` to the global `log`.
fn note(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let tag = ctx.arg(0);
    let log = ctx.vm.get_global("log").as_table().unwrap();
    ctx.vm.heap.tables[log].append(tag);
    Ok(Value::Void)
}

/// main calls f; f is `local x <close> = A; return g()` and g logs "G".
fn close_around_tail_call(options: tarn::VmOptions) -> Vec<String> {
    let mut asm = Asm::with_options(options);
    closables(&mut asm, &["A"]);
    asm.register("note", note);

    let note_g = asm.global("note");
    let mark = asm.begin("g", vec![], 0, &[]);
    asm.load(&note_g);
    asm.lit_str("G");
    asm.call(1, "note");
    asm.ret(0);
    let g_entry = asm.end(mark);
    let g = asm.function(g_entry);
    asm.lua.set_global("g", g);

    let x = asm.tbc(0, "x");
    let a = asm.global("A");
    let g_sym = asm.global("g");
    let mark = asm.begin("f", vec![x.clone()], 0, &[]);
    asm.load(&a);
    asm.store(&x);
    asm.load(&g_sym);
    asm.call(0, "g");
    asm.ret(1);
    let f_entry = asm.end(mark);
    let f = asm.function(f_entry);
    asm.lua.set_global("f", f);

    let f_sym = asm.global("f");
    let mark = asm.begin("main", vec![], 0, &[]);
    asm.load(&f_sym);
    asm.call(0, "f");
    asm.ret(1);
    let entry = asm.end(mark);
    asm.lua.run(entry).unwrap();
    assert_eq!(asm.lua.call_depth(), 0);
    close_log(&asm)
}

#[test]
fn test_tail_position_call_closes_after_the_callee() {
    let eager = tarn::VmOptions {
        tail_call_threshold: 0,
        ..Default::default()
    };
    assert_eq!(close_around_tail_call(Default::default()), ["G", "A"]);
    assert_eq!(close_around_tail_call(eager), ["G", "A"]);
}
