use super::helpers::*;
use tarn::{LuaError, NativeContext, OpCode, Value};

/// function(a) local r = coroutine.yield(a + 1); return r * 2 end
fn yield_once(asm: &mut Asm) -> Value {
    let a = asm.local(0, "a");
    let r = asm.local(1, "r");
    let co = asm.global("coroutine");
    let mark = asm.begin("body", vec![a.clone(), r.clone()], 1, &[a.clone()]);
    asm.load(&co);
    asm.field("yield");
    asm.load(&a);
    asm.int(1);
    asm.op(OpCode::Add);
    asm.call(1, "yield");
    asm.store(&r);
    asm.load(&r);
    asm.int(2);
    asm.op(OpCode::Mul);
    asm.ret(1);
    let entry = asm.end(mark);
    asm.function(entry)
}

fn status(asm: &mut Asm, co: &Value) -> String {
    let status = asm.global_fn("coroutine.status");
    let out = asm.call_value(&status, vec![co.clone()]).unwrap();
    asm.text(&out[0])
}

#[test]
fn test_resume_yield_and_finish() {
    let mut asm = Asm::new();
    let body = yield_once(&mut asm);
    let create = asm.global_fn("coroutine.create");
    let resume = asm.global_fn("coroutine.resume");
    let co = asm.call_value(&create, vec![body]).unwrap().remove(0);
    assert_eq!(co.type_name(), "thread");
    assert_eq!(status(&mut asm, &co), "suspended");

    let out = asm
        .call_value(&resume, vec![co.clone(), Value::integer(1)])
        .unwrap();
    assert!(matches!(out[0], Value::Boolean(true)));
    assert_eq!(ints(&out[1..]), vec![2]);
    assert_eq!(status(&mut asm, &co), "suspended");

    let out = asm
        .call_value(&resume, vec![co.clone(), Value::integer(10)])
        .unwrap();
    assert!(matches!(out[0], Value::Boolean(true)));
    assert_eq!(ints(&out[1..]), vec![20]);
    assert_eq!(status(&mut asm, &co), "dead");

    let out = asm.call_value(&resume, vec![co.clone()]).unwrap();
    assert!(matches!(out[0], Value::Boolean(false)));
    assert_eq!(asm.text(&out[1]), "cannot resume dead coroutine");
}

#[test]
fn test_wrap_resumes_on_call() {
    let mut asm = Asm::new();
    let body = yield_once(&mut asm);
    let wrap = asm.global_fn("coroutine.wrap");
    let gen = asm.call_value(&wrap, vec![body]).unwrap().remove(0);
    let out = asm.call_value(&gen, vec![Value::integer(4)]).unwrap();
    assert_eq!(ints(&out), vec![5]);
    let out = asm.call_value(&gen, vec![Value::integer(3)]).unwrap();
    assert_eq!(ints(&out), vec![6]);
    let err = asm.call_value(&gen, vec![]).unwrap_err();
    assert_eq!(err.to_string(), "cannot resume dead coroutine");
}

/// Records `coroutine.status` of its argument as a global, from inside a
/// running coroutine.
fn observe(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let co = ctx.check_thread(0)?;
    let state = ctx.vm.coroutine_status(co)?;
    let (_, is_main) = ctx.vm.running();
    let text = format!("{}:{}", state.name(), ctx.vm.is_yieldable());
    let v = ctx.string_value(&text);
    ctx.vm.set_global("seen", v);
    Ok(Value::Boolean(is_main))
}

#[test]
fn test_status_while_running() {
    // function() return observe(coroutine.running()) end
    let mut asm = Asm::new();
    asm.register("observe", observe);
    let observe = asm.global("observe");
    let co_lib = asm.global("coroutine");
    let mark = asm.begin("body", vec![], 0, &[]);
    asm.load(&observe);
    asm.load(&co_lib);
    asm.field("running");
    asm.call(0, "running");
    asm.call(1, "observe");
    asm.ret(1);
    let entry = asm.end(mark);
    let body = asm.function(entry);
    let create = asm.global_fn("coroutine.create");
    let resume = asm.global_fn("coroutine.resume");
    let co = asm.call_value(&create, vec![body]).unwrap().remove(0);
    let out = asm.call_value(&resume, vec![co.clone()]).unwrap();
    assert!(matches!(out[0], Value::Boolean(true)));
    // Not the main thread.
    assert!(matches!(out[1], Value::Boolean(false)));
    let seen = asm.lua.get_global("seen");
    assert_eq!(asm.text(&seen), "running:true");
    assert_eq!(status(&mut asm, &co), "dead");
}

fn call_back(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let f = ctx.check_function(0)?;
    ctx.vm.call(f, vec![])
}

#[test]
fn test_yield_across_a_host_call_fails() {
    // body: call_back(function() coroutine.yield(1) end)
    let mut asm = Asm::new();
    asm.register("call_back", call_back);
    let co_lib = asm.global("coroutine");
    let yielder = asm.begin("yielder", vec![], 0, &[]);
    asm.load(&co_lib);
    asm.field("yield");
    asm.int(1);
    asm.call(1, "yield");
    asm.ret(1);
    let yielder = asm.end(yielder);

    let env = asm.env();
    let cb = asm.global("call_back");
    let mark = asm.begin("body", vec![], 0, &[]);
    asm.load(&cb);
    asm.code().emit_closure(&[env], yielder as i32);
    asm.call(1, "call_back");
    asm.ret(1);
    let entry = asm.end(mark);
    let body = asm.function(entry);

    let create = asm.global_fn("coroutine.create");
    let resume = asm.global_fn("coroutine.resume");
    let co = asm.call_value(&create, vec![body]).unwrap().remove(0);
    let out = asm.call_value(&resume, vec![co.clone()]).unwrap();
    assert!(matches!(out[0], Value::Boolean(false)));
    let msg = asm.text(&out[1]);
    assert!(
        msg.ends_with("attempt to yield across a C-call boundary"),
        "{msg}"
    );
    assert_eq!(status(&mut asm, &co), "dead");
}

#[test]
fn test_resume_of_running_coroutine_fails() {
    // body: return coroutine.resume(self_thread)
    let mut asm = Asm::new();
    let co_lib = asm.global("coroutine");
    let me = asm.global("me");
    let mark = asm.begin("body", vec![], 0, &[]);
    asm.load(&co_lib);
    asm.field("resume");
    asm.load(&me);
    asm.call(1, "resume");
    asm.ret(1);
    let entry = asm.end(mark);
    let body = asm.function(entry);
    let create = asm.global_fn("coroutine.create");
    let resume = asm.global_fn("coroutine.resume");
    let co = asm.call_value(&create, vec![body]).unwrap().remove(0);
    asm.lua.set_global("me", co.clone());
    let out = asm.call_value(&resume, vec![co]).unwrap();
    // The outer resume succeeds and returns the inner failure.
    assert!(matches!(out[0], Value::Boolean(true)));
    assert!(matches!(out[1], Value::Boolean(false)));
    assert_eq!(asm.text(&out[2]), "cannot resume non-suspended coroutine");
}

#[test]
fn test_close_suspended_coroutine() {
    let mut asm = Asm::new();
    let body = yield_once(&mut asm);
    let create = asm.global_fn("coroutine.create");
    let resume = asm.global_fn("coroutine.resume");
    let close = asm.global_fn("coroutine.close");
    let co = asm.call_value(&create, vec![body]).unwrap().remove(0);
    asm.call_value(&resume, vec![co.clone(), Value::integer(1)])
        .unwrap();
    let out = asm.call_value(&close, vec![co.clone()]).unwrap();
    assert!(matches!(out[0], Value::Boolean(true)));
    assert_eq!(status(&mut asm, &co), "dead");
}

/// function() local x <close> = A; coroutine.yield() end
fn yield_holding_closable(asm: &mut Asm) -> Value {
    let x = asm.tbc(0, "x");
    let a = asm.global("A");
    let co_lib = asm.global("coroutine");
    let mark = asm.begin("body", vec![x.clone()], 0, &[]);
    asm.load(&a);
    asm.store(&x);
    asm.load(&co_lib);
    asm.field("yield");
    asm.call(0, "yield");
    asm.code().emit_pop(1);
    asm.ret(0);
    let entry = asm.end(mark);
    asm.function(entry)
}

#[test]
fn test_close_runs_pending_closers_of_a_suspended_coroutine() {
    let mut asm = Asm::new();
    closables(&mut asm, &["A"]);
    let body = yield_holding_closable(&mut asm);
    let create = asm.global_fn("coroutine.create");
    let resume = asm.global_fn("coroutine.resume");
    let close = asm.global_fn("coroutine.close");
    let co = asm.call_value(&create, vec![body]).unwrap().remove(0);
    let out = asm.call_value(&resume, vec![co.clone()]).unwrap();
    assert!(matches!(out[0], Value::Boolean(true)));
    assert!(close_log(&asm).is_empty());

    let out = asm.call_value(&close, vec![co.clone()]).unwrap();
    assert!(matches!(out[0], Value::Boolean(true)));
    assert_eq!(close_log(&asm), ["A"]);
    assert_eq!(status(&mut asm, &co), "dead");
}

/// `__close` handler that tries to resume the coroutine `me` and logs the
/// outcome.
fn resume_me(ctx: &mut NativeContext<'_>) -> Result<Value, LuaError> {
    let me = ctx.vm.get_global("me");
    let Value::Thread(co) = me else {
        return Err(LuaError::runtime("thread expected"));
    };
    let state = ctx.vm.coroutine_status(co)?.name();
    let outcome = match ctx.vm.resume(co, vec![]) {
        Ok(_) => "resumed".to_string(),
        Err(e) => e.to_string(),
    };
    let entry = ctx.string_value(&format!("{state}/{outcome}"));
    let log = ctx.vm.get_global("log").as_table().unwrap();
    ctx.vm.heap.tables[log].append(entry);
    Ok(Value::Void)
}

#[test]
fn test_closer_cannot_resume_the_coroutine_being_closed() {
    let mut asm = Asm::new();
    closables(&mut asm, &["A"]);
    let closer = asm.lua.register_native("resume_me", resume_me);
    let mt = asm.lua.new_table().as_table().unwrap();
    asm.lua.set_field(mt, "__close", closer);
    let a = asm.lua.get_global("A").as_table().unwrap();
    asm.lua.heap.tables[a].metatable = Some(mt);

    let body = yield_holding_closable(&mut asm);
    let create = asm.global_fn("coroutine.create");
    let resume = asm.global_fn("coroutine.resume");
    let close = asm.global_fn("coroutine.close");
    let co = asm.call_value(&create, vec![body]).unwrap().remove(0);
    asm.lua.set_global("me", co.clone());
    asm.call_value(&resume, vec![co.clone()]).unwrap();

    let out = asm.call_value(&close, vec![co.clone()]).unwrap();
    assert!(matches!(out[0], Value::Boolean(true)));
    assert_eq!(
        close_log(&asm),
        ["running/cannot resume non-suspended coroutine"]
    );
    assert_eq!(status(&mut asm, &co), "dead");
    // The host thread's stacks survived the close.
    assert_eq!(asm.lua.call_depth(), 0);
    assert_eq!(asm.lua.stack_len(), 0);
    let body = yield_once(&mut asm);
    let fresh = asm.call_value(&create, vec![body]).unwrap().remove(0);
    let out = asm
        .call_value(&resume, vec![fresh, Value::integer(1)])
        .unwrap();
    assert_eq!(ints(&out[1..]), vec![2]);
}
