// Tests for coroutines, through the embedding API and the coroutine library
use super::{Asm, new_vm, run, string_at};
use crate::*;
use OpCode::*;

/// R[reg] = coroutine.<name>
fn co_fn(asm: &mut Asm, reg: u32, name: &str) {
    let lib = asm.ks("coroutine");
    asm.abx(GetGlobal, reg, lib);
    let key = asm.rks(name);
    asm.abc(GetTable, reg, reg, key);
}

/// function(a) local b = coroutine.yield(a + 1); return b * 10 end
fn yield_then_return() -> ChunkData {
    let mut f = Asm::function(3, 1);
    co_fn(&mut f, 1, "yield");
    let one = f.rkn(1.0);
    f.abc(Add, 2, 0, one);
    f.abc(Call, 1, 2, 2);
    let ten = f.rkn(10.0);
    f.abc(Mul, 1, 1, ten);
    f.abc(Return, 1, 2, 0);
    f.build()
}

#[test]
fn test_resume_and_yield_through_the_api() {
    let mut vm = new_vm();
    let main = vm.main_thread();
    let co = vm.new_thread().unwrap();
    assert_eq!(vm.load_prototype(&yield_then_return()), LuaStatus::Ok);
    vm.xmove(main, co, 1);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Suspended);

    vm.push_integer(5);
    vm.xmove(main, co, 1);
    assert_eq!(vm.resume(co, 1), LuaStatus::Yield);
    assert_eq!(vm.thread_top(co), 1);
    vm.xmove(co, main, 1);
    assert_eq!(vm.to_integer(-1), Some(6));
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Suspended);

    vm.push_integer(7);
    vm.xmove(main, co, 1);
    assert_eq!(vm.resume(co, 1), LuaStatus::Ok);
    assert_eq!(vm.thread_top(co), 1);
    vm.xmove(co, main, 1);
    assert_eq!(vm.to_integer(-1), Some(70));
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);

    assert_eq!(vm.resume(co, 0), LuaStatus::ErrRun);
    vm.xmove(co, main, 1);
    assert_eq!(string_at(&mut vm, -1), "cannot resume non-suspended coroutine");
}

/// function() coroutine.yield(1); coroutine.yield(2) end
fn two_yields() -> ChunkData {
    let mut f = Asm::function(2, 0);
    for n in [1.0, 2.0] {
        co_fn(&mut f, 0, "yield");
        let k = f.kn(n);
        f.abx(LoadK, 1, k);
        f.abc(Call, 0, 2, 1);
    }
    f.abc(Return, 0, 1, 0);
    f.build()
}

#[test]
fn test_wrap_resumes_until_dead() {
    let mut vm = new_vm();
    // return coroutine.wrap(function() ... end)
    let mut main = Asm::new(2);
    let body = main.child(two_yields());
    co_fn(&mut main, 0, "wrap");
    main.abx(Closure, 1, body);
    main.abc(Call, 0, 2, 2);
    main.abc(Return, 0, 2, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    let generator = vm.get_top();

    for expected in [1, 2] {
        vm.push_value(generator);
        vm.call(0, 1).unwrap();
        assert_eq!(vm.to_integer(-1), Some(expected));
        vm.pop(1);
    }
    // the body returns normally
    vm.push_value(generator);
    vm.call(0, 0).unwrap();

    vm.push_value(generator);
    assert_eq!(vm.pcall(0, 0, 0), LuaStatus::ErrRun);
    assert_eq!(string_at(&mut vm, -1), "cannot resume dead coroutine");
}

#[test]
fn test_yield_across_pcall_is_refused() {
    let mut vm = new_vm();
    // co = coroutine.create(function() return pcall(coroutine.yield, 1) end)
    // return coroutine.resume(co)
    let mut body = Asm::function(3, 0);
    let pcall = body.ks("pcall");
    body.abx(GetGlobal, 0, pcall);
    co_fn(&mut body, 1, "yield");
    let one = body.kn(1.0);
    body.abx(LoadK, 2, one);
    body.abc(Call, 0, 3, 0);
    body.abc(Return, 0, 0, 0);

    let mut main = Asm::new(3);
    let p = main.child(body.build());
    co_fn(&mut main, 0, "resume");
    co_fn(&mut main, 1, "create");
    main.abx(Closure, 2, p);
    main.abc(Call, 1, 2, 2);
    main.abc(Call, 0, 2, 0);
    main.abc(Return, 0, 0, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert_eq!(vm.get_top(), 3);
    assert!(vm.to_boolean(1));
    assert!(!vm.to_boolean(2));
    assert_eq!(string_at(&mut vm, 3), "attempt to yield across metamethod/C-call boundary");
}

#[test]
fn test_yield_outside_a_coroutine() {
    let mut vm = new_vm();
    let mut main = Asm::new(2);
    co_fn(&mut main, 0, "yield");
    main.abc(Call, 0, 1, 1);
    main.abc(Return, 0, 1, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::ErrRun);
    assert_eq!(string_at(&mut vm, -1), "attempt to yield from outside a coroutine");
}

#[test]
fn test_status_as_seen_from_inside() {
    let mut vm = new_vm();
    // inner: function(a) return coroutine.status(a) end
    let mut inner = Asm::function(3, 1);
    co_fn(&mut inner, 1, "status");
    inner.abc(Move, 2, 0, 0);
    inner.abc(Call, 1, 2, 2);
    inner.abc(Return, 1, 2, 0);
    // outer: function()
    //   return coroutine.status(coroutine.running()),
    //          coroutine.resume(coroutine.create(inner), coroutine.running())
    // end
    let mut outer = Asm::function(5, 0);
    let p = outer.child(inner.build());
    co_fn(&mut outer, 0, "status");
    co_fn(&mut outer, 1, "running");
    outer.abc(Call, 1, 1, 2);
    outer.abc(Call, 0, 2, 2);
    co_fn(&mut outer, 1, "resume");
    co_fn(&mut outer, 2, "create");
    outer.abx(Closure, 3, p);
    outer.abc(Call, 2, 2, 2);
    co_fn(&mut outer, 3, "running");
    outer.abc(Call, 3, 1, 2);
    outer.abc(Call, 1, 3, 0);
    outer.abc(Return, 0, 0, 0);

    let mut main = Asm::new(3);
    let p = main.child(outer.build());
    co_fn(&mut main, 0, "resume");
    co_fn(&mut main, 1, "create");
    main.abx(Closure, 2, p);
    main.abc(Call, 1, 2, 2);
    main.abc(Call, 0, 2, 0);
    main.abc(Return, 0, 0, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert_eq!(vm.get_top(), 4);
    assert!(vm.to_boolean(1));
    assert_eq!(string_at(&mut vm, 2), "running");
    assert!(vm.to_boolean(3));
    assert_eq!(string_at(&mut vm, 4), "normal");
}

#[test]
fn test_running_is_nil_in_the_main_thread() {
    let mut vm = new_vm();
    let mut main = Asm::new(1);
    co_fn(&mut main, 0, "running");
    main.abc(Call, 0, 1, 2);
    main.abc(Return, 0, 2, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert!(vm.is_none_or_nil(-1));
    assert_eq!(vm.get_top(), 1);
}

#[test]
fn test_error_kills_the_coroutine() {
    let mut vm = new_vm();
    // function() error("oops") end
    let mut body = Asm::new(2);
    let error = body.ks("error");
    body.abx(GetGlobal, 0, error);
    let msg = body.ks("oops");
    body.abx(LoadK, 1, msg);
    body.abc(Call, 0, 2, 1);
    body.abc(Return, 0, 1, 0);

    let main = vm.main_thread();
    let co = vm.new_thread().unwrap();
    assert_eq!(vm.load_prototype(&body.build()), LuaStatus::Ok);
    vm.xmove(main, co, 1);
    assert_eq!(vm.resume(co, 0), LuaStatus::ErrRun);
    assert_eq!(vm.status(co), LuaStatus::ErrRun);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);
    vm.xmove(co, main, 1);
    assert_eq!(string_at(&mut vm, -1), "test.lua:3: oops");
}

#[test]
fn test_resume_requires_a_coroutine() {
    let mut vm = new_vm();
    let mut main = Asm::new(2);
    co_fn(&mut main, 0, "resume");
    let k = main.kn(1.0);
    main.abx(LoadK, 1, k);
    main.abc(Call, 0, 2, 1);
    main.abc(Return, 0, 1, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::ErrRun);
    assert_eq!(
        string_at(&mut vm, -1),
        "test.lua:4: bad argument #1 to 'resume' (coroutine expected)"
    );
}

#[test]
fn test_resume_checks_room_for_arguments() {
    let mut vm = LuaVM::new(SafeOption {
        max_stack_size: 1000,
        ..SafeOption::default()
    });
    vm.open_stdlib(Stdlib::All).unwrap();
    let main = vm.main_thread();
    let co = vm.new_thread().unwrap();
    assert_eq!(vm.load_prototype(&two_yields()), LuaStatus::Ok);
    vm.xmove(main, co, 1);
    // most of the coroutine's stack is already taken
    assert!(vm.check_stack(600));
    for i in 0..600 {
        vm.push_integer(i);
    }
    vm.xmove(main, co, 600);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Suspended);

    vm.get_global("coroutine").unwrap();
    vm.get_field(-1, "resume").unwrap();
    vm.push_value(1);
    assert!(vm.check_stack(500));
    for i in 0..500 {
        vm.push_integer(i);
    }
    assert_eq!(vm.pcall(501, 0, 0), LuaStatus::ErrRun);
    assert!(string_at(&mut vm, -1).ends_with("too many arguments to resume"));
    assert_eq!(vm.thread_top(co), 601);
}
