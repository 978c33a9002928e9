// Tests for error raising, messages, protected calls and message handlers
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Asm, new_vm, run, run_error, string_at};
use crate::lua_vm::lua_limits::LUA_MULTRET;
use crate::*;
use OpCode::*;

/// error("boom") at line 3
fn raise_boom() -> ChunkData {
    let mut main = Asm::new(2);
    let error = main.ks("error");
    main.abx(GetGlobal, 0, error);
    let msg = main.ks("boom");
    main.abx(LoadK, 1, msg);
    main.abc(Call, 0, 2, 1);
    main.abc(Return, 0, 1, 0);
    main.build()
}

#[test]
fn test_error_adds_position() {
    let mut vm = new_vm();
    assert_eq!(run_error(&mut vm, &raise_boom()), "test.lua:3: boom");
}

#[test]
fn test_error_level_zero_and_non_string_values() {
    let mut vm = new_vm();
    // error("plain", 0)
    let mut main = Asm::new(3);
    let error = main.ks("error");
    main.abx(GetGlobal, 0, error);
    let msg = main.ks("plain");
    main.abx(LoadK, 1, msg);
    let zero = main.kn(0.0);
    main.abx(LoadK, 2, zero);
    main.abc(Call, 0, 3, 1);
    main.abc(Return, 0, 1, 0);
    assert_eq!(run_error(&mut vm, &main.build()), "plain");

    // error({}) hands the table through untouched
    let mut main = Asm::new(2);
    let error = main.ks("error");
    main.abx(GetGlobal, 0, error);
    main.abc(NewTable, 1, 0, 0);
    main.abc(Call, 0, 2, 1);
    main.abc(Return, 0, 1, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::ErrRun);
    assert_eq!(vm.type_of(-1), LuaType::Table);
}

#[test]
fn test_error_level_two_blames_the_caller() {
    let mut vm = new_vm();
    // local function f() error("deep", 2) end
    let mut f = Asm::function(3, 0);
    let error = f.ks("error");
    f.abx(GetGlobal, 0, error);
    let msg = f.ks("deep");
    f.abx(LoadK, 1, msg);
    let two = f.kn(2.0);
    f.abx(LoadK, 2, two);
    f.abc(Call, 0, 3, 1);
    f.abc(Return, 0, 1, 0);
    let mut main = Asm::new(1);
    let p = main.child(f.build());
    main.abx(Closure, 0, p);
    main.emit_at(Instruction::abc(Call, 0, 1, 1), 7);
    main.abc(Return, 0, 1, 0);
    assert_eq!(run_error(&mut vm, &main.build()), "test.lua:7: deep");
}

#[test]
fn test_index_error_names_the_local() {
    let mut vm = new_vm();
    // local x; return x.y
    let mut main = Asm::new(2);
    main.abc(LoadNil, 0, 0, 0);
    let key = main.rks("y");
    main.abc(GetTable, 1, 0, key);
    main.abc(Return, 1, 2, 0);
    main.local("x", 1, 3);
    assert_eq!(
        run_error(&mut vm, &main.build()),
        "test.lua:2: attempt to index local 'x' (a nil value)"
    );
}

#[test]
fn test_call_error_names_the_global() {
    let mut vm = new_vm();
    let mut main = Asm::new(1);
    let name = main.ks("undefined_fn");
    main.abx(GetGlobal, 0, name);
    main.abc(Call, 0, 1, 1);
    main.abc(Return, 0, 1, 0);
    assert_eq!(
        run_error(&mut vm, &main.build()),
        "test.lua:2: attempt to call global 'undefined_fn' (a nil value)"
    );
}

#[test]
fn test_field_error_names_the_field() {
    let mut vm = new_vm();
    // local t = {}; t.missing.x = 1
    let mut main = Asm::new(2);
    main.abc(NewTable, 0, 0, 0);
    let missing = main.rks("missing");
    main.abc(GetTable, 1, 0, missing);
    let x = main.rks("x");
    let one = main.rkn(1.0);
    main.abc(SetTable, 1, x, one);
    main.abc(Return, 0, 1, 0);
    assert_eq!(
        run_error(&mut vm, &main.build()),
        "test.lua:3: attempt to index field 'missing' (a nil value)"
    );
}

#[test]
fn test_arithmetic_coercion_and_errors() {
    let mut vm = new_vm();
    // return "10" + 1
    let mut main = Asm::new(1);
    let ten = main.ks("10");
    main.abx(LoadK, 0, ten);
    let one = main.rkn(1.0);
    main.abc(Add, 0, 0, one);
    main.abc(Return, 0, 2, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert_eq!(vm.to_number(-1), Some(11.0));

    // return "abc" + 1
    let mut main = Asm::new(1);
    let abc = main.ks("abc");
    main.abx(LoadK, 0, abc);
    let one = main.rkn(1.0);
    main.abc(Add, 0, 0, one);
    main.abc(Return, 0, 2, 0);
    assert_eq!(
        run_error(&mut vm, &main.build()),
        "test.lua:2: attempt to perform arithmetic on a string value"
    );
}

#[test]
fn test_comparison_errors() {
    let mut vm = new_vm();
    // if 1 < "x" then end
    let mut main = Asm::new(1);
    let one = main.rkn(1.0);
    let x = main.rks("x");
    main.abc(Lt, 0, one, x);
    main.asbx(Jmp, 0, 0);
    main.abc(Return, 0, 1, 0);
    assert_eq!(
        run_error(&mut vm, &main.build()),
        "test.lua:1: attempt to compare number with string"
    );

    // if {} <= {} then end
    let mut main = Asm::new(2);
    main.abc(NewTable, 0, 0, 0);
    main.abc(NewTable, 1, 0, 0);
    main.abc(Le, 0, 0, 1);
    main.asbx(Jmp, 0, 0);
    main.abc(Return, 0, 1, 0);
    assert_eq!(
        run_error(&mut vm, &main.build()),
        "test.lua:3: attempt to compare two table values"
    );
}

#[test]
fn test_concat_error() {
    let mut vm = new_vm();
    // local t = {}; return "a" .. t
    let mut main = Asm::new(3);
    main.abc(NewTable, 0, 0, 0);
    let a = main.ks("a");
    main.abx(LoadK, 1, a);
    main.abc(Move, 2, 0, 0);
    main.abc(Concat, 1, 1, 2);
    main.abc(Return, 1, 2, 0);
    main.local("t", 1, 5);
    assert_eq!(
        run_error(&mut vm, &main.build()),
        "test.lua:4: attempt to concatenate local 't' (a table value)"
    );
}

fn prefix_handler(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.push_string("handled: ")?;
    vm.insert(1);
    vm.concat_top(2)?;
    Ok(1)
}

#[test]
fn test_message_handler_transforms_the_error() {
    let mut vm = new_vm();
    vm.push_native_function(prefix_handler).unwrap();
    assert_eq!(vm.load_prototype(&raise_boom()), LuaStatus::Ok);
    assert_eq!(vm.pcall(0, LUA_MULTRET, 1), LuaStatus::ErrRun);
    assert_eq!(string_at(&mut vm, -1), "handled: test.lua:3: boom");
    // the handler stays in place, the function is replaced by the message
    assert_eq!(vm.get_top(), 2);
}

fn failing_handler(vm: &mut LuaVM) -> LuaResult<usize> {
    Err(vm.error("handler failed"))
}

#[test]
fn test_error_in_message_handler() {
    let mut vm = new_vm();
    vm.push_native_function(failing_handler).unwrap();
    assert_eq!(vm.load_prototype(&raise_boom()), LuaStatus::Ok);
    assert_eq!(vm.pcall(0, 0, 1), LuaStatus::ErrErr);
    assert_eq!(string_at(&mut vm, -1), "error in error handling");
}

#[test]
fn test_pcall_and_xpcall_from_bytecode() {
    let mut vm = new_vm();
    // local function f() error({}) end
    let mut f = Asm::function(2, 0);
    let error = f.ks("error");
    f.abx(GetGlobal, 0, error);
    f.abc(NewTable, 1, 0, 0);
    f.abc(Call, 0, 2, 1);
    f.abc(Return, 0, 1, 0);
    // return xpcall(f, type)
    let mut main = Asm::new(3);
    let p = main.child(f.build());
    let xpcall = main.ks("xpcall");
    main.abx(GetGlobal, 0, xpcall);
    main.abx(Closure, 1, p);
    let ty = main.ks("type");
    main.abx(GetGlobal, 2, ty);
    main.abc(Call, 0, 3, 0);
    main.abc(Return, 0, 0, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert_eq!(vm.get_top(), 2);
    assert!(!vm.to_boolean(1));
    assert_eq!(string_at(&mut vm, 2), "table");

    // return pcall(select, 2, "a", "b")
    let mut main = Asm::new(5);
    let pcall = main.ks("pcall");
    main.abx(GetGlobal, 0, pcall);
    let select = main.ks("select");
    main.abx(GetGlobal, 1, select);
    for (reg, k) in [(3, "a"), (4, "b")] {
        let k = main.ks(k);
        main.abx(LoadK, reg, k);
    }
    let two = main.kn(2.0);
    main.abx(LoadK, 2, two);
    main.abc(Call, 0, 5, 0);
    main.abc(Return, 0, 0, 0);
    vm.set_top(0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert_eq!(vm.get_top(), 2);
    assert!(vm.to_boolean(1));
    assert_eq!(string_at(&mut vm, 2), "b");
}

static PANICKED: AtomicBool = AtomicBool::new(false);

fn record_panic(_vm: &mut LuaVM) {
    PANICKED.store(true, Ordering::SeqCst);
}

#[test]
fn test_panic_handler_runs_for_unprotected_errors() {
    let mut vm = new_vm();
    assert!(vm.set_panic_handler(Some(record_panic)).is_none());
    assert_eq!(vm.load_prototype(&raise_boom()), LuaStatus::Ok);
    let err = vm.call(0, 0).unwrap_err();
    assert_eq!(err, LuaError::Runtime);
    assert!(PANICKED.load(Ordering::SeqCst));
    assert_eq!(vm.get_error_message(err), "test.lua:3: boom");
}

#[test]
fn test_protected_call_restores_the_stack() {
    let mut vm = new_vm();
    vm.push_integer(1);
    vm.push_integer(2);
    assert_eq!(vm.load_prototype(&raise_boom()), LuaStatus::Ok);
    assert_eq!(vm.pcall(0, 0, 0), LuaStatus::ErrRun);
    assert_eq!(vm.get_top(), 3);
    assert_eq!(vm.to_integer(1), Some(1));
    assert_eq!(vm.to_integer(2), Some(2));
    assert_eq!(vm.state().call_stack.len(), 1);
}
