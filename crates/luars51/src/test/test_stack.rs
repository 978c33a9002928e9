// Stack growth: registers, open upvalues and native frames must survive
// reallocation of the value stack
use super::{Asm, new_vm, run, string_at};
use crate::*;
use OpCode::*;

fn grow(vm: &mut LuaVM) -> LuaResult<usize> {
    const N: usize = 10_000;
    if !vm.check_stack(N) {
        return Err(vm.error("cannot grow"));
    }
    for i in 0..N {
        vm.push_integer(i as i64);
    }
    let n = vm.get_top() as i64;
    vm.push_integer(n);
    Ok(1)
}

#[test]
fn test_native_growth_keeps_caller_registers() {
    let mut vm = new_vm();
    vm.register("grow", grow).unwrap();
    // local keep = "keep"; return keep, grow()
    let mut main = Asm::new(2);
    let keep = main.ks("keep");
    main.abx(LoadK, 0, keep);
    let name = main.ks("grow");
    main.abx(GetGlobal, 1, name);
    main.abc(Call, 1, 1, 2);
    main.abc(Return, 0, 3, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert_eq!(string_at(&mut vm, 1), "keep");
    assert_eq!(vm.to_integer(2), Some(10_000));
}

/// function depth(n) if n == 0 then return 0 end return depth(n - 1) + 1 end
/// with a wide frame. Frames overlap: each level starts two slots above its
/// caller and reaches 250 slots up.
fn wide_recursion() -> ChunkData {
    let mut f = Asm::function(250, 1);
    let zero = f.rkn(0.0);
    f.abc(Eq, 0, 0, zero);
    f.asbx(Jmp, 0, 2);
    let k = f.kn(0.0);
    f.abx(LoadK, 1, k);
    f.abc(Return, 1, 2, 0);
    let name = f.ks("depth");
    f.abx(GetGlobal, 1, name);
    let one = f.rkn(1.0);
    f.abc(Sub, 2, 0, one);
    f.abc(Call, 1, 2, 2);
    f.abc(Add, 1, 1, one);
    f.abc(Return, 1, 2, 0);
    f.build()
}

#[test]
fn test_deep_recursion_with_open_upvalue() {
    let mut vm = new_vm();
    // local x = 7
    // local function peek() return x end
    // depth = ...
    // return depth(300), peek()
    let mut peek = Asm::function(1, 0).upvalues(1);
    peek.abc(GetUpval, 0, 0, 0);
    peek.abc(Return, 0, 2, 0);

    let mut main = Asm::new(5);
    let peek = main.child(peek.build());
    let depth = main.child(wide_recursion());
    let seven = main.kn(7.0);
    main.abx(LoadK, 0, seven);
    main.abx(Closure, 1, peek);
    main.abc(Move, 0, 0, 0);
    let name = main.ks("depth");
    main.abx(Closure, 2, depth);
    main.abx(SetGlobal, 2, name);
    main.abx(GetGlobal, 2, name);
    let n = main.kn(300.0);
    main.abx(LoadK, 3, n);
    main.abc(Call, 2, 2, 2);
    main.abc(Move, 3, 1, 0);
    main.abc(Call, 3, 1, 2);
    main.abc(Return, 2, 3, 0);

    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert_eq!(vm.to_integer(1), Some(300));
    assert_eq!(vm.to_integer(2), Some(7));
    // the stack shrinks back once the frames are gone
    vm.set_top(0);
    vm.full_gc().unwrap();
    assert!(vm.state().stack.len() < 300 * 250);
}

#[test]
fn test_check_stack_respects_the_limit() {
    let mut vm = LuaVM::new(SafeOption {
        max_stack_size: 1000,
        ..SafeOption::default()
    });
    assert!(vm.check_stack(100));
    assert!(!vm.check_stack(5000));
    // a failed request leaves the stack usable
    vm.push_integer(1);
    assert_eq!(vm.get_top(), 1);
}

#[test]
fn test_lua_stack_overflow_at_the_slot_limit() {
    let mut vm = LuaVM::new(SafeOption {
        max_stack_size: 5_000,
        ..SafeOption::default()
    });
    let mut main = Asm::new(2);
    let depth = main.child(wide_recursion());
    let name = main.ks("depth");
    main.abx(Closure, 0, depth);
    main.abx(SetGlobal, 0, name);
    main.abx(GetGlobal, 0, name);
    // 3000 levels need about 2 * 3000 + 250 slots
    let n = main.kn(3000.0);
    main.abx(LoadK, 1, n);
    main.abc(Call, 0, 2, 2);
    main.abc(Return, 0, 2, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::ErrRun);
    assert!(string_at(&mut vm, -1).ends_with("stack overflow"));
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "push without check_stack")]
fn test_push_beyond_the_limit_breaks_the_api_contract() {
    let mut vm = LuaVM::new(SafeOption {
        max_stack_size: 100,
        ..SafeOption::default()
    });
    for i in 0..1000 {
        vm.push_integer(i);
    }
}
