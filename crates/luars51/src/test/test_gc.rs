// Tests for the incremental collector: reachability, weak tables,
// finalizers, memory limits
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Asm, new_vm, run, string_at};
use crate::*;
use OpCode::*;

/// Push a fresh table and return a handle to it.
fn push_table(vm: &mut LuaVM) -> GcRef {
    vm.create_table(0, 0).unwrap();
    vm.index_value(-1).and_then(|v| v.gc_ref()).unwrap()
}

#[test]
fn test_unreachable_objects_are_freed() {
    let mut vm = new_vm();
    let kept = push_table(&mut vm);
    vm.set_global("kept").unwrap();
    let garbage = push_table(&mut vm);
    vm.pop(1);
    let anchored = push_table(&mut vm);

    let before = vm.gc_stats();
    vm.full_gc().unwrap();
    let after = vm.gc_stats();

    assert!(vm.object_pool().contains(kept));
    assert!(vm.object_pool().contains(anchored));
    assert!(!vm.object_pool().contains(garbage));
    assert!(after.cycles > before.cycles);
    assert!(after.objects_freed > before.objects_freed);
}

#[test]
fn test_incremental_steps_keep_reachable_objects() {
    let mut vm = new_vm();
    vm.gc(GcOption::SetPause(100)).unwrap();
    vm.gc(GcOption::SetStepMul(200)).unwrap();
    vm.create_table(0, 0).unwrap();
    for i in 1..=2000 {
        // every insert runs into the write barrier while a cycle is active
        vm.create_table(0, 1).unwrap();
        vm.push_integer(i);
        vm.set_field(-2, "n").unwrap();
        vm.raw_set_i(1, i).unwrap();
        // churn
        vm.create_table(4, 4).unwrap();
        vm.pop(1);
    }
    assert!(vm.gc_stats().steps > 0);
    vm.full_gc().unwrap();
    for i in [1, 500, 2000] {
        vm.raw_get_i(1, i).unwrap();
        vm.get_field(-1, "n").unwrap();
        assert_eq!(vm.to_integer(-1), Some(i));
        vm.pop(2);
    }
    assert_eq!(vm.obj_len(1).unwrap(), 2000);
}

#[test]
fn test_step_reports_cycle_end() {
    let mut vm = new_vm();
    let mut finished = false;
    for _ in 0..10_000 {
        if vm.gc(GcOption::Step(1)).unwrap() == 1 {
            finished = true;
            break;
        }
    }
    assert!(finished);
    assert!(vm.gc(GcOption::Count).unwrap() > 0);
}

/// Push a table whose metatable has `__mode = mode`.
fn push_weak_table(vm: &mut LuaVM, mode: &str) {
    vm.create_table(0, 0).unwrap();
    vm.create_table(0, 1).unwrap();
    vm.push_string(mode).unwrap();
    vm.set_field(-2, "__mode").unwrap();
    vm.set_metatable(-2).unwrap();
}

fn count_entries(vm: &mut LuaVM, idx: i32) -> usize {
    let mut n = 0;
    vm.push_nil();
    while vm.next(idx).unwrap() {
        n += 1;
        vm.pop(1);
    }
    n
}

#[test]
fn test_weak_keys_and_values_are_cleared() {
    let mut vm = new_vm();
    push_weak_table(&mut vm, "k");
    // t[{}] = 1; t["s"] = {}
    vm.create_table(0, 0).unwrap();
    vm.push_integer(1);
    vm.raw_set(1).unwrap();
    vm.push_string("s").unwrap();
    vm.create_table(0, 0).unwrap();
    vm.raw_set(1).unwrap();

    push_weak_table(&mut vm, "v");
    // t[1] = {}; t[2] = "str"; t[3] = <anchored table>
    vm.create_table(0, 0).unwrap();
    vm.raw_set_i(2, 1).unwrap();
    vm.push_string("str").unwrap();
    vm.raw_set_i(2, 2).unwrap();
    vm.create_table(0, 0).unwrap();
    vm.push_value(-1);
    vm.raw_set_i(2, 3).unwrap();

    vm.full_gc().unwrap();
    // the string key survives, the table key does not
    assert_eq!(count_entries(&mut vm, 1), 1);
    // strings are values, not objects, as far as weakness goes
    assert_eq!(count_entries(&mut vm, 2), 2);
    vm.raw_get_i(2, 1).unwrap();
    assert!(vm.is_none_or_nil(-1));
    vm.pop(1);
    vm.raw_get_i(2, 3).unwrap();
    assert!(vm.raw_equal(-1, 3));
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn count_finalizer(vm: &mut LuaVM) -> LuaResult<usize> {
    assert!(vm.is_userdata(1));
    FINALIZED.fetch_add(1, Ordering::SeqCst);
    Ok(0)
}

/// Push a userdata with a counting `__gc`.
fn push_finalized_userdata(vm: &mut LuaVM, handler: CFunction) -> UserdataId {
    let ud = vm.new_userdata(String::from("resource")).unwrap();
    vm.create_table(0, 1).unwrap();
    vm.push_native_function(handler).unwrap();
    vm.set_field(-2, "__gc").unwrap();
    vm.set_metatable(-2).unwrap();
    ud
}

#[test]
fn test_finalizer_runs_once_before_release() {
    let mut vm = new_vm();
    let ud = push_finalized_userdata(&mut vm, count_finalizer);
    assert_eq!(vm.userdata_ref::<String>(ud).map(String::as_str), Some("resource"));
    vm.pop(1);

    vm.full_gc().unwrap();
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    vm.full_gc().unwrap();
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    assert!(!vm.object_pool().contains(ud.gc_ref()));
    assert!(vm.gc_stats().finalizers_run >= 1);
}

static CLOSED: AtomicUsize = AtomicUsize::new(0);

fn close_finalizer(_vm: &mut LuaVM) -> LuaResult<usize> {
    CLOSED.fetch_add(1, Ordering::SeqCst);
    Ok(0)
}

fn failing_finalizer(vm: &mut LuaVM) -> LuaResult<usize> {
    CLOSED.fetch_add(1, Ordering::SeqCst);
    Err(vm.error("finalizer failed"))
}

#[test]
fn test_close_runs_pending_finalizers() {
    let mut vm = new_vm();
    push_finalized_userdata(&mut vm, close_finalizer);
    vm.set_global("live").unwrap();
    push_finalized_userdata(&mut vm, failing_finalizer);
    vm.set_global("broken").unwrap();
    vm.close();
    // a failing finalizer does not stop the others
    assert_eq!(CLOSED.load(Ordering::SeqCst), 2);
}

#[test]
fn test_memory_limit_raises_memory_error() {
    let mut vm = LuaVM::new(SafeOption {
        max_memory_limit: 512 * 1024,
        ..SafeOption::default()
    });
    // local t = {}; for i = 1, 1e9 do t[i] = {} end
    let mut main = Asm::new(6);
    main.abc(NewTable, 0, 0, 0);
    let one = main.kn(1.0);
    let many = main.kn(1e9);
    main.abx(LoadK, 1, one);
    main.abx(LoadK, 2, many);
    main.abx(LoadK, 3, one);
    main.asbx(ForPrep, 1, 2);
    main.abc(NewTable, 5, 0, 0);
    main.abc(SetTable, 0, 4, 5);
    main.asbx(ForLoop, 1, -3);
    main.abc(Return, 0, 1, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::ErrMem);
    assert_eq!(string_at(&mut vm, -1), "not enough memory");

    // the garbage is reclaimable and the VM keeps working
    vm.set_top(0);
    vm.full_gc().unwrap();
    assert!(vm.total_bytes() < 512 * 1024);
    vm.push_string("still alive").unwrap();
    assert_eq!(string_at(&mut vm, -1), "still alive");
}

#[test]
fn test_memory_limit_collects_garbage_before_failing() {
    let mut vm = LuaVM::new(SafeOption {
        max_memory_limit: 512 * 1024,
        ..SafeOption::default()
    });
    // a lazy pacer lets the debt run past the limit
    vm.gc(GcOption::SetPause(400)).unwrap();
    vm.create_table(2000, 0).unwrap();
    for i in 1..=2000 {
        vm.create_table(0, 0).unwrap();
        vm.raw_set_i(-2, i).unwrap();
    }
    vm.set_global("live").unwrap();
    vm.full_gc().unwrap();
    assert!(vm.total_bytes() < 256 * 1024);

    // for i = 1, 100000 do local _ = {} end
    let mut main = Asm::new(5);
    let one = main.kn(1.0);
    let many = main.kn(100_000.0);
    main.abx(LoadK, 0, one);
    main.abx(LoadK, 1, many);
    main.abx(LoadK, 2, one);
    main.asbx(ForPrep, 0, 1);
    main.abc(NewTable, 4, 0, 0);
    main.asbx(ForLoop, 0, -2);
    main.abc(Return, 0, 1, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert!(vm.total_bytes() <= 512 * 1024);

    vm.get_global("live").unwrap();
    assert_eq!(vm.obj_len(-1).unwrap(), 2000);
}

#[test]
fn test_setlist_growth_counts_against_the_memory_limit() {
    let mut vm = LuaVM::new(SafeOption {
        max_memory_limit: 512 * 1024,
        ..SafeOption::default()
    });
    // t = {}; t[49999951] = 1 through a single SETLIST batch
    let mut main = Asm::new(2);
    main.abc(NewTable, 0, 0, 0);
    let one = main.kn(1.0);
    main.abx(LoadK, 1, one);
    main.abc(SetList, 0, 1, 0);
    main.emit(Instruction::from_u32(1_000_000));
    main.abc(Return, 0, 1, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::ErrMem);
    assert_eq!(string_at(&mut vm, -1), "not enough memory");
    assert!(vm.total_bytes() <= 512 * 1024);
}

fn collect_and_count_open_upvalues(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.full_gc()?;
    let open = vm.state().open_upvalues.len();
    vm.push_integer(open as i64);
    Ok(1)
}

#[test]
fn test_open_upvalue_dies_with_its_last_closure() {
    let mut vm = new_vm();
    vm.register("count", collect_and_count_open_upvalues).unwrap();
    // local x; local f = function() return x end; f = count; return f()
    let mut getter = Asm::function(1, 0).upvalues(1);
    getter.abc(GetUpval, 0, 0, 0);
    getter.abc(Return, 0, 2, 0);
    let mut main = Asm::new(3);
    let p = main.child(getter.build());
    main.abc(LoadNil, 0, 0, 0);
    main.abx(Closure, 1, p);
    main.abc(Move, 0, 0, 0);
    let count = main.ks("count");
    main.abx(GetGlobal, 1, count);
    main.abc(Call, 1, 1, 2);
    main.abc(Return, 1, 2, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    // the frame holding `x` was still running, yet the cell was collected
    assert_eq!(vm.to_integer(-1), Some(0));
}

#[test]
fn test_collected_coroutine_closes_its_upvalues() {
    let mut vm = new_vm();
    // function() local x = 42; g = function() return x end; coroutine.yield() end
    let mut getter = Asm::function(1, 0).upvalues(1);
    getter.abc(GetUpval, 0, 0, 0);
    getter.abc(Return, 0, 2, 0);
    let mut body = Asm::function(3, 0);
    let p = body.child(getter.build());
    let answer = body.kn(42.0);
    body.abx(LoadK, 0, answer);
    body.abx(Closure, 1, p);
    body.abc(Move, 0, 0, 0);
    let g = body.ks("g");
    body.abx(SetGlobal, 1, g);
    let lib = body.ks("coroutine");
    body.abx(GetGlobal, 1, lib);
    let name = body.rks("yield");
    body.abc(GetTable, 1, 1, name);
    body.abc(Call, 1, 1, 1);
    body.abc(Return, 0, 1, 0);

    let main = vm.main_thread();
    let co = vm.new_thread().unwrap();
    assert_eq!(vm.load_prototype(&body.build()), LuaStatus::Ok);
    vm.xmove(main, co, 1);
    assert_eq!(vm.resume(co, 0), LuaStatus::Yield);
    vm.set_top(0);

    vm.full_gc().unwrap();
    assert!(!vm.object_pool().contains(co.gc_ref()));
    vm.get_global("g").unwrap();
    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(42));
}

#[test]
fn test_collectgarbage_from_bytecode() {
    let mut vm = new_vm();
    // return collectgarbage("count"), collectgarbage()
    let mut main = Asm::new(4);
    let cg = main.ks("collectgarbage");
    main.abx(GetGlobal, 0, cg);
    let count = main.ks("count");
    main.abx(LoadK, 1, count);
    main.abc(Call, 0, 2, 2);
    main.abx(GetGlobal, 1, cg);
    main.abc(Call, 1, 1, 2);
    main.abc(Return, 0, 3, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    let kib = vm.to_number(1).unwrap();
    assert!(kib > 0.0);
    assert_eq!(vm.to_integer(2), Some(0));
}
