// Base library functions called directly from the host
use super::{new_vm, string_at};
use crate::lua_vm::lua_limits::LUA_MULTRET;
use crate::*;

/// Call global `name` with the arguments `args` pushes, leaving only the
/// results (or the error value) on the stack.
fn call(vm: &mut LuaVM, name: &str, args: impl FnOnce(&mut LuaVM)) -> LuaStatus {
    vm.set_top(0);
    vm.get_global(name).unwrap();
    args(vm);
    let nargs = vm.get_top() as usize - 1;
    vm.pcall(nargs, LUA_MULTRET, 0)
}

fn call_error(vm: &mut LuaVM, name: &str, args: impl FnOnce(&mut LuaVM)) -> String {
    assert_eq!(call(vm, name, args), LuaStatus::ErrRun);
    string_at(vm, -1)
}

fn push_list(vm: &mut LuaVM, items: &[i64]) {
    vm.create_table(items.len(), 0).unwrap();
    for (i, &n) in items.iter().enumerate() {
        vm.push_integer(n);
        vm.raw_set_i(-2, i as i64 + 1).unwrap();
    }
}

#[test]
fn test_tonumber() {
    let mut vm = new_vm();
    let cases: [(&str, i64, Option<f64>); 6] = [
        ("10", 10, Some(10.0)),
        ("  12  ", 10, Some(12.0)),
        ("0x1A", 10, Some(26.0)),
        ("ff", 16, Some(255.0)),
        ("zz", 36, Some(1295.0)),
        ("8", 8, None),
    ];
    for (text, base, expected) in cases {
        assert_eq!(
            call(&mut vm, "tonumber", |vm| {
                vm.push_string(text).unwrap();
                vm.push_integer(base);
            }),
            LuaStatus::Ok
        );
        assert_eq!(vm.to_number(1), expected, "tonumber({:?}, {})", text, base);
    }
    let msg = call_error(&mut vm, "tonumber", |vm| {
        vm.push_string("1").unwrap();
        vm.push_integer(99);
    });
    assert_eq!(msg, "bad argument #2 to '?' (base out of range)");
}

#[test]
fn test_tostring_and_type() {
    let mut vm = new_vm();
    let show = |vm: &mut LuaVM, push: fn(&mut LuaVM)| {
        assert_eq!(call(vm, "tostring", push), LuaStatus::Ok);
        string_at(vm, 1)
    };
    assert_eq!(show(&mut vm, |vm| vm.push_nil()), "nil");
    assert_eq!(show(&mut vm, |vm| vm.push_boolean(true)), "true");
    assert_eq!(show(&mut vm, |vm| vm.push_number(1.5)), "1.5");
    assert!(show(&mut vm, |vm| vm.create_table(0, 0).unwrap()).starts_with("table: 0x"));

    assert_eq!(call(&mut vm, "type", |vm| vm.push_number(1.0)), LuaStatus::Ok);
    assert_eq!(string_at(&mut vm, 1), "number");
    let msg = call_error(&mut vm, "type", |_| {});
    assert_eq!(msg, "bad argument #1 to '?' (value expected)");
}

#[test]
fn test_select() {
    let mut vm = new_vm();
    let abc = |vm: &mut LuaVM| {
        for s in ["a", "b", "c"] {
            vm.push_string(s).unwrap();
        }
    };
    assert_eq!(
        call(&mut vm, "select", |vm| {
            vm.push_string("#").unwrap();
            abc(vm);
        }),
        LuaStatus::Ok
    );
    assert_eq!(vm.to_integer(1), Some(3));

    assert_eq!(
        call(&mut vm, "select", |vm| {
            vm.push_integer(-1);
            abc(vm);
        }),
        LuaStatus::Ok
    );
    assert_eq!(vm.get_top(), 1);
    assert_eq!(string_at(&mut vm, 1), "c");

    assert_eq!(
        call(&mut vm, "select", |vm| {
            vm.push_integer(2);
            abc(vm);
        }),
        LuaStatus::Ok
    );
    assert_eq!(vm.get_top(), 2);

    let msg = call_error(&mut vm, "select", |vm| vm.push_integer(0));
    assert_eq!(msg, "bad argument #1 to '?' (index out of range)");
}

#[test]
fn test_unpack() {
    let mut vm = new_vm();
    assert_eq!(call(&mut vm, "unpack", |vm| push_list(vm, &[10, 20, 30])), LuaStatus::Ok);
    assert_eq!(vm.get_top(), 3);
    assert_eq!(vm.to_integer(3), Some(30));

    assert_eq!(
        call(&mut vm, "unpack", |vm| {
            push_list(vm, &[10, 20, 30]);
            vm.push_integer(2);
        }),
        LuaStatus::Ok
    );
    assert_eq!(vm.get_top(), 2);
    assert_eq!(vm.to_integer(1), Some(20));

    // explicit range past the end pads with nil
    assert_eq!(
        call(&mut vm, "unpack", |vm| {
            push_list(vm, &[1]);
            vm.push_integer(1);
            vm.push_integer(3);
        }),
        LuaStatus::Ok
    );
    assert_eq!(vm.get_top(), 3);
    assert!(vm.is_none_or_nil(3));

    assert_eq!(
        call(&mut vm, "unpack", |vm| {
            push_list(vm, &[1, 2]);
            vm.push_integer(3);
        }),
        LuaStatus::Ok
    );
    assert_eq!(vm.get_top(), 0);
}

#[test]
fn test_assert() {
    let mut vm = new_vm();
    assert_eq!(
        call(&mut vm, "assert", |vm| {
            vm.push_integer(1);
            vm.push_integer(2);
        }),
        LuaStatus::Ok
    );
    assert_eq!(vm.get_top(), 2);

    let msg = call_error(&mut vm, "assert", |vm| vm.push_nil());
    assert_eq!(msg, "assertion failed!");
    let msg = call_error(&mut vm, "assert", |vm| {
        vm.push_boolean(false);
        vm.push_string("custom").unwrap();
    });
    assert_eq!(msg, "custom");
}

fn push_proxy(vm: &mut LuaVM) {
    // setmetatable({}, {__index = {x = 1}, __metatable = "locked"})
    vm.create_table(0, 0).unwrap();
    vm.create_table(0, 2).unwrap();
    vm.create_table(0, 1).unwrap();
    vm.push_integer(1);
    vm.set_field(-2, "x").unwrap();
    vm.set_field(-2, "__index").unwrap();
    vm.push_string("locked").unwrap();
    vm.set_field(-2, "__metatable").unwrap();
    vm.set_metatable(-2).unwrap();
}

#[test]
fn test_raw_access_bypasses_metatables() {
    let mut vm = new_vm();
    assert_eq!(
        call(&mut vm, "rawget", |vm| {
            push_proxy(vm);
            vm.push_string("x").unwrap();
        }),
        LuaStatus::Ok
    );
    assert!(vm.is_none_or_nil(1));

    assert_eq!(call(&mut vm, "getmetatable", push_proxy), LuaStatus::Ok);
    assert_eq!(string_at(&mut vm, 1), "locked");

    let msg = call_error(&mut vm, "setmetatable", |vm| {
        push_proxy(vm);
        vm.create_table(0, 0).unwrap();
    });
    assert_eq!(msg, "cannot change a protected metatable");

    assert_eq!(
        call(&mut vm, "rawequal", |vm| {
            vm.push_string("a").unwrap();
            vm.push_string("a").unwrap();
        }),
        LuaStatus::Ok
    );
    assert!(vm.to_boolean(1));
}

#[test]
fn test_environment_functions() {
    let mut vm = new_vm();
    assert_eq!(call(&mut vm, "getfenv", |vm| vm.push_integer(0)), LuaStatus::Ok);
    vm.push_value(GLOBALSINDEX);
    assert!(vm.raw_equal(1, 2));

    let msg = call_error(&mut vm, "setfenv", |vm| {
        vm.get_global("print").unwrap();
        vm.create_table(0, 0).unwrap();
    });
    assert_eq!(msg, "'setfenv' cannot change environment of given object");
}

#[test]
fn test_collectgarbage_options() {
    let mut vm = new_vm();
    assert_eq!(
        call(&mut vm, "collectgarbage", |vm| {
            vm.push_string("step").unwrap();
            vm.push_integer(0);
        }),
        LuaStatus::Ok
    );
    assert_eq!(vm.type_of(1), LuaType::Boolean);

    assert_eq!(call(&mut vm, "gcinfo", |_| {}), LuaStatus::Ok);
    assert!(vm.to_integer(1).unwrap() > 0);

    let msg = call_error(&mut vm, "collectgarbage", |vm| vm.push_string("bogus").unwrap());
    assert_eq!(msg, "bad argument #1 to '?' (invalid option 'bogus')");
}
