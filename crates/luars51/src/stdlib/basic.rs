// Basic library (_G global functions)
// Implements: assert, collectgarbage, error, gcinfo, getfenv, getmetatable,
// ipairs, loadstring, next, pairs, pcall, print, rawequal, rawget, rawset,
// select, setfenv, setmetatable, tonumber, tostring, type, unpack, xpcall

use std::io::Write;

use crate::lib_registry::{
    LibraryModule, arg_check, arg_error, check_any, check_integer, check_string, check_table,
    lib_error, opt_integer, opt_string, type_error_arg,
};
use crate::lua_value::lua_convert::str_to_number_base;
use crate::lua_value::{LuaType, LuaValue};
use crate::lua_vm::api::{GLOBALSINDEX, upvalue_index};
use crate::lua_vm::lua_limits::LUA_MULTRET;
use crate::lua_vm::{CFunction, GcOption, LuaResult, LuaStatus, LuaVM};

pub fn create_basic_lib() -> LibraryModule {
    crate::lib_module!("_G", {
        "assert" => lua_assert,
        "collectgarbage" => lua_collectgarbage,
        "error" => lua_error,
        "gcinfo" => lua_gcinfo,
        "getfenv" => lua_getfenv,
        "getmetatable" => lua_getmetatable,
        "loadstring" => lua_loadstring,
        "next" => lua_next,
        "pcall" => lua_pcall,
        "print" => lua_print,
        "rawequal" => lua_rawequal,
        "rawget" => lua_rawget,
        "rawset" => lua_rawset,
        "select" => lua_select,
        "setfenv" => lua_setfenv,
        "setmetatable" => lua_setmetatable,
        "tonumber" => lua_tonumber,
        "tostring" => lua_tostring,
        "type" => lua_type,
        "unpack" => lua_unpack,
        "xpcall" => lua_xpcall,
    })
    .with_value("_G", |vm| Ok(LuaValue::Table(vm.globals())))
    .with_value("_VERSION", |vm| vm.create_string_value("Lua 5.1"))
    // iterator generators keep their step function as upvalue 1
    .with_value("ipairs", |vm| aux_closure(vm, lua_ipairs, ipairs_aux))
    .with_value("pairs", |vm| aux_closure(vm, lua_pairs, lua_next))
}

fn aux_closure(vm: &mut LuaVM, f: CFunction, aux: CFunction) -> LuaResult<LuaValue> {
    vm.push_native_function(aux)?;
    vm.push_native_closure(f, 1)?;
    let v = vm.index_value(-1).unwrap_or_default();
    vm.pop(1);
    Ok(v)
}

// ============ Metafield helpers ============

/// Push field `event` of the metatable of the value at `obj`; false (and
/// nothing pushed) when there is no such field.
pub(crate) fn get_meta_field(vm: &mut LuaVM, obj: i32, event: &str) -> LuaResult<bool> {
    if !vm.get_metatable(obj) {
        return Ok(false);
    }
    vm.push_string(event)?;
    vm.raw_get(-2)?;
    if vm.is_none_or_nil(-1) {
        vm.pop(2);
        Ok(false)
    } else {
        vm.remove(-2);
        Ok(true)
    }
}

/// Call metamethod `event` of the value at `obj` with it as the only
/// argument, leaving one result on the stack.
pub(crate) fn call_meta(vm: &mut LuaVM, obj: i32, event: &str) -> LuaResult<bool> {
    let obj = vm.abs_index(obj);
    if !get_meta_field(vm, obj, event)? {
        return Ok(false);
    }
    vm.push_value(obj);
    vm.call(1, 1)?;
    Ok(true)
}

/// Push the string form `tostring` gives the value at `idx`.
pub(crate) fn to_display_string(vm: &mut LuaVM, idx: i32) -> LuaResult<()> {
    if call_meta(vm, idx, "__tostring")? {
        return Ok(());
    }
    let v = vm.index_value(idx).unwrap_or_default();
    match v {
        LuaValue::Number(_) | LuaValue::String(_) => {
            vm.push_value(idx);
            vm.to_string_id(-1)?;
            Ok(())
        }
        LuaValue::Nil => vm.push_string("nil"),
        LuaValue::Boolean(b) => vm.push_string(if b { "true" } else { "false" }),
        LuaValue::LightUserdata(p) => vm.push_string(&format!("userdata: 0x{:08x}", p)),
        other => {
            let addr = other.gc_ref().map_or(0, |r| r.index());
            vm.push_string(&format!("{}: 0x{:08x}", other.type_name(), addr))
        }
    }
}

// ============ Functions ============

/// print(...) - Write the `tostring` of every argument to stdout
fn lua_print(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.get_top();
    vm.get_global("tostring")?;
    let mut line = Vec::new();
    for i in 1..=n {
        vm.push_value(-1);
        vm.push_value(i);
        vm.call(1, 1)?;
        let Some(s) = vm.to_string_id(-1)? else {
            return Err(lib_error(vm, "'tostring' must return a string to 'print'"));
        };
        if i > 1 {
            line.push(b'\t');
        }
        line.extend_from_slice(vm.string_bytes(s));
        vm.pop(1);
    }
    line.push(b'\n');
    let mut out = std::io::stdout().lock();
    // a closed stdout is not an error of the script
    let _ = out.write_all(&line).and_then(|_| out.flush());
    Ok(0)
}

/// type(v) - Name of the type of a value
fn lua_type(vm: &mut LuaVM) -> LuaResult<usize> {
    check_any(vm, 1)?;
    let name = vm.type_name(1);
    vm.push_string(name)?;
    Ok(1)
}

/// assert(v [, message]) - Raise unless v is true, else return all arguments
fn lua_assert(vm: &mut LuaVM) -> LuaResult<usize> {
    check_any(vm, 1)?;
    if !vm.to_boolean(1) {
        let msg = match opt_string(vm, 2)? {
            Some(s) => String::from_utf8_lossy(vm.string_bytes(s)).into_owned(),
            None => "assertion failed!".to_string(),
        };
        return Err(lib_error(vm, msg));
    }
    Ok(vm.get_top() as usize)
}

/// error(message [, level]) - Raise message, with position info for
/// string messages when level > 0
fn lua_error(vm: &mut LuaVM) -> LuaResult<usize> {
    let level = opt_integer(vm, 2, 1)?;
    vm.set_top(1);
    if matches!(vm.index_value(1), Some(LuaValue::String(_))) && level > 0 {
        let position = vm.where_at(level as usize);
        vm.push_string(&position)?;
        vm.insert(1);
        vm.concat_top(2)?;
    }
    Err(vm.raise_top())
}

/// collectgarbage([opt [, arg]]) - Collector control
fn lua_collectgarbage(vm: &mut LuaVM) -> LuaResult<usize> {
    let opt = match opt_string(vm, 1)? {
        Some(s) => String::from_utf8_lossy(vm.string_bytes(s)).into_owned(),
        None => "collect".to_string(),
    };
    let arg = opt_integer(vm, 2, 0)?;
    let option = match opt.as_str() {
        "stop" => GcOption::Stop,
        "restart" => GcOption::Restart,
        "collect" => GcOption::Collect,
        "count" => GcOption::Count,
        "step" => GcOption::Step(arg),
        "setpause" => GcOption::SetPause(arg),
        "setstepmul" => GcOption::SetStepMul(arg),
        _ => {
            return Err(arg_error(vm, 1, &format!("invalid option '{}'", opt)));
        }
    };
    match option {
        GcOption::Count => {
            let kib = vm.gc(GcOption::Count)?;
            let rem = vm.gc(GcOption::CountB)?;
            vm.push_number(kib as f64 + rem as f64 / 1024.0);
        }
        GcOption::Step(_) => {
            let finished = vm.gc(option)?;
            vm.push_boolean(finished != 0);
        }
        _ => {
            let res = vm.gc(option)?;
            vm.push_integer(res);
        }
    }
    Ok(1)
}

/// gcinfo() - Heap size in KiB
fn lua_gcinfo(vm: &mut LuaVM) -> LuaResult<usize> {
    let kib = vm.gc(GcOption::Count)?;
    vm.push_integer(kib);
    Ok(1)
}

/// Push the function named by argument 1 (a function or a stack level).
/// Level 0 pushes nothing and returns false.
fn get_func(vm: &mut LuaVM, default_level: i64) -> LuaResult<bool> {
    if vm.type_of(1) == LuaType::Function {
        vm.push_value(1);
        return Ok(true);
    }
    let level = if default_level > 0 {
        opt_integer(vm, 1, default_level)?
    } else {
        check_integer(vm, 1)?
    };
    arg_check(vm, level >= 0, 1, "level must be non-negative")?;
    if level == 0 {
        return Ok(false);
    }
    let Some(info) = vm.get_info(level as usize) else {
        return Err(arg_error(vm, 1, "invalid level"));
    };
    if info.func.is_nil() {
        return Err(lib_error(
            vm,
            format!("no function environment for tail call at level {}", level),
        ));
    }
    vm.push(info.func);
    Ok(true)
}

/// getfenv([f]) - Environment of a function or of the function at a level
fn lua_getfenv(vm: &mut LuaVM) -> LuaResult<usize> {
    if !get_func(vm, 1)? {
        vm.push_value(GLOBALSINDEX);
    } else if vm.is_native_function(-1) {
        vm.push_value(GLOBALSINDEX);
    } else {
        vm.get_fenv(-1);
    }
    Ok(1)
}

/// setfenv(f, table) - Change the environment of a function or, with
/// f == 0, of the running thread
fn lua_setfenv(vm: &mut LuaVM) -> LuaResult<usize> {
    check_table(vm, 2)?;
    let has_func = get_func(vm, 0)?;
    vm.push_value(2);
    if !has_func {
        // change the environment of the running thread
        vm.push_thread();
        vm.insert(-2);
        vm.set_fenv(-2)?;
        return Ok(0);
    }
    let settable = !vm.is_native_function(-2) && vm.set_fenv(-2)?;
    if !settable {
        return Err(lib_error(vm, "'setfenv' cannot change environment of given object"));
    }
    Ok(1)
}

/// getmetatable(obj) - Metatable, or its __metatable field when present
fn lua_getmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    check_any(vm, 1)?;
    if !vm.get_metatable(1) {
        vm.push_nil();
        return Ok(1);
    }
    get_meta_field(vm, 1, "__metatable")?;
    Ok(1)
}

/// setmetatable(table, metatable) - Set (or clear with nil) a table's
/// metatable unless it is protected
fn lua_setmetatable(vm: &mut LuaVM) -> LuaResult<usize> {
    check_table(vm, 1)?;
    let t = vm.type_of(2);
    if t != LuaType::Nil && t != LuaType::Table {
        return Err(type_error_arg(vm, 2, "nil or table"));
    }
    if get_meta_field(vm, 1, "__metatable")? {
        return Err(lib_error(vm, "cannot change a protected metatable"));
    }
    vm.set_top(2);
    vm.set_metatable(1)?;
    Ok(1)
}

/// rawequal(a, b)
fn lua_rawequal(vm: &mut LuaVM) -> LuaResult<usize> {
    check_any(vm, 1)?;
    check_any(vm, 2)?;
    let eq = vm.raw_equal(1, 2);
    vm.push_boolean(eq);
    Ok(1)
}

/// rawget(table, key)
fn lua_rawget(vm: &mut LuaVM) -> LuaResult<usize> {
    check_table(vm, 1)?;
    check_any(vm, 2)?;
    vm.set_top(2);
    vm.raw_get(1)?;
    Ok(1)
}

/// rawset(table, key, value)
fn lua_rawset(vm: &mut LuaVM) -> LuaResult<usize> {
    check_table(vm, 1)?;
    check_any(vm, 2)?;
    check_any(vm, 3)?;
    vm.set_top(3);
    vm.raw_set(1)?;
    Ok(1)
}

/// next(table [, key]) - Next key/value pair, or nil after the last one
fn lua_next(vm: &mut LuaVM) -> LuaResult<usize> {
    check_table(vm, 1)?;
    vm.set_top(2);
    if vm.next(1)? {
        Ok(2)
    } else {
        vm.push_nil();
        Ok(1)
    }
}

/// pairs(t) - next, t, nil
fn lua_pairs(vm: &mut LuaVM) -> LuaResult<usize> {
    check_table(vm, 1)?;
    vm.push_value(upvalue_index(1));
    vm.push_value(1);
    vm.push_nil();
    Ok(3)
}

fn ipairs_aux(vm: &mut LuaVM) -> LuaResult<usize> {
    let i = check_integer(vm, 2)? + 1;
    check_table(vm, 1)?;
    vm.push_integer(i);
    vm.raw_get_i(1, i)?;
    if vm.is_none_or_nil(-1) { Ok(0) } else { Ok(2) }
}

/// ipairs(t) - iterator over t[1], t[2], ... up to the first nil
fn lua_ipairs(vm: &mut LuaVM) -> LuaResult<usize> {
    check_table(vm, 1)?;
    vm.push_value(upvalue_index(1));
    vm.push_value(1);
    vm.push_integer(0);
    Ok(3)
}

/// select(n, ...) - Arguments after the n-th, or their count for '#'
fn lua_select(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.get_top() as i64;
    if let Some(LuaValue::String(s)) = vm.index_value(1)
        && vm.string_bytes(s) == b"#"
    {
        vm.push_integer(n - 1);
        return Ok(1);
    }
    let mut i = check_integer(vm, 1)?;
    if i < 0 {
        i += n;
    } else if i > n {
        i = n;
    }
    arg_check(vm, i >= 1, 1, "index out of range")?;
    Ok((n - i) as usize)
}

/// tonumber(e [, base])
fn lua_tonumber(vm: &mut LuaVM) -> LuaResult<usize> {
    let base = opt_integer(vm, 2, 10)?;
    if base == 10 {
        check_any(vm, 1)?;
        if let Some(n) = vm.to_number(1) {
            vm.push_number(n);
            return Ok(1);
        }
    } else {
        let s = check_string(vm, 1)?;
        arg_check(vm, (2..=36).contains(&base), 2, "base out of range")?;
        if let Some(n) = str_to_number_base(vm.string_bytes(s), base as u32) {
            vm.push_number(n);
            return Ok(1);
        }
    }
    vm.push_nil();
    Ok(1)
}

/// tostring(v) - __tostring result or the default string form
fn lua_tostring(vm: &mut LuaVM) -> LuaResult<usize> {
    check_any(vm, 1)?;
    to_display_string(vm, 1)?;
    Ok(1)
}

/// unpack(list [, i [, j]]) - list[i], ..., list[j]
fn lua_unpack(vm: &mut LuaVM) -> LuaResult<usize> {
    check_table(vm, 1)?;
    let i = opt_integer(vm, 2, 1)?;
    let e = if vm.is_none_or_nil(3) {
        vm.obj_len(1)? as i64
    } else {
        check_integer(vm, 3)?
    };
    if i > e {
        return Ok(0);
    }
    let n = e.wrapping_sub(i).wrapping_add(1);
    if n <= 0 || n >= i32::MAX as i64 || !vm.check_stack(n as usize) {
        return Err(lib_error(vm, "too many results to unpack"));
    }
    for k in i..=e {
        vm.raw_get_i(1, k)?;
    }
    Ok(n as usize)
}

/// pcall(f, ...) - true plus results, or false plus the error value
fn lua_pcall(vm: &mut LuaVM) -> LuaResult<usize> {
    check_any(vm, 1)?;
    let nargs = vm.get_top() as usize - 1;
    let status = vm.pcall(nargs, LUA_MULTRET, 0);
    vm.push_boolean(status == LuaStatus::Ok);
    vm.insert(1);
    Ok(vm.get_top() as usize)
}

/// xpcall(f, handler) - pcall with a message handler
fn lua_xpcall(vm: &mut LuaVM) -> LuaResult<usize> {
    check_any(vm, 2)?;
    vm.set_top(2);
    // handler below the function
    vm.insert(1);
    let status = vm.pcall(0, LUA_MULTRET, 1);
    vm.push_boolean(status == LuaStatus::Ok);
    vm.replace(1)?;
    Ok(vm.get_top() as usize)
}

/// loadstring(chunk [, chunkname]) - Load a precompiled chunk from a
/// string; nil plus message on failure
fn lua_loadstring(vm: &mut LuaVM) -> LuaResult<usize> {
    let s = check_string(vm, 1)?;
    let data = vm.string_bytes(s).to_vec();
    let name = match opt_string(vm, 2)? {
        Some(n) => String::from_utf8_lossy(vm.string_bytes(n)).into_owned(),
        None => String::from_utf8_lossy(&data).into_owned(),
    };
    match vm.load(&data, &name) {
        LuaStatus::Ok => Ok(1),
        _ => {
            vm.push_nil();
            vm.insert(-2);
            Ok(2)
        }
    }
}
