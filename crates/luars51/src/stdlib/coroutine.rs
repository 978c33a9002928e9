// Coroutine library
// Implements: create, resume, yield, status, running, wrap

use crate::gc::ThreadId;
use crate::lib_registry::{LibraryModule, arg_check, arg_error, lib_error};
use crate::lua_value::{LuaFunction, LuaValue};
use crate::lua_vm::api::upvalue_index;
use crate::lua_vm::coroutine::CoroutineStatus;
use crate::lua_vm::{LuaResult, LuaStatus, LuaVM};

pub fn create_coroutine_lib() -> LibraryModule {
    crate::lib_module!("coroutine", {
        "create" => coroutine_create,
        "resume" => coroutine_resume,
        "running" => coroutine_running,
        "status" => coroutine_status,
        "wrap" => coroutine_wrap,
        "yield" => coroutine_yield,
    })
}

fn check_coroutine(vm: &mut LuaVM, narg: i32) -> LuaResult<ThreadId> {
    match vm.to_thread(narg) {
        Some(co) => Ok(co),
        None => Err(arg_error(vm, narg, "coroutine expected")),
    }
}

/// Move `narg` arguments to `co` and resume it. Ok(n) leaves the `n`
/// yielded or returned values on the caller's stack; Err(()) leaves the
/// error message.
fn aux_resume(vm: &mut LuaVM, co: ThreadId, narg: usize) -> LuaResult<Result<usize, ()>> {
    let status = vm.coroutine_status(co);
    if status != CoroutineStatus::Suspended {
        vm.push_string(&format!("cannot resume {} coroutine", status.name()))?;
        return Ok(Err(()));
    }
    if !vm.check_thread_stack(co, narg) {
        return Err(lib_error(vm, "too many arguments to resume"));
    }
    let current = vm.current_thread();
    vm.xmove(current, co, narg);
    match vm.resume(co, narg) {
        LuaStatus::Ok | LuaStatus::Yield => {
            let nres = vm.thread_top(co);
            if !vm.check_stack(nres + 1) {
                return Err(lib_error(vm, "too many results to resume"));
            }
            vm.xmove(co, current, nres);
            Ok(Ok(nres))
        }
        _ => {
            // error value
            vm.xmove(co, current, 1);
            Ok(Err(()))
        }
    }
}

/// coroutine.create(f) - New suspended coroutine running f
fn coroutine_create(vm: &mut LuaVM) -> LuaResult<usize> {
    let is_lua = match vm.index_value(1) {
        Some(LuaValue::Function(f)) => matches!(vm.object_pool().function(f), LuaFunction::Lua(_)),
        _ => false,
    };
    arg_check(vm, is_lua, 1, "Lua function expected")?;
    let co = vm.new_thread()?;
    vm.push_value(1);
    let current = vm.current_thread();
    vm.xmove(current, co, 1);
    Ok(1)
}

/// coroutine.resume(co, ...) - true plus results, or false plus the error
fn coroutine_resume(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = check_coroutine(vm, 1)?;
    let narg = vm.get_top() as usize - 1;
    match aux_resume(vm, co, narg)? {
        Ok(nres) => {
            vm.push_boolean(true);
            vm.insert(-(nres as i32 + 1));
            Ok(nres + 1)
        }
        Err(()) => {
            vm.push_boolean(false);
            vm.insert(-2);
            Ok(2)
        }
    }
}

/// coroutine.yield(...) - Suspend the running coroutine
fn coroutine_yield(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.get_top() as usize;
    vm.yield_(n)
}

/// coroutine.status(co) - "running", "suspended", "normal" or "dead"
fn coroutine_status(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = check_coroutine(vm, 1)?;
    let status = vm.coroutine_status(co);
    vm.push_string(status.name())?;
    Ok(1)
}

/// coroutine.running() - The running coroutine, nil in the main thread
fn coroutine_running(vm: &mut LuaVM) -> LuaResult<usize> {
    if vm.push_thread() {
        // the main thread is not a coroutine
        vm.push_nil();
    }
    Ok(1)
}

fn wrap_aux(vm: &mut LuaVM) -> LuaResult<usize> {
    let co = match vm.to_thread(upvalue_index(1)) {
        Some(co) => co,
        None => return Err(lib_error(vm, "cannot resume non-suspended coroutine")),
    };
    let narg = vm.get_top() as usize;
    match aux_resume(vm, co, narg)? {
        Ok(nres) => Ok(nres),
        Err(()) => {
            if vm.is_string(-1) {
                // add position information
                let position = vm.where_at(1);
                vm.push_string(&position)?;
                vm.insert(-2);
                vm.concat_top(2)?;
            }
            Err(vm.raise_top())
        }
    }
}

/// coroutine.wrap(f) - Function that resumes a new coroutine on each call
fn coroutine_wrap(vm: &mut LuaVM) -> LuaResult<usize> {
    coroutine_create(vm)?;
    vm.push_native_closure(wrap_aux, 1)?;
    Ok(1)
}
