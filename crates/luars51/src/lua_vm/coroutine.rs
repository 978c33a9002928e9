// Coroutines: resume / yield (ldo.c, lua_resume / lua_yield)
//
// A coroutine is a thread with its own stack and frames. `resume` switches
// `current` to it and runs its frames on the Rust stack of the resumer; a
// yield unwinds back to `resume` as `Err(LuaError::Yield)`, leaving the
// yielding native frame in place so the next resume can complete it.

use crate::gc::ThreadId;
use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::call_status::CIST_FRESH;
use crate::lua_vm::execute::{FrameAction, lua_execute};
use crate::lua_vm::lua_limits::LUA_MULTRET;
use crate::lua_vm::{LuaError, LuaResult, LuaStatus, LuaVM};

/// Status of a coroutine as seen from the running thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    Running,
    /// Not started yet, or stopped in a yield
    Suspended,
    /// Active but not running: it resumed another coroutine
    Normal,
    Dead,
}

impl CoroutineStatus {
    pub fn name(self) -> &'static str {
        match self {
            CoroutineStatus::Running => "running",
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

impl LuaVM {
    /// Create a coroutine sharing the running thread's globals and push it.
    /// Its stack is empty; move the body function and arguments onto it
    /// before the first resume.
    pub fn new_thread(&mut self) -> LuaResult<ThreadId> {
        self.check_gc()?;
        let co = self.create_thread()?;
        self.state_mut().push(LuaValue::Thread(co));
        Ok(co)
    }

    /// Raw status of a thread: `Ok`, `Yield` or the error that killed it.
    pub fn status(&self, co: ThreadId) -> LuaStatus {
        self.pool.thread(co).status
    }

    /// Number of values on `co`'s stack above its current frame base.
    pub fn thread_top(&self, co: ThreadId) -> usize {
        let state = self.pool.thread(co);
        state.top - state.ci().base
    }

    pub fn coroutine_status(&self, co: ThreadId) -> CoroutineStatus {
        if co == self.current {
            return CoroutineStatus::Running;
        }
        let state = self.pool.thread(co);
        match state.status {
            LuaStatus::Yield => CoroutineStatus::Suspended,
            LuaStatus::Ok => {
                if state.call_stack.len() > 1 {
                    CoroutineStatus::Normal
                } else if state.top == state.ci().base {
                    CoroutineStatus::Dead
                } else {
                    CoroutineStatus::Suspended
                }
            }
            _ => CoroutineStatus::Dead,
        }
    }

    /// Start or continue `co` with the top `nargs` values of its stack as
    /// arguments (or as the results of the pending yield). On `Yield` or
    /// `Ok` the values yielded or returned are left on `co`'s stack; on an
    /// error the error value is on top of it.
    pub fn resume(&mut self, co: ThreadId, nargs: usize) -> LuaStatus {
        let (status, depth, has_body) = {
            let state = self.pool.thread(co);
            let has_body = state.top.saturating_sub(nargs) > state.ci().base;
            (state.status, state.call_stack.len(), has_body)
        };
        let startable = status == LuaStatus::Ok && depth == 1 && has_body;
        if status != LuaStatus::Yield && !startable {
            return self.resume_error(co, "cannot resume non-suspended coroutine");
        }
        let from = self.current;
        let n_ccalls = self.state().n_ccalls;
        if n_ccalls >= self.safe_option.max_c_calls {
            return self.resume_error(co, "C stack overflow");
        }

        self.current = co;
        let first_arg = {
            let state = self.state_mut();
            state.n_ccalls = n_ccalls + 1;
            state.base_ccalls = n_ccalls + 1;
            state.top - nargs
        };
        let result = self.resume_inner(first_arg);
        let status = match result {
            Ok(()) => LuaStatus::Ok,
            Err(LuaError::Yield) => LuaStatus::Yield,
            Err(e) => {
                let limit = self.safe_option.max_stack_size;
                let state = self.state_mut();
                state.status = LuaStatus::from(e);
                state.ensure_stack(1, limit + 1);
                let err = std::mem::take(&mut state.error_object);
                state.push(err);
                let top = state.top;
                state.ci_mut().top = top;
                state.status
            }
        };
        self.state_mut().n_ccalls -= 1;
        self.current = from;
        status
    }

    fn resume_inner(&mut self, first_arg: usize) -> LuaResult<()> {
        if self.state().status == LuaStatus::Ok {
            match self.precall(first_arg - 1, LUA_MULTRET)? {
                FrameAction::Lua => self.state_mut().ci_mut().call_status |= CIST_FRESH,
                FrameAction::Native => return Ok(()),
            }
        } else {
            self.state_mut().status = LuaStatus::Ok;
            // finish the native call that yielded
            if self.poscall(first_arg)? {
                let state = self.state_mut();
                state.top = state.ci().top;
            }
        }
        lua_execute(self)
    }

    fn resume_error(&mut self, co: ThreadId, msg: &str) -> LuaStatus {
        let value = match self.create_string(msg.as_bytes()) {
            Ok(s) => LuaValue::String(s),
            Err(_) => return LuaStatus::ErrMem,
        };
        let limit = self.safe_option.max_stack_size;
        let state = self.pool.thread_mut(co);
        state.ensure_stack(1, limit + 1);
        state.push(value);
        LuaStatus::ErrRun
    }

    /// Suspend the running coroutine, handing the top `nresults` values to
    /// the resumer. Native functions end with `return vm.yield_(n)`.
    pub fn yield_(&mut self, nresults: usize) -> LuaResult<usize> {
        if self.current == self.main_thread {
            return Err(self.error("attempt to yield from outside a coroutine"));
        }
        let (n_ccalls, base_ccalls, in_lua) = {
            let state = self.state();
            (state.n_ccalls, state.base_ccalls, state.ci().is_lua())
        };
        if n_ccalls > base_ccalls || in_lua {
            return Err(self.error("attempt to yield across metamethod/C-call boundary"));
        }
        let state = self.state_mut();
        let top = state.top;
        state.ci_mut().base = top - nresults;
        state.status = LuaStatus::Yield;
        Err(LuaError::Yield)
    }
}
