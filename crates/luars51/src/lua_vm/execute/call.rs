/// Function call implementation (ldo.c)
///
/// Calls between Lua functions never recurse on the Rust stack:
/// - `precall` pushes the callee frame; a Lua callee is then run by the
///   dispatch loop that issued the call, a native callee runs at once
/// - `poscall` moves results into place and pops the frame
///
/// Only native boundaries (`call`, metamethods, protected calls) recurse,
/// and those are counted in `n_ccalls`.
use crate::gc::TableId;
use crate::lua_value::{LuaFunction, LuaValue, VARARG_NEEDSARG};
use crate::lua_vm::call_info::call_status::{CIST_FRESH, CIST_LUA};
use crate::lua_vm::debug_info::{HookEvent, MASK_CALL, MASK_RET};
use crate::lua_vm::execute::lua_execute;
use crate::lua_vm::lua_limits::{EXTRA_CI, LUA_MINSTACK, LUA_MULTRET};
use crate::lua_vm::{CallInfo, LuaError, LuaResult, LuaStatus, LuaVM};

/// Outcome of `precall`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    /// A Lua frame was pushed and must be run by the dispatch loop
    Lua,
    /// A native function ran to completion; its results are in place
    Native,
}

impl LuaVM {
    /// Make room for `n` more slots above `top`, raising "stack overflow"
    /// past the configured limit.
    pub(crate) fn check_stack_or_error(&mut self, n: usize) -> LuaResult<()> {
        let limit = self.safe_option.max_stack_size;
        if self.state_mut().ensure_stack(n, limit) {
            return Ok(());
        }
        // leave room for the error handler before raising
        self.state_mut().ensure_stack(LUA_MINSTACK.min(n), limit + LUA_MINSTACK);
        Err(self.error("stack overflow"))
    }

    /// Push a frame, enforcing the frame limit. Past the limit a few more
    /// frames stay available so that a message handler can still run.
    fn push_ci(&mut self, ci: CallInfo) -> LuaResult<()> {
        let max = self.safe_option.max_call_depth;
        let state = self.state_mut();
        let depth = state.call_stack.len();
        if depth < max {
            state.ci_overflow = false;
        } else if depth >= max + EXTRA_CI {
            return Err(self.raise_error_in_error_handling());
        } else if !state.ci_overflow {
            state.ci_overflow = true;
            return Err(self.error("stack overflow"));
        }
        self.state_mut().call_stack.push(ci);
        Ok(())
    }

    /// Start a call to the value at `func` with the arguments above it.
    pub(crate) fn precall(&mut self, func: usize, nresults: i32) -> LuaResult<FrameAction> {
        let fid = match self.state().stack[func] {
            LuaValue::Function(f) => f,
            _ => match self.try_func_tm(func)? {
                LuaValue::Function(f) => f,
                _ => return Err(self.error("attempt to call a non-function value")),
            },
        };
        match self.pool.function(fid) {
            LuaFunction::Lua(cl) => {
                let p = self.pool.chunk(cl.chunk);
                let (max_stack, num_params, is_vararg) = (
                    p.max_stack_size as usize,
                    p.param_count as usize,
                    p.is_vararg,
                );
                self.check_stack_or_error(max_stack + 2 * num_params + 1)?;
                let base = if is_vararg == 0 {
                    let base = func + 1;
                    let state = self.state_mut();
                    if state.top > base + num_params {
                        state.top = base + num_params;
                    }
                    base
                } else {
                    let nargs = self.state().top - func - 1;
                    self.adjust_varargs(num_params, is_vararg, nargs)?
                };
                let top = base + max_stack;
                self.push_ci(CallInfo {
                    func,
                    base,
                    top,
                    saved_pc: 0,
                    nresults,
                    tailcalls: 0,
                    call_status: CIST_LUA,
                })?;
                self.state_mut().set_top_index(top);
                if self.state().hook_mask & MASK_CALL != 0 {
                    self.call_hook(HookEvent::Call, -1)?;
                }
                Ok(FrameAction::Lua)
            }
            LuaFunction::Native(cl) => {
                let f = cl.func;
                self.check_stack_or_error(LUA_MINSTACK)?;
                let top = self.state().top;
                self.push_ci(CallInfo {
                    func,
                    base: func + 1,
                    top: top + LUA_MINSTACK,
                    saved_pc: 0,
                    nresults,
                    tailcalls: 0,
                    call_status: 0,
                })?;
                if self.state().hook_mask & MASK_CALL != 0 {
                    self.call_hook(HookEvent::Call, -1)?;
                }
                let n = f(self)?;
                let first = self.state().top - n;
                self.poscall(first)?;
                Ok(FrameAction::Native)
            }
        }
    }

    /// Move the fixed parameters of a vararg call above the actual
    /// arguments, building the compat `arg` table when asked to.
    fn adjust_varargs(&mut self, num_params: usize, is_vararg: u8, mut actual: usize) -> LuaResult<usize> {
        {
            let state = self.state_mut();
            while actual < num_params {
                state.push(LuaValue::Nil);
                actual += 1;
            }
        }
        let mut arg_table: Option<TableId> = None;
        if is_vararg & VARARG_NEEDSARG != 0 {
            let nvar = actual - num_params;
            self.check_gc()?;
            let t = self.new_table(nvar, 1)?;
            let top = self.state().top;
            for i in 0..nvar {
                let v = self.state().stack[top - nvar + i];
                self.table_raw_set_int(t, i as i64 + 1, v);
            }
            let n_key = self.create_string(b"n")?;
            self.table_raw_set(t, LuaValue::String(n_key), LuaValue::Number(nvar as f64))?;
            arg_table = Some(t);
        }
        let state = self.state_mut();
        let fixed = state.top - actual;
        let base = state.top;
        for i in 0..num_params {
            let v = state.stack[fixed + i];
            state.push(v);
            state.stack[fixed + i] = LuaValue::Nil;
        }
        if let Some(t) = arg_table {
            state.push(LuaValue::Table(t));
        }
        Ok(base)
    }

    /// Finish the running frame: copy results starting at `first` to the
    /// function slot, nil-padding up to the wanted count. Returns false when
    /// the caller wanted all results (`top` then marks their end).
    pub(crate) fn poscall(&mut self, mut first: usize) -> LuaResult<bool> {
        if self.state().hook_mask & MASK_RET != 0 {
            first = self.call_return_hooks(first)?;
        }
        let state = self.state_mut();
        let Some(ci) = state.call_stack.pop() else {
            return Ok(true);
        };
        let wanted = ci.nresults;
        let mut res = ci.func;
        let top = state.top;
        if wanted == LUA_MULTRET {
            while first < top {
                state.stack[res] = state.stack[first];
                res += 1;
                first += 1;
            }
        } else {
            let mut i = wanted;
            while i > 0 && first < top {
                state.stack[res] = state.stack[first];
                res += 1;
                first += 1;
                i -= 1;
            }
            while i > 0 {
                state.stack[res] = LuaValue::Nil;
                res += 1;
                i -= 1;
            }
        }
        state.top = res;
        // a returning call must not re-trigger the line hook of its caller
        let (caller_is_lua, caller_pc) = {
            let caller = state.ci();
            (caller.is_lua(), caller.saved_pc)
        };
        if caller_is_lua {
            state.old_pc = caller_pc.saturating_sub(1);
        }
        Ok(wanted != LUA_MULTRET)
    }

    /// Return hook, plus one per tail call folded into the frame.
    fn call_return_hooks(&mut self, first: usize) -> LuaResult<usize> {
        self.call_hook(HookEvent::Return, -1)?;
        let tailcalls = self.state().ci().tailcalls;
        for _ in 0..tailcalls {
            self.call_hook(HookEvent::TailReturn, -1)?;
        }
        Ok(first)
    }

    /// Call the value at `func` with the arguments above it (luaD_call).
    /// Results land at `func`; `top` marks their end.
    pub fn call_at(&mut self, func: usize, nresults: i32) -> LuaResult<()> {
        let outermost = self.current == self.main_thread && self.state().n_ccalls == 0;
        let result = self.call_inner(func, nresults);
        if result.is_err()
            && outermost
            && let Some(panic) = self.panic_handler
        {
            panic(self);
        }
        result
    }

    fn call_inner(&mut self, func: usize, nresults: i32) -> LuaResult<()> {
        let max_c_calls = self.safe_option.max_c_calls;
        let n_ccalls = {
            let state = self.state_mut();
            state.n_ccalls += 1;
            state.n_ccalls
        };
        if n_ccalls >= max_c_calls {
            let err = if n_ccalls == max_c_calls {
                Some(self.error("C stack overflow"))
            } else if n_ccalls >= max_c_calls + (max_c_calls >> 3) {
                Some(self.raise_error_in_error_handling())
            } else {
                None
            };
            if let Some(e) = err {
                self.state_mut().n_ccalls -= 1;
                return Err(e);
            }
        }
        let result = self.precall(func, nresults).and_then(|action| {
            if action == FrameAction::Lua {
                self.state_mut().ci_mut().call_status |= CIST_FRESH;
                lua_execute(self)?;
            }
            Ok(())
        });
        self.state_mut().n_ccalls -= 1;
        result?;
        self.check_gc()
    }

    /// Protected call (luaD_pcall). On error the frames above the call are
    /// discarded, upvalues above `func` closed and the error value left at
    /// `func`. `errfunc` is the stack slot of a message handler, 0 for none.
    pub(crate) fn pcall_at(&mut self, func: usize, nresults: i32, errfunc: usize) -> LuaStatus {
        let (old_depth, old_n_ccalls, old_errfunc, old_allow_hook) = {
            let state = self.state();
            (state.call_stack.len(), state.n_ccalls, state.errfunc, state.allow_hook)
        };
        self.state_mut().errfunc = errfunc;
        let result = self.call_inner(func, nresults);
        match result {
            Ok(()) => {
                self.state_mut().errfunc = old_errfunc;
                LuaStatus::Ok
            }
            Err(e) => {
                self.close_upvalues(func);
                let state = self.state_mut();
                let err_obj = std::mem::take(&mut state.error_object);
                state.stack[func] = err_obj;
                state.top = func + 1;
                state.call_stack.truncate(old_depth);
                state.n_ccalls = old_n_ccalls;
                state.errfunc = old_errfunc;
                state.allow_hook = old_allow_hook;
                state.shrink_stack();
                LuaStatus::from(e)
            }
        }
    }

    pub(crate) fn raise_error_in_error_handling(&mut self) -> LuaError {
        let value = match self.create_string(b"error in error handling") {
            Ok(s) => LuaValue::String(s),
            Err(_) => LuaValue::String(self.memerr_msg),
        };
        self.state_mut().error_object = value;
        LuaError::ErrorHandling
    }
}
