/*----------------------------------------------------------------------
  Lua 5.1 VM Execution Engine

  Design:
  1. **Index-Based**: registers are `base + n` indices into the running
     thread's stack; nothing holds a reference across an instruction, so
     stack reallocation needs no fixups
  2. **Flat Calls**: a call between Lua functions pushes a frame and
     re-enters the loop at 'newframe; only native boundaries recurse
  3. **Saved PC**: `ci.saved_pc` always points at the next instruction, so
     errors and hooks see the exact position

  Key Invariants:
  - `top == ci.top` inside a Lua frame, except right after an instruction
    that leaves a variable number of values (CALL/VARARG with multiple
    results), whose consumer resets it
  - GC only runs at NEWTABLE, CONCAT and CLOSURE after the result is stored,
    and at the end of native boundaries
----------------------------------------------------------------------*/

pub mod call;
mod closure_handler;
mod concat;
pub(crate) mod metamethod;
mod table_ops;

use crate::gc::{ChunkId, FunctionId};
use crate::lua_value::{LuaFunction, LuaValue};
use crate::lua_vm::call_info::call_status::CIST_TAIL;
use crate::lua_vm::debug_info::{MASK_COUNT, MASK_LINE};
use crate::lua_vm::lua_limits::{LFIELDS_PER_FLUSH, LUA_MULTRET};
use crate::lua_vm::{Instruction, LuaResult, LuaVM, OpCode, fb2int};
pub use call::FrameAction;
use metamethod::{Operand, arith_op, to_number};
pub use metamethod::TmKind;

#[inline(always)]
fn reg(vm: &LuaVM, slot: usize) -> LuaValue {
    vm.state().stack[slot]
}

#[inline(always)]
fn set_reg(vm: &mut LuaVM, slot: usize, v: LuaValue) {
    vm.state_mut().stack[slot] = v;
}

#[inline(always)]
fn constant(vm: &LuaVM, chunk: ChunkId, idx: usize) -> LuaValue {
    vm.pool.chunk(chunk).constants[idx]
}

/// RK(x): a constant when the RK bit is set, a register otherwise.
#[inline(always)]
fn rk(vm: &LuaVM, chunk: ChunkId, base: usize, x: u32) -> Operand {
    if Instruction::is_k(x) {
        Operand::new(constant(vm, chunk, Instruction::rk_index(x) as usize), None)
    } else {
        let slot = base + x as usize;
        Operand::new(reg(vm, slot), Some(slot))
    }
}

#[inline(always)]
fn fetch(vm: &LuaVM, chunk: ChunkId, pc: usize) -> Instruction {
    vm.pool.chunk(chunk).code[pc]
}

#[inline(always)]
fn jump(vm: &mut LuaVM, offset: i32) {
    let ci = vm.state_mut().ci_mut();
    ci.saved_pc = (ci.saved_pc as i64 + offset as i64) as usize;
}

/// Conditional jump: the next instruction is always a JMP; take it when
/// `cond` holds, skip it otherwise.
#[inline(always)]
fn cond_jump(vm: &mut LuaVM, chunk: ChunkId, cond: bool) {
    let next_pc = vm.state().ci().saved_pc;
    if cond {
        let sbx = fetch(vm, chunk, next_pc).get_sbx();
        jump(vm, sbx + 1);
    } else {
        jump(vm, 1);
    }
}

#[inline(always)]
fn closure_env_and_chunk(vm: &LuaVM, f: FunctionId) -> Option<ChunkId> {
    match vm.pool.function(f) {
        LuaFunction::Lua(cl) => Some(cl.chunk),
        LuaFunction::Native(_) => None,
    }
}

/// Run Lua frames of the running thread until a frame started fresh by a
/// native boundary returns (luaV_execute).
pub fn lua_execute(vm: &mut LuaVM) -> LuaResult<()> {
    'newframe: loop {
        let (base, func_id) = {
            let state = vm.state();
            let ci = state.ci();
            if !ci.is_lua() {
                return Ok(());
            }
            match state.stack[ci.func] {
                LuaValue::Function(f) => (ci.base, f),
                _ => return Err(vm.error("bad frame")),
            }
        };
        let Some(chunk) = closure_env_and_chunk(vm, func_id) else {
            return Err(vm.error("bad frame"));
        };

        loop {
            let pc = {
                let ci = vm.state_mut().ci_mut();
                let pc = ci.saved_pc;
                ci.saved_pc = pc + 1;
                pc
            };
            let instr = fetch(vm, chunk, pc);
            if vm.state().hook_mask & (MASK_LINE | MASK_COUNT) != 0 {
                vm.trace_exec(chunk, pc)?;
            }
            let Some(op) = instr.opcode() else {
                return Err(vm.error("bad opcode"));
            };
            let a = instr.get_a() as usize;
            let ra = base + a;

            match op {
                OpCode::Move => {
                    let v = reg(vm, base + instr.get_b() as usize);
                    set_reg(vm, ra, v);
                }
                OpCode::LoadK => {
                    let v = constant(vm, chunk, instr.get_bx() as usize);
                    set_reg(vm, ra, v);
                }
                OpCode::LoadBool => {
                    set_reg(vm, ra, LuaValue::Boolean(instr.get_b() != 0));
                    if instr.get_c() != 0 {
                        jump(vm, 1);
                    }
                }
                OpCode::LoadNil => {
                    let last = base + instr.get_b() as usize;
                    let state = vm.state_mut();
                    for slot in &mut state.stack[ra..=last] {
                        *slot = LuaValue::Nil;
                    }
                }
                OpCode::GetUpval => {
                    let v = match vm.pool.function(func_id) {
                        LuaFunction::Lua(cl) => cl.upvalues[instr.get_b() as usize],
                        LuaFunction::Native(_) => return Err(vm.error("bad frame")),
                    };
                    let v = vm.get_upvalue_value(v);
                    set_reg(vm, ra, v);
                }
                OpCode::GetGlobal => {
                    let env = vm.pool.function(func_id).env();
                    let key = constant(vm, chunk, instr.get_bx() as usize);
                    let v = vm.get_table_value(Operand::new(LuaValue::Table(env), None), key)?;
                    set_reg(vm, ra, v);
                }
                OpCode::GetTable => {
                    let b = base + instr.get_b() as usize;
                    let key = rk(vm, chunk, base, instr.get_c()).value;
                    let v = vm.get_table_value(Operand::new(reg(vm, b), Some(b)), key)?;
                    set_reg(vm, ra, v);
                }
                OpCode::SetGlobal => {
                    let env = vm.pool.function(func_id).env();
                    let key = constant(vm, chunk, instr.get_bx() as usize);
                    let v = reg(vm, ra);
                    vm.set_table_value(Operand::new(LuaValue::Table(env), None), key, v)?;
                }
                OpCode::SetUpval => {
                    let uv = match vm.pool.function(func_id) {
                        LuaFunction::Lua(cl) => cl.upvalues[instr.get_b() as usize],
                        LuaFunction::Native(_) => return Err(vm.error("bad frame")),
                    };
                    let v = reg(vm, ra);
                    vm.set_upvalue_value(uv, v);
                }
                OpCode::SetTable => {
                    let key = rk(vm, chunk, base, instr.get_b()).value;
                    let v = rk(vm, chunk, base, instr.get_c()).value;
                    vm.set_table_value(Operand::new(reg(vm, ra), Some(ra)), key, v)?;
                }
                OpCode::NewTable => {
                    let narray = fb2int(instr.get_b());
                    let nhash = fb2int(instr.get_c());
                    let t = vm.new_table(narray, nhash)?;
                    set_reg(vm, ra, LuaValue::Table(t));
                    vm.check_gc()?;
                }
                OpCode::Self_ => {
                    let b = base + instr.get_b() as usize;
                    let obj = reg(vm, b);
                    set_reg(vm, ra + 1, obj);
                    let key = rk(vm, chunk, base, instr.get_c()).value;
                    let v = vm.get_table_value(Operand::new(obj, Some(b)), key)?;
                    set_reg(vm, ra, v);
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Pow => {
                    let tm = match op {
                        OpCode::Add => TmKind::Add,
                        OpCode::Sub => TmKind::Sub,
                        OpCode::Mul => TmKind::Mul,
                        OpCode::Div => TmKind::Div,
                        OpCode::Mod => TmKind::Mod,
                        _ => TmKind::Pow,
                    };
                    let rb = rk(vm, chunk, base, instr.get_b());
                    let rc = rk(vm, chunk, base, instr.get_c());
                    let v = match (rb.value, rc.value) {
                        (LuaValue::Number(x), LuaValue::Number(y)) => {
                            LuaValue::Number(arith_op(tm, x, y))
                        }
                        _ => vm.arith(rb, rc, tm)?,
                    };
                    set_reg(vm, ra, v);
                }
                OpCode::Unm => {
                    let b = base + instr.get_b() as usize;
                    let v = match reg(vm, b) {
                        LuaValue::Number(n) => LuaValue::Number(-n),
                        other => {
                            let rb = Operand::new(other, Some(b));
                            vm.arith(rb, rb, TmKind::Unm)?
                        }
                    };
                    set_reg(vm, ra, v);
                }
                OpCode::Not => {
                    let v = reg(vm, base + instr.get_b() as usize);
                    set_reg(vm, ra, LuaValue::Boolean(v.is_falsy()));
                }
                OpCode::Len => {
                    let b = base + instr.get_b() as usize;
                    let v = match reg(vm, b) {
                        LuaValue::Table(t) => LuaValue::Number(vm.pool.table(t).length() as f64),
                        LuaValue::String(s) => LuaValue::Number(vm.pool.string(s).len() as f64),
                        other => vm.obj_len_tm(Operand::new(other, Some(b)))?,
                    };
                    set_reg(vm, ra, v);
                }
                OpCode::Concat => {
                    let b = instr.get_b() as usize;
                    let c = instr.get_c() as usize;
                    vm.concat(c - b + 1, base + c)?;
                    let v = reg(vm, base + b);
                    set_reg(vm, ra, v);
                    vm.check_gc()?;
                }
                OpCode::Jmp => jump(vm, instr.get_sbx()),
                OpCode::Eq => {
                    let rb = rk(vm, chunk, base, instr.get_b()).value;
                    let rc = rk(vm, chunk, base, instr.get_c()).value;
                    let res = vm.equal_values(rb, rc)?;
                    cond_jump(vm, chunk, res == (a != 0));
                }
                OpCode::Lt => {
                    let rb = rk(vm, chunk, base, instr.get_b()).value;
                    let rc = rk(vm, chunk, base, instr.get_c()).value;
                    let res = vm.less_than_values(rb, rc)?;
                    cond_jump(vm, chunk, res == (a != 0));
                }
                OpCode::Le => {
                    let rb = rk(vm, chunk, base, instr.get_b()).value;
                    let rc = rk(vm, chunk, base, instr.get_c()).value;
                    let res = vm.less_equal_values(rb, rc)?;
                    cond_jump(vm, chunk, res == (a != 0));
                }
                OpCode::Test => {
                    let v = reg(vm, ra);
                    cond_jump(vm, chunk, v.is_falsy() != (instr.get_c() != 0));
                }
                OpCode::TestSet => {
                    let v = reg(vm, base + instr.get_b() as usize);
                    let cond = v.is_falsy() != (instr.get_c() != 0);
                    if cond {
                        set_reg(vm, ra, v);
                    }
                    cond_jump(vm, chunk, cond);
                }
                OpCode::Call => {
                    let b = instr.get_b() as usize;
                    let nresults = instr.get_c() as i32 - 1;
                    if b != 0 {
                        vm.state_mut().top = ra + b;
                    }
                    match vm.precall(ra, nresults)? {
                        FrameAction::Lua => continue 'newframe,
                        FrameAction::Native => {
                            if nresults >= 0 {
                                let state = vm.state_mut();
                                state.top = state.ci().top;
                            }
                        }
                    }
                }
                OpCode::TailCall => {
                    let b = instr.get_b() as usize;
                    if b != 0 {
                        vm.state_mut().top = ra + b;
                    }
                    match vm.precall(ra, LUA_MULTRET)? {
                        FrameAction::Lua => {
                            let new_ci = {
                                let state = vm.state_mut();
                                match state.call_stack.pop() {
                                    Some(ci) => ci,
                                    None => return Err(vm.error("bad frame")),
                                }
                            };
                            vm.close_upvalues(base);
                            let state = vm.state_mut();
                            let func = state.ci().func;
                            let pfunc = new_ci.func;
                            let top = state.top;
                            state.stack.copy_within(pfunc..top, func);
                            let new_top = func + (top - pfunc);
                            state.top = new_top;
                            let ci = state.ci_mut();
                            ci.base = func + (new_ci.base - pfunc);
                            ci.top = new_top;
                            ci.saved_pc = new_ci.saved_pc;
                            ci.tailcalls += 1;
                            ci.call_status |= CIST_TAIL;
                            continue 'newframe;
                        }
                        FrameAction::Native => {}
                    }
                }
                OpCode::Return => {
                    let b = instr.get_b() as usize;
                    if b != 0 {
                        vm.state_mut().top = ra + b - 1;
                    }
                    vm.close_upvalues(base);
                    let fresh = vm.state().ci().is_fresh();
                    let fixed = vm.poscall(ra)?;
                    if fresh {
                        return Ok(());
                    }
                    if fixed {
                        let state = vm.state_mut();
                        state.top = state.ci().top;
                    }
                    continue 'newframe;
                }
                OpCode::ForLoop => {
                    let (idx, limit, step) = {
                        let stack = &vm.state().stack;
                        (
                            stack[ra].as_number().unwrap_or(f64::NAN),
                            stack[ra + 1].as_number().unwrap_or(f64::NAN),
                            stack[ra + 2].as_number().unwrap_or(f64::NAN),
                        )
                    };
                    let idx = idx + step;
                    let continues = if 0.0 < step { idx <= limit } else { limit <= idx };
                    if continues {
                        jump(vm, instr.get_sbx());
                        set_reg(vm, ra, LuaValue::Number(idx));
                        set_reg(vm, ra + 3, LuaValue::Number(idx));
                    }
                }
                OpCode::ForPrep => {
                    let Some(init) = to_number(vm, &reg(vm, ra)) else {
                        return Err(vm.error("'for' initial value must be a number"));
                    };
                    let Some(limit) = to_number(vm, &reg(vm, ra + 1)) else {
                        return Err(vm.error("'for' limit must be a number"));
                    };
                    let Some(step) = to_number(vm, &reg(vm, ra + 2)) else {
                        return Err(vm.error("'for' step must be a number"));
                    };
                    set_reg(vm, ra, LuaValue::Number(init - step));
                    set_reg(vm, ra + 1, LuaValue::Number(limit));
                    set_reg(vm, ra + 2, LuaValue::Number(step));
                    jump(vm, instr.get_sbx());
                }
                OpCode::TForLoop => {
                    let cb = ra + 3;
                    {
                        let state = vm.state_mut();
                        state.stack[cb + 2] = state.stack[ra + 2];
                        state.stack[cb + 1] = state.stack[ra + 1];
                        state.stack[cb] = state.stack[ra];
                        state.top = cb + 3;
                    }
                    vm.call_at(cb, instr.get_c() as i32)?;
                    let state = vm.state_mut();
                    state.top = state.ci().top;
                    let control = state.stack[cb];
                    if !control.is_nil() {
                        state.stack[cb - 1] = control;
                        cond_jump(vm, chunk, true);
                    } else {
                        jump(vm, 1);
                    }
                }
                OpCode::SetList => {
                    let mut n = instr.get_b() as usize;
                    let mut c = instr.get_c() as usize;
                    if n == 0 {
                        let state = vm.state_mut();
                        n = state.top - ra - 1;
                        state.top = state.ci().top;
                    }
                    if c == 0 {
                        let next_pc = vm.state().ci().saved_pc;
                        c = fetch(vm, chunk, next_pc).as_u32() as usize;
                        jump(vm, 1);
                    }
                    let LuaValue::Table(t) = reg(vm, ra) else {
                        return Err(vm.error("SETLIST target is not a table"));
                    };
                    let mut last = (c - 1) * LFIELDS_PER_FLUSH + n;
                    if last > vm.pool.table(t).array_size() {
                        vm.grow_table_array(t, last)?;
                    }
                    while n > 0 {
                        let v = reg(vm, ra + n);
                        vm.table_raw_set_int(t, last as i64, v);
                        last -= 1;
                        n -= 1;
                    }
                }
                OpCode::Close => vm.close_upvalues(ra),
                OpCode::Closure => {
                    let proto = vm.pool.chunk(chunk).child_protos[instr.get_bx() as usize];
                    let nup = vm.pool.chunk(proto).upvalue_count as usize;
                    let env = vm.pool.function(func_id).env();
                    let mut upvalues = Vec::with_capacity(nup);
                    for _ in 0..nup {
                        let next_pc = vm.state().ci().saved_pc;
                        let pseudo = fetch(vm, chunk, next_pc);
                        jump(vm, 1);
                        let b = pseudo.get_b() as usize;
                        let uv = if pseudo.opcode() == Some(OpCode::Move) {
                            vm.find_upvalue(base + b)?
                        } else {
                            match vm.pool.function(func_id) {
                                LuaFunction::Lua(cl) => cl.upvalues[b],
                                LuaFunction::Native(_) => return Err(vm.error("bad frame")),
                            }
                        };
                        upvalues.push(uv);
                    }
                    let f = vm.create_lua_closure(proto, upvalues, env)?;
                    set_reg(vm, ra, LuaValue::Function(f));
                    vm.check_gc()?;
                }
                OpCode::Vararg => {
                    let (n, wanted) = {
                        let state = vm.state();
                        let num_params = vm.pool.chunk(chunk).param_count as usize;
                        let n = (base - state.ci().func - 1).saturating_sub(num_params);
                        (n, instr.get_b() as i32 - 1)
                    };
                    let count = if wanted == LUA_MULTRET {
                        vm.check_stack_or_error(n)?;
                        vm.state_mut().top = ra + n;
                        n
                    } else {
                        wanted as usize
                    };
                    let state = vm.state_mut();
                    for j in 0..count {
                        state.stack[ra + j] = if j < n {
                            state.stack[base - n + j]
                        } else {
                            LuaValue::Nil
                        };
                    }
                }
            }
        }
    }
}
