// Structural bytecode verifier.
//
// Loaded chunks come from outside the runtime, so before any of them runs we
// check every operand against the prototype's bounds: registers below
// `max_stack_size`, constants, upvalues and nested prototypes in range,
// jumps landing inside the code. The interpreter relies on these checks and
// does not repeat them.

use crate::lua_value::chunk_serializer::{ChunkData, Constant};
use crate::lua_value::lua_table::MAXASIZE;
use crate::lua_value::{VARARG_HASARG, VARARG_ISVARARG, VARARG_NEEDSARG};
use crate::lua_vm::lua_limits::{LFIELDS_PER_FLUSH, MAXSTACK};
use crate::lua_vm::opcode::{OpArgMode, OpCode, OpMode};
use crate::Instruction;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} at pc {pc}")]
pub struct VerifyError {
    pub pc: usize,
    pub reason: &'static str,
}

fn fail<T>(pc: usize, reason: &'static str) -> Result<T, VerifyError> {
    Err(VerifyError { pc, reason })
}

/// Verify `chunk` and all of its nested prototypes.
pub fn check_chunk(chunk: &ChunkData) -> Result<(), VerifyError> {
    check_header(chunk)?;
    check_code(chunk)?;
    for proto in &chunk.protos {
        check_chunk(proto)?;
    }
    Ok(())
}

fn check_header(f: &ChunkData) -> Result<(), VerifyError> {
    if f.max_stack_size as usize > MAXSTACK {
        return fail(0, "frame too large");
    }
    let hasarg = (f.is_vararg & VARARG_HASARG != 0) as usize;
    if f.param_count as usize + hasarg > f.max_stack_size as usize {
        return fail(0, "too many parameters");
    }
    if f.is_vararg & VARARG_NEEDSARG != 0 && f.is_vararg & VARARG_HASARG == 0 {
        return fail(0, "inconsistent vararg flags");
    }
    if f.upvalue_names.len() > f.upvalue_count as usize {
        return fail(0, "too many upvalue names");
    }
    if !f.line_info.is_empty() && f.line_info.len() != f.code.len() {
        return fail(0, "line info size mismatch");
    }
    match f.code.last().and_then(|i| i.opcode()) {
        Some(OpCode::Return) => Ok(()),
        _ => fail(f.code.len(), "code does not end with RETURN"),
    }
}

struct Checker<'a> {
    f: &'a ChunkData,
}

impl Checker<'_> {
    fn reg(&self, pc: usize, r: u32) -> Result<(), VerifyError> {
        if (r as usize) < self.f.max_stack_size as usize {
            Ok(())
        } else {
            fail(pc, "register out of range")
        }
    }

    fn arg(&self, pc: usize, r: u32, mode: OpArgMode) -> Result<(), VerifyError> {
        match mode {
            OpArgMode::N if r != 0 => fail(pc, "unused operand is not zero"),
            OpArgMode::N | OpArgMode::U => Ok(()),
            OpArgMode::R => self.reg(pc, r),
            OpArgMode::K => {
                if Instruction::is_k(r) {
                    self.constant(pc, Instruction::rk_index(r))
                } else {
                    self.reg(pc, r)
                }
            }
        }
    }

    fn constant(&self, pc: usize, k: u32) -> Result<(), VerifyError> {
        if (k as usize) < self.f.constants.len() {
            Ok(())
        } else {
            fail(pc, "constant out of range")
        }
    }

    /// Jump target must be inside the code and must not land on the raw
    /// count word following a SETLIST with C == 0.
    fn jump(&self, pc: usize, dest: i64) -> Result<(), VerifyError> {
        if dest < 0 || dest as usize >= self.f.code.len() {
            return fail(pc, "jump out of range");
        }
        let dest = dest as usize;
        if dest > 0 {
            let prev = self.f.code[dest - 1];
            if prev.opcode() == Some(OpCode::SetList) && prev.get_c() == 0 {
                return fail(pc, "jump into SETLIST operand");
            }
        }
        Ok(())
    }
}

fn check_code(f: &ChunkData) -> Result<(), VerifyError> {
    let ck = Checker { f };
    let code = &f.code;
    let nups = f.upvalue_count as u32;
    let mut pc = 0;
    while pc < code.len() {
        let i = code[pc];
        let Some(op) = i.opcode() else {
            return fail(pc, "invalid opcode");
        };
        let a = i.get_a();
        ck.reg(pc, a)?;
        let (bmode, cmode) = op.arg_modes();
        match op.get_mode() {
            OpMode::IABC => {
                ck.arg(pc, i.get_b(), bmode)?;
                ck.arg(pc, i.get_c(), cmode)?;
            }
            OpMode::IABx => {
                if bmode == OpArgMode::K {
                    ck.constant(pc, i.get_bx())?;
                }
            }
            OpMode::IAsBx => {
                ck.jump(pc, pc as i64 + 1 + i.get_sbx() as i64)?;
            }
        }
        if op.is_test() {
            match code.get(pc + 1).and_then(|n| n.opcode()) {
                Some(OpCode::Jmp) => {}
                _ => return fail(pc, "test not followed by a jump"),
            }
        }
        match op {
            OpCode::LoadNil => {
                if i.get_b() < a {
                    return fail(pc, "LOADNIL range is empty");
                }
            }
            OpCode::LoadBool => {
                if i.get_c() != 0 && pc + 2 >= code.len() {
                    return fail(pc, "LOADBOOL skips past the end");
                }
            }
            OpCode::GetUpval | OpCode::SetUpval => {
                if i.get_b() >= nups {
                    return fail(pc, "upvalue out of range");
                }
            }
            OpCode::GetGlobal | OpCode::SetGlobal => {
                if !matches!(f.constants[i.get_bx() as usize], Constant::String(_)) {
                    return fail(pc, "global name is not a string");
                }
            }
            OpCode::Self_ => ck.reg(pc, a + 1)?,
            OpCode::Concat => {
                if i.get_b() >= i.get_c() {
                    return fail(pc, "empty concatenation");
                }
            }
            OpCode::TForLoop => {
                if i.get_c() < 1 {
                    return fail(pc, "generic for without variables");
                }
                ck.reg(pc, a + 2 + i.get_c())?;
            }
            OpCode::ForLoop | OpCode::ForPrep => ck.reg(pc, a + 3)?,
            OpCode::Call | OpCode::TailCall => {
                let b = i.get_b();
                if b != 0 {
                    ck.reg(pc, a + b - 1)?;
                }
                let c = i.get_c();
                if c > 1 {
                    ck.reg(pc, a + c - 2)?;
                }
            }
            OpCode::Return => {
                let b = i.get_b();
                if b > 1 {
                    ck.reg(pc, a + b - 2)?;
                }
            }
            OpCode::SetList => {
                if i.get_b() > 0 {
                    ck.reg(pc, a + i.get_b())?;
                }
                // C == 0 takes the batch number from the next raw word
                let (batch, skip) = match i.get_c() {
                    0 => match code.get(pc + 1) {
                        Some(word) => (word.as_u32() as usize, 1),
                        None => return fail(pc, "missing SETLIST count"),
                    },
                    c => (c as usize, 0),
                };
                if batch == 0 {
                    return fail(pc, "SETLIST batch is zero");
                }
                let last = (batch - 1).saturating_mul(LFIELDS_PER_FLUSH).saturating_add(i.get_b() as usize);
                if last > MAXASIZE {
                    return fail(pc, "SETLIST past the largest array");
                }
                pc += skip;
            }
            OpCode::Closure => {
                let bx = i.get_bx() as usize;
                let Some(proto) = f.protos.get(bx) else {
                    return fail(pc, "prototype out of range");
                };
                let nup = proto.upvalue_count as usize;
                if pc + nup >= code.len() {
                    return fail(pc, "missing closure upvalue descriptors");
                }
                for j in 1..=nup {
                    let d = code[pc + j];
                    match d.opcode() {
                        Some(OpCode::GetUpval) if d.get_b() < nups => {}
                        Some(OpCode::Move) if d.get_b() < f.max_stack_size as u32 => {}
                        _ => return fail(pc + j, "bad closure upvalue descriptor"),
                    }
                }
                pc += nup;
            }
            OpCode::Vararg => {
                if f.is_vararg & VARARG_ISVARARG == 0 {
                    return fail(pc, "VARARG in non-vararg function");
                }
                let b = i.get_b();
                if b > 1 {
                    ck.reg(pc, a + b - 2)?;
                }
            }
            _ => {}
        }
        pc += 1;
    }
    Ok(())
}
