pub mod test_baselib;
pub mod test_chunk;
pub mod test_coroutine;
pub mod test_errors;
pub mod test_gc;
pub mod test_stack;

use crate::lua_value::chunk_serializer::{ChunkData, Constant, LocVarData};
use crate::lua_value::VARARG_ISVARARG;
use crate::lua_vm::lua_limits::LUA_MULTRET;
use crate::*;

/// VM with the base and coroutine libraries open.
pub(crate) fn new_vm() -> LuaVM {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    vm
}

/// Prototype assembler. Every instruction gets a line number (its pc + 1
/// unless given) so that error messages carry positions.
pub(crate) struct Asm {
    data: ChunkData,
}

impl Asm {
    pub fn new(max_stack: u8) -> Self {
        Asm {
            data: ChunkData {
                source: Some(b"@test.lua".to_vec()),
                max_stack_size: max_stack,
                ..Default::default()
            },
        }
    }

    /// Nested prototype; inherits the parent's source.
    pub fn function(max_stack: u8, params: u8) -> Self {
        let mut asm = Asm::new(max_stack);
        asm.data.source = None;
        asm.data.param_count = params;
        asm.data.linedefined = 1;
        asm.data.lastlinedefined = 1;
        asm
    }

    pub fn vararg(mut self) -> Self {
        self.data.is_vararg = VARARG_ISVARARG;
        self
    }

    pub fn upvalues(mut self, n: u8) -> Self {
        self.data.upvalue_count = n;
        self
    }

    pub fn local(&mut self, name: &str, startpc: u32, endpc: u32) {
        self.data.locals.push(LocVarData {
            name: name.as_bytes().to_vec(),
            startpc,
            endpc,
        });
    }

    fn constant(&mut self, k: Constant) -> u32 {
        if let Some(i) = self.data.constants.iter().position(|c| *c == k) {
            return i as u32;
        }
        self.data.constants.push(k);
        self.data.constants.len() as u32 - 1
    }

    /// Constant index of a string
    pub fn ks(&mut self, s: &str) -> u32 {
        self.constant(Constant::String(s.as_bytes().to_vec()))
    }

    /// Constant index of a number
    pub fn kn(&mut self, n: f64) -> u32 {
        self.constant(Constant::Number(n))
    }

    /// RK operand naming a string constant
    pub fn rks(&mut self, s: &str) -> u32 {
        Instruction::rk_const(self.ks(s))
    }

    /// RK operand naming a number constant
    pub fn rkn(&mut self, n: f64) -> u32 {
        Instruction::rk_const(self.kn(n))
    }

    pub fn child(&mut self, proto: ChunkData) -> u32 {
        self.data.protos.push(proto);
        self.data.protos.len() as u32 - 1
    }

    pub fn pc(&self) -> usize {
        self.data.code.len()
    }

    pub fn emit(&mut self, i: Instruction) -> usize {
        let line = self.data.code.len() as u32 + 1;
        self.emit_at(i, line)
    }

    pub fn emit_at(&mut self, i: Instruction, line: u32) -> usize {
        self.data.code.push(i);
        self.data.line_info.push(line);
        self.data.code.len() - 1
    }

    pub fn abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> usize {
        self.emit(Instruction::abc(op, a, b, c))
    }

    pub fn abx(&mut self, op: OpCode, a: u32, bx: u32) -> usize {
        self.emit(Instruction::abx(op, a, bx))
    }

    pub fn asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> usize {
        self.emit(Instruction::asbx(op, a, sbx))
    }

    pub fn build(self) -> ChunkData {
        self.data
    }
}

/// Load `chunk` and run it protected, leaving its results (or the error
/// value) on the stack.
pub(crate) fn run(vm: &mut LuaVM, chunk: &ChunkData) -> LuaStatus {
    let status = vm.load_prototype(chunk);
    assert_eq!(status, LuaStatus::Ok, "{:?}", vm.to_str(-1).ok().flatten());
    vm.pcall(0, LUA_MULTRET, 0)
}

/// String at `idx`, panicking when there is none.
pub(crate) fn string_at(vm: &mut LuaVM, idx: i32) -> String {
    vm.to_str(idx).unwrap().unwrap().to_string()
}

/// Run `chunk` and return its error message.
pub(crate) fn run_error(vm: &mut LuaVM, chunk: &ChunkData) -> String {
    let status = run(vm, chunk);
    assert_eq!(status, LuaStatus::ErrRun);
    string_at(vm, -1)
}
