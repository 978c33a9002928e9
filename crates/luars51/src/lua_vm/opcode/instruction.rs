/*----------------------------------------------------------------------
  Lua 5.1 instruction layout (32-bit, unsigned):

        3 3 2 2 2 2 2 2 2 2 2 2 1 1 1 1 1 1 1 1 1 1 0 0 0 0 0 0 0 0 0 0
        1 0 9 8 7 6 5 4 3 2 1 0 9 8 7 6 5 4 3 2 1 0 9 8 7 6 5 4 3 2 1 0
  iABC       B(9)        |       C(9)        |     A(8)      |   Op(6)   |
  iABx                 Bx(18)                |     A(8)      |   Op(6)   |
  iAsBx               sBx(18)                |     A(8)      |   Op(6)   |

  sBx is stored in excess-K form: sBx = Bx - MAXARG_sBx.
----------------------------------------------------------------------*/

use crate::OpCode;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction(u32);

impl Instruction {
    #[inline(always)]
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    #[inline(always)]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const SIZE_OP: u32 = 6;
    pub const SIZE_A: u32 = 8;
    pub const SIZE_B: u32 = 9;
    pub const SIZE_C: u32 = 9;
    pub const SIZE_BX: u32 = Self::SIZE_C + Self::SIZE_B; // 18

    pub const POS_OP: u32 = 0;
    pub const POS_A: u32 = Self::POS_OP + Self::SIZE_OP; // 6
    pub const POS_C: u32 = Self::POS_A + Self::SIZE_A; // 14
    pub const POS_B: u32 = Self::POS_C + Self::SIZE_C; // 23
    pub const POS_BX: u32 = Self::POS_C;

    pub const MAX_A: u32 = (1 << Self::SIZE_A) - 1;
    pub const MAX_B: u32 = (1 << Self::SIZE_B) - 1;
    pub const MAX_C: u32 = (1 << Self::SIZE_C) - 1;
    pub const MAX_BX: u32 = (1 << Self::SIZE_BX) - 1;
    pub const MAX_SBX: i32 = (Self::MAX_BX >> 1) as i32; // 131071

    /// Bit marking an RK operand as a constant index.
    pub const BITRK: u32 = 1 << (Self::SIZE_B - 1);
    pub const MAXINDEXRK: u32 = Self::BITRK - 1;

    #[inline(always)]
    const fn mask1(n: u32, p: u32) -> u32 {
        (!((!0u32) << n)) << p
    }

    #[inline(always)]
    const fn get_arg(self, pos: u32, size: u32) -> u32 {
        (self.0 >> pos) & Self::mask1(size, 0)
    }

    #[inline(always)]
    fn set_arg(&mut self, v: u32, pos: u32, size: u32) {
        self.0 = (self.0 & !Self::mask1(size, pos)) | ((v << pos) & Self::mask1(size, pos));
    }

    /// Raw 6-bit opcode field.
    #[inline(always)]
    pub const fn opcode_byte(self) -> u8 {
        self.get_arg(Self::POS_OP, Self::SIZE_OP) as u8
    }

    /// Decoded opcode, `None` for the unused encodings 38..63.
    #[inline(always)]
    pub fn opcode(self) -> Option<OpCode> {
        OpCode::from_u8(self.opcode_byte())
    }

    #[inline(always)]
    pub fn set_opcode(&mut self, op: OpCode) {
        self.set_arg(op as u32, Self::POS_OP, Self::SIZE_OP);
    }

    #[inline(always)]
    pub const fn get_a(self) -> u32 {
        self.get_arg(Self::POS_A, Self::SIZE_A)
    }

    #[inline(always)]
    pub fn set_a(&mut self, v: u32) {
        self.set_arg(v, Self::POS_A, Self::SIZE_A);
    }

    #[inline(always)]
    pub const fn get_b(self) -> u32 {
        self.get_arg(Self::POS_B, Self::SIZE_B)
    }

    #[inline(always)]
    pub fn set_b(&mut self, v: u32) {
        self.set_arg(v, Self::POS_B, Self::SIZE_B);
    }

    #[inline(always)]
    pub const fn get_c(self) -> u32 {
        self.get_arg(Self::POS_C, Self::SIZE_C)
    }

    #[inline(always)]
    pub fn set_c(&mut self, v: u32) {
        self.set_arg(v, Self::POS_C, Self::SIZE_C);
    }

    #[inline(always)]
    pub const fn get_bx(self) -> u32 {
        self.get_arg(Self::POS_BX, Self::SIZE_BX)
    }

    #[inline(always)]
    pub fn set_bx(&mut self, v: u32) {
        self.set_arg(v, Self::POS_BX, Self::SIZE_BX);
    }

    #[inline(always)]
    pub const fn get_sbx(self) -> i32 {
        self.get_bx() as i32 - Self::MAX_SBX
    }

    #[inline(always)]
    pub fn set_sbx(&mut self, v: i32) {
        self.set_bx((v + Self::MAX_SBX) as u32);
    }

    // Instruction creation
    pub const fn abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        Self(
            ((op as u32) << Self::POS_OP)
                | (a << Self::POS_A)
                | (b << Self::POS_B)
                | (c << Self::POS_C),
        )
    }

    pub const fn abx(op: OpCode, a: u32, bx: u32) -> Self {
        Self(((op as u32) << Self::POS_OP) | (a << Self::POS_A) | (bx << Self::POS_BX))
    }

    pub const fn asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        Self::abx(op, a, (sbx + Self::MAX_SBX) as u32)
    }

    // RK(x): constant index when BITRK is set, register otherwise
    #[inline(always)]
    pub const fn is_k(x: u32) -> bool {
        x & Self::BITRK != 0
    }

    #[inline(always)]
    pub const fn rk_index(x: u32) -> u32 {
        x & !Self::BITRK
    }

    /// Encode constant index `k` as an RK operand.
    #[inline(always)]
    pub const fn rk_const(k: u32) -> u32 {
        k | Self::BITRK
    }
}

/// Decode a "floating point byte" (`eeeeexxx`) used by NEWTABLE size hints.
pub fn fb2int(x: u32) -> usize {
    let e = (x >> 3) & 0x1f;
    if e == 0 {
        x as usize
    } else {
        ((x as usize & 7) + 8) << (e - 1)
    }
}

/// Encode `x` as a floating point byte, rounding up.
pub fn int2fb(mut x: u32) -> u32 {
    let mut e = 0;
    while x >= 16 {
        x = (x + 1) >> 1;
        e += 1;
    }
    if x < 8 { x } else { ((e + 1) << 3) | (x - 8) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::opcode::{OpArgMode, OpMode};

    #[test]
    fn test_instruction_abc() {
        let instr = Instruction::abc(OpCode::Move, 1, 2, 3);
        assert_eq!(instr.opcode(), Some(OpCode::Move));
        assert_eq!(instr.get_a(), 1);
        assert_eq!(instr.get_b(), 2);
        assert_eq!(instr.get_c(), 3);
    }

    #[test]
    fn test_instruction_abx() {
        let instr = Instruction::abx(OpCode::LoadK, 3, 100);
        assert_eq!(instr.opcode(), Some(OpCode::LoadK));
        assert_eq!(instr.get_a(), 3);
        assert_eq!(instr.get_bx(), 100);
    }

    #[test]
    fn test_signed_arguments() {
        let back = Instruction::asbx(OpCode::ForLoop, 2, -50);
        assert_eq!(back.get_a(), 2);
        assert_eq!(back.get_sbx(), -50);
        let fwd = Instruction::asbx(OpCode::Jmp, 0, Instruction::MAX_SBX);
        assert_eq!(fwd.get_sbx(), 131071);
    }

    #[test]
    fn test_bit_layout() {
        let raw = Instruction::abc(OpCode::Add, 10, 300, 20).as_u32();
        assert_eq!(raw & 0x3F, OpCode::Add as u32);
        assert_eq!((raw >> 6) & 0xFF, 10);
        assert_eq!((raw >> 14) & 0x1FF, 20);
        assert_eq!((raw >> 23) & 0x1FF, 300);
    }

    #[test]
    fn test_boundaries() {
        let instr = Instruction::abc(
            OpCode::Vararg,
            Instruction::MAX_A,
            Instruction::MAX_B,
            Instruction::MAX_C,
        );
        assert_eq!(instr.opcode(), Some(OpCode::Vararg));
        assert_eq!(instr.get_a(), 255);
        assert_eq!(instr.get_b(), 511);
        assert_eq!(instr.get_c(), 511);
        assert_eq!(Instruction::from_u32(63).opcode(), None);
    }

    #[test]
    fn test_set_fields() {
        let mut instr = Instruction::abc(OpCode::Move, 1, 2, 3);
        instr.set_a(10);
        instr.set_b(20);
        instr.set_c(30);
        assert_eq!((instr.get_a(), instr.get_b(), instr.get_c()), (10, 20, 30));
        instr.set_opcode(OpCode::Concat);
        assert_eq!(instr.opcode(), Some(OpCode::Concat));
        instr.set_sbx(-7);
        assert_eq!(instr.get_sbx(), -7);
        assert_eq!(instr.get_a(), 10);
    }

    #[test]
    fn test_rk_operands() {
        assert!(Instruction::is_k(Instruction::rk_const(5)));
        assert_eq!(Instruction::rk_index(Instruction::rk_const(5)), 5);
        assert!(!Instruction::is_k(255));
    }

    #[test]
    fn test_floating_byte() {
        for n in [0u32, 1, 7, 8, 15, 16, 100, 1000] {
            assert!(fb2int(int2fb(n)) >= n as usize);
        }
        assert_eq!(fb2int(int2fb(8)), 8);
    }

    #[test]
    fn test_opcode_modes() {
        assert_eq!(OpCode::from_u8(37), Some(OpCode::Vararg));
        assert_eq!(OpCode::from_u8(38), None);
        assert_eq!(OpCode::GetGlobal.get_mode(), OpMode::IABx);
        assert_eq!(OpCode::Jmp.get_mode(), OpMode::IAsBx);
        assert_eq!(OpCode::Call.get_mode(), OpMode::IABC);
        assert_eq!(OpCode::Add.arg_modes(), (OpArgMode::K, OpArgMode::K));
        assert!(OpCode::Lt.is_test());
        assert!(!OpCode::SetTable.sets_a());
        assert_eq!(OpCode::TForLoop.name(), "TFORLOOP");
    }
}
