mod instruction;

pub use instruction::{Instruction, fb2int, int2fb};

/// Instruction format modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
}

/// How an operand field is used, for the verifier and the disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpArgMode {
    /// Not used
    N,
    /// Used as a plain number
    U,
    /// Register or jump offset
    R,
    /// Constant or register/constant
    K,
}

/// The 38 opcodes of Lua 5.1, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,  // R(A) := R(B)
    LoadK,     // R(A) := Kst(Bx)
    LoadBool,  // R(A) := (Bool)B; if (C) pc++
    LoadNil,   // R(A) := ... := R(B) := nil
    GetUpval,  // R(A) := UpValue[B]
    GetGlobal, // R(A) := Gbl[Kst(Bx)]
    GetTable,  // R(A) := R(B)[RK(C)]
    SetGlobal, // Gbl[Kst(Bx)] := R(A)
    SetUpval,  // UpValue[B] := R(A)
    SetTable,  // R(A)[RK(B)] := RK(C)
    NewTable,  // R(A) := {} (size = B,C)
    Self_,     // R(A+1) := R(B); R(A) := R(B)[RK(C)]
    Add,       // R(A) := RK(B) + RK(C)
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,      // R(A) := -R(B)
    Not,      // R(A) := not R(B)
    Len,      // R(A) := length of R(B)
    Concat,   // R(A) := R(B).. ... ..R(C)
    Jmp,      // pc+=sBx
    Eq,       // if ((RK(B) == RK(C)) ~= A) then pc++
    Lt,       // if ((RK(B) <  RK(C)) ~= A) then pc++
    Le,       // if ((RK(B) <= RK(C)) ~= A) then pc++
    Test,     // if not (R(A) <=> C) then pc++
    TestSet,  // if (R(B) <=> C) then R(A) := R(B) else pc++
    Call,     // R(A), ... ,R(A+C-2) := R(A)(R(A+1), ... ,R(A+B-1))
    TailCall, // return R(A)(R(A+1), ... ,R(A+B-1))
    Return,   // return R(A), ... ,R(A+B-2)
    ForLoop,  // R(A)+=R(A+2); if R(A) <?= R(A+1) then { pc+=sBx; R(A+3)=R(A) }
    ForPrep,  // R(A)-=R(A+2); pc+=sBx
    TForLoop, // R(A+3), ... ,R(A+2+C) := R(A)(R(A+1), R(A+2)); if R(A+3) ~= nil then R(A+2)=R(A+3) else pc++
    SetList,  // R(A)[(C-1)*FPF+i] := R(A+i), 1 <= i <= B
    Close,    // close all variables in the stack up to (>=) R(A)
    Closure,  // R(A) := closure(KPROTO[Bx], R(A), ... ,R(A+n))
    Vararg,   // R(A), R(A+1), ..., R(A+B-1) = vararg
}

pub const NUM_OPCODES: usize = 38;

use OpCode::*;

static OPCODES: [OpCode; NUM_OPCODES] = [
    Move, LoadK, LoadBool, LoadNil, GetUpval, GetGlobal, GetTable, SetGlobal, SetUpval, SetTable,
    NewTable, Self_, Add, Sub, Mul, Div, Mod, Pow, Unm, Not, Len, Concat, Jmp, Eq, Lt, Le, Test,
    TestSet, Call, TailCall, Return, ForLoop, ForPrep, TForLoop, SetList, Close, Closure, Vararg,
];

static OPNAMES: [&str; NUM_OPCODES] = [
    "MOVE", "LOADK", "LOADBOOL", "LOADNIL", "GETUPVAL", "GETGLOBAL", "GETTABLE", "SETGLOBAL",
    "SETUPVAL", "SETTABLE", "NEWTABLE", "SELF", "ADD", "SUB", "MUL", "DIV", "MOD", "POW", "UNM",
    "NOT", "LEN", "CONCAT", "JMP", "EQ", "LT", "LE", "TEST", "TESTSET", "CALL", "TAILCALL",
    "RETURN", "FORLOOP", "FORPREP", "TFORLOOP", "SETLIST", "CLOSE", "CLOSURE", "VARARG",
];

impl OpCode {
    #[inline(always)]
    pub fn from_u8(byte: u8) -> Option<Self> {
        OPCODES.get(byte as usize).copied()
    }

    pub fn name(self) -> &'static str {
        OPNAMES[self as usize]
    }

    /// Get the instruction format mode for this opcode
    pub fn get_mode(self) -> OpMode {
        match self {
            LoadK | GetGlobal | SetGlobal | Closure => OpMode::IABx,
            Jmp | ForLoop | ForPrep => OpMode::IAsBx,
            _ => OpMode::IABC,
        }
    }

    /// Operand modes of B and C.
    pub fn arg_modes(self) -> (OpArgMode, OpArgMode) {
        use OpArgMode as M;
        match self {
            Move | LoadNil | Unm | Not | Len => (M::R, M::N),
            LoadK | GetGlobal | SetGlobal => (M::K, M::N),
            LoadBool | NewTable | Call | TailCall | SetList => (M::U, M::U),
            GetUpval | SetUpval | Return | Closure | Vararg => (M::U, M::N),
            GetTable | Self_ => (M::R, M::K),
            SetTable | Add | Sub | Mul | Div | Mod | Pow | Eq | Lt | Le => (M::K, M::K),
            Concat => (M::R, M::R),
            Jmp | ForLoop | ForPrep => (M::R, M::N),
            Test | TestSet => (M::R, M::U),
            TForLoop => (M::N, M::U),
            Close => (M::N, M::N),
        }
    }

    /// Instruction writes register A.
    pub fn sets_a(self) -> bool {
        !matches!(
            self,
            SetGlobal | SetUpval | SetTable | Jmp | Eq | Lt | Le | Return | TForLoop | SetList | Close
        )
    }

    /// Instruction is a test: the next instruction must be a jump.
    pub fn is_test(self) -> bool {
        matches!(self, Eq | Lt | Le | Test | TestSet | TForLoop)
    }
}
