// ============ GC Header ============

use crate::lua_value::{Chunk, LuaFunction, LuaString, LuaUpvalue, LuaUserdata};
use crate::lua_value::LuaTable;
use crate::lua_vm::LuaState;

// Bit positions in the `marked` field (port of lgc.h, Lua 5.1)
pub const WHITE0BIT: u8 = 0; // Object is white (type 0)
pub const WHITE1BIT: u8 = 1; // Object is white (type 1)
pub const BLACKBIT: u8 = 2; // Object is black
pub const FINALIZEDBIT: u8 = 3; // Userdata already finalized (or queued)
pub const KEYWEAKBIT: u8 = 4; // Table has weak keys
pub const VALUEWEAKBIT: u8 = 5; // Table has weak values
pub const FIXEDBIT: u8 = 6; // Object is never collected

pub const WHITEBITS: u8 = (1 << WHITE0BIT) | (1 << WHITE1BIT);
pub const WEAKBITS: u8 = (1 << KEYWEAKBIT) | (1 << VALUEWEAKBIT);

/// Kind of heap object. Never changes after allocation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    String,
    Table,
    Function,
    Upvalue,
    Userdata,
    Thread,
    Chunk,
}

/// GC object header, one per heap object.
///
/// Bit layout of `marked`:
/// - Bits 0-1: the two whites; exactly one is "current" per cycle
/// - Bit 2: BLACK
/// - Bit 3: FINALIZED
/// - Bits 4-5: weak key / weak value (tables only)
/// - Bit 6: FIXED
///
/// Gray is implicit: neither white nor black.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcHeader {
    pub marked: u8,
    pub kind: GcKind,
    /// Estimated bytes owned by the object, for collector pacing.
    pub size: u32,
}

impl GcHeader {
    /// New objects are always born with the current white.
    #[inline]
    pub fn new(kind: GcKind, current_white: u8, size: usize) -> Self {
        GcHeader {
            marked: current_white & WHITEBITS,
            kind,
            size: size.min(u32::MAX as usize) as u32,
        }
    }

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        self.marked & WHITEBITS != 0
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        self.marked & (1 << BLACKBIT) != 0
    }

    #[inline(always)]
    pub fn is_gray(&self) -> bool {
        !self.is_white() && !self.is_black()
    }

    /// Port of makewhite: clear black and both whites, then set current white.
    #[inline(always)]
    pub fn make_white(&mut self, current_white: u8) {
        self.marked = (self.marked & !(WHITEBITS | (1 << BLACKBIT))) | (current_white & WHITEBITS);
    }

    #[inline(always)]
    pub fn white_to_gray(&mut self) {
        self.marked &= !WHITEBITS;
    }

    #[inline(always)]
    pub fn gray_to_black(&mut self) {
        self.marked |= 1 << BLACKBIT;
    }

    #[inline(always)]
    pub fn black_to_gray(&mut self) {
        self.marked &= !(1 << BLACKBIT);
    }

    /// Flip between the two whites (used to resurrect an interned string
    /// found during sweep).
    #[inline(always)]
    pub fn change_white(&mut self) {
        self.marked ^= WHITEBITS;
    }

    /// An object is dead when it still carries the white of the previous
    /// cycle. Fixed objects never die.
    #[inline(always)]
    pub fn is_dead(&self, other_white: u8) -> bool {
        !self.is_fixed() && (self.marked & other_white & WHITEBITS) != 0
    }

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        self.marked & (1 << FIXEDBIT) != 0
    }

    #[inline(always)]
    pub fn set_fixed(&mut self) {
        self.marked |= 1 << FIXEDBIT;
    }

    #[inline(always)]
    pub fn is_finalized(&self) -> bool {
        self.marked & (1 << FINALIZEDBIT) != 0
    }

    #[inline(always)]
    pub fn set_finalized(&mut self) {
        self.marked |= 1 << FINALIZEDBIT;
    }

    #[inline(always)]
    pub fn weak_mode(&self) -> (bool, bool) {
        (
            self.marked & (1 << KEYWEAKBIT) != 0,
            self.marked & (1 << VALUEWEAKBIT) != 0,
        )
    }

    #[inline(always)]
    pub fn set_weak_mode(&mut self, weak_keys: bool, weak_values: bool) {
        self.marked &= !WEAKBITS;
        if weak_keys {
            self.marked |= 1 << KEYWEAKBIT;
        }
        if weak_values {
            self.marked |= 1 << VALUEWEAKBIT;
        }
    }
}

/// Payload of a heap object.
pub enum GcObject {
    String(LuaString),
    Table(LuaTable),
    Function(LuaFunction),
    Upvalue(LuaUpvalue),
    Userdata(LuaUserdata),
    Thread(Box<LuaState>),
    Chunk(Chunk),
}

impl GcObject {
    pub fn kind(&self) -> GcKind {
        match self {
            GcObject::String(_) => GcKind::String,
            GcObject::Table(_) => GcKind::Table,
            GcObject::Function(_) => GcKind::Function,
            GcObject::Upvalue(_) => GcKind::Upvalue,
            GcObject::Userdata(_) => GcKind::Userdata,
            GcObject::Thread(_) => GcKind::Thread,
            GcObject::Chunk(_) => GcKind::Chunk,
        }
    }
}

/// One occupied pool slot: header plus payload.
pub struct GcBox {
    pub header: GcHeader,
    pub object: GcObject,
}
