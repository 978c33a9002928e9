// CallInfo - bookkeeping for one active function invocation.
// Positions are stack indices, never pointers, so stack reallocation
// needs no fixups.

/// Call status flags
pub mod call_status {
    /// Lua function (has bytecode)
    pub const CIST_LUA: u8 = 1 << 0;
    /// Frame was entered through a tail call
    pub const CIST_TAIL: u8 = 1 << 1;
    /// Lua frame started by a native `call`; returning from it leaves the
    /// dispatch loop
    pub const CIST_FRESH: u8 = 1 << 2;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CallInfo {
    /// Stack slot holding the called function
    pub func: usize,
    /// First register of the frame
    pub base: usize,
    /// Frame top (first slot past the registers, or native call limit)
    pub top: usize,
    /// Index of the next instruction (Lua frames only)
    pub saved_pc: usize,
    /// Results expected by the caller, `LUA_MULTRET` for all
    pub nresults: i32,
    /// Tail calls collapsed into this frame
    pub tailcalls: u32,
    pub call_status: u8,
}

impl CallInfo {
    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.call_status & call_status::CIST_LUA != 0
    }

    #[inline(always)]
    pub fn is_fresh(&self) -> bool {
        self.call_status & call_status::CIST_FRESH != 0
    }

    #[inline(always)]
    pub fn is_tail(&self) -> bool {
        self.call_status & call_status::CIST_TAIL != 0
    }
}
