//! Centralized VM limits and tuning constants.
//!
//! Mirrors the 5.1 `luaconf.h` / `llimits.h` values so that bytecode
//! produced for the reference interpreter behaves the same here.

// ===== Stack =====

/// Minimum guaranteed stack slots available to native functions.
pub const LUA_MINSTACK: usize = 20;

/// Initial stack capacity for new threads.
pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;

/// Extra slots kept above every frame's top for metamethod calls.
pub const EXTRA_STACK: usize = 5;

/// Initial frame array capacity for new threads.
pub const BASIC_CI_SIZE: usize = 8;

/// Default maximum stack size (number of slots).
pub const LUAI_MAXSTACK: usize = 1_000_000;

/// Default maximum number of frames per thread.
pub const LUAI_MAXCALLS: usize = 20_000;

/// Frames granted beyond the limit so that an error handler can still run
/// after a stack overflow.
pub const EXTRA_CI: usize = 200;

/// Largest register frame a prototype may request.
pub const MAXSTACK: usize = 250;

/// Maximum nesting of native calls (and metamethod/pcall boundaries).
pub const LUAI_MAXCCALLS: u16 = 200;

// ===== Calls =====

/// `nresults` value meaning "all results".
pub const LUA_MULTRET: i32 = -1;

// ===== Metamethods =====

/// Maximum depth for __index / __newindex chains.
pub const MAXTAGLOOP: usize = 100;

// ===== Tables =====

/// Number of list items flushed per SETLIST instruction.
pub const LFIELDS_PER_FLUSH: usize = 50;

// ===== Strings =====

/// Initial (and minimum) intern table size.
pub const MINSTRTABSIZE: usize = 32;

/// Maximum length of a chunk id in error messages, including the NUL of
/// the reference implementation.
pub const LUA_IDSIZE: usize = 60;

// ===== GC =====

/// Work units per `stepmul` percent.
pub const GCSTEPSIZE: usize = 1024;

/// Objects swept per sweep step.
pub const GCSWEEPMAX: usize = 40;

/// Cost of sweeping one object.
pub const GCSWEEPCOST: usize = 10;

/// Cost of running one finalizer.
pub const GCFINALIZECOST: usize = 100;

/// Default collector pause (percent).
pub const LUAI_GCPAUSE: usize = 200;

/// Default collector step multiplier (percent).
pub const LUAI_GCMUL: usize = 200;
