use crate::lua_vm::lua_limits::{LUAI_GCMUL, LUAI_GCPAUSE, LUAI_MAXCALLS, LUAI_MAXCCALLS, LUAI_MAXSTACK};

/// Host-supplied resource limits, fixed when the VM is created.
#[derive(Debug, Clone)]
pub struct SafeOption {
    /// Maximum stack slots per thread.
    pub max_stack_size: usize,
    /// Maximum frames per thread.
    pub max_call_depth: usize,
    /// Maximum nested native boundaries.
    pub max_c_calls: u16,
    /// Maximum accounted heap bytes
    pub max_memory_limit: usize,
    /// Collector pause, percent.
    pub gc_pause: usize,
    /// Collector step multiplier, percent.
    pub gc_stepmul: usize,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_stack_size: LUAI_MAXSTACK,
            max_call_depth: LUAI_MAXCALLS,
            max_c_calls: LUAI_MAXCCALLS,
            max_memory_limit: usize::MAX,
            gc_pause: LUAI_GCPAUSE,
            gc_stepmul: LUAI_GCMUL,
        }
    }
}
