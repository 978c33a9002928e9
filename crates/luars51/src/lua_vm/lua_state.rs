// Per-thread execution state (one per coroutine, plus the main thread).
// Every thread lives in the object pool; the shared runtime state
// (pool, interner, registry, collector) is owned by `LuaVM`.

use crate::gc::gc_id::{TableId, UpvalueId};
use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::CallInfo;
use crate::lua_vm::debug_info::HookFn;
use crate::lua_vm::lua_limits::{BASIC_CI_SIZE, BASIC_STACK_SIZE, EXTRA_STACK, LUA_MINSTACK};
use crate::lua_vm::LuaStatus;

pub struct LuaState {
    /// Value stack. Every slot is initialized; `stack.len()` is the
    /// allocated size and the last `EXTRA_STACK` slots are reserve.
    pub(crate) stack: Vec<LuaValue>,
    /// First free slot
    pub(crate) top: usize,
    /// Active frames; `call_stack[0]` is the base frame of the thread.
    pub(crate) call_stack: Vec<CallInfo>,
    /// Open upvalues as `(stack index, upvalue)`, sorted by ascending index.
    pub(crate) open_upvalues: Vec<(usize, UpvalueId)>,
    pub(crate) status: LuaStatus,
    pub(crate) globals: TableId,
    /// Value of the error being propagated
    pub(crate) error_object: LuaValue,
    /// Stack index of the current message handler, 0 for none.
    pub(crate) errfunc: usize,
    /// Nested native boundaries (native calls, metamethods, protected calls)
    pub(crate) n_ccalls: u16,
    /// `n_ccalls` when the thread was resumed; yielding needs equality.
    pub(crate) base_ccalls: u16,
    pub(crate) hook: Option<HookFn>,
    pub(crate) hook_mask: u8,
    pub(crate) base_hook_count: u32,
    pub(crate) hook_count: u32,
    pub(crate) allow_hook: bool,
    /// Last instruction seen by the line hook
    pub(crate) old_pc: usize,
    /// Frame limit already reported; the extra frames are in use
    pub(crate) ci_overflow: bool,
}

impl LuaState {
    pub(crate) fn new(globals: TableId) -> Self {
        let mut stack = vec![LuaValue::Nil; BASIC_STACK_SIZE + EXTRA_STACK];
        // slot 0 is the `function` entry of the base frame
        stack[0] = LuaValue::Nil;
        let mut call_stack = Vec::with_capacity(BASIC_CI_SIZE);
        call_stack.push(CallInfo {
            func: 0,
            base: 1,
            top: 1 + LUA_MINSTACK,
            ..Default::default()
        });
        LuaState {
            stack,
            top: 1,
            call_stack,
            open_upvalues: Vec::new(),
            status: LuaStatus::Ok,
            globals,
            error_object: LuaValue::Nil,
            errfunc: 0,
            n_ccalls: 0,
            base_ccalls: 0,
            hook: None,
            hook_mask: 0,
            base_hook_count: 0,
            hook_count: 0,
            allow_hook: true,
            old_pc: 0,
            ci_overflow: false,
        }
    }

    /// Current frame
    #[inline(always)]
    pub(crate) fn ci(&self) -> &CallInfo {
        // the base frame is never popped
        &self.call_stack[self.call_stack.len() - 1]
    }

    #[inline(always)]
    pub(crate) fn ci_mut(&mut self) -> &mut CallInfo {
        let n = self.call_stack.len() - 1;
        &mut self.call_stack[n]
    }

    #[inline(always)]
    pub(crate) fn base(&self) -> usize {
        self.ci().base
    }

    /// Last usable slot; the reserve above it is for emergencies.
    #[inline(always)]
    pub(crate) fn stack_last(&self) -> usize {
        self.stack.len() - EXTRA_STACK
    }

    #[inline(always)]
    pub(crate) fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Make sure `n` more slots are available above `top`, growing the
    /// stack geometrically. Returns false when `limit` would be exceeded.
    pub(crate) fn ensure_stack(&mut self, n: usize, limit: usize) -> bool {
        if self.stack_last() > self.top + n {
            return true;
        }
        let needed = self.top + n + EXTRA_STACK + 1;
        let doubled = self.stack.len() * 2;
        let new_size = if n <= self.stack.len() { doubled.max(needed) } else { needed };
        if new_size > limit + EXTRA_STACK {
            if needed > limit + EXTRA_STACK {
                return false;
            }
            self.stack.resize(limit + EXTRA_STACK, LuaValue::Nil);
            return true;
        }
        self.stack.resize(new_size, LuaValue::Nil);
        true
    }

    /// Give back stack memory once deep recursion has unwound.
    pub(crate) fn shrink_stack(&mut self) {
        let in_use = self
            .call_stack
            .iter()
            .map(|ci| ci.top)
            .max()
            .unwrap_or(0)
            .max(self.top);
        let good_size = 2 * in_use + EXTRA_STACK;
        if in_use + EXTRA_STACK < self.stack.len() / 4 && good_size > BASIC_STACK_SIZE {
            self.stack.truncate(good_size);
            self.stack.shrink_to_fit();
        }
        if self.call_stack.capacity() > 4 * BASIC_CI_SIZE
            && self.call_stack.len() * 4 < self.call_stack.capacity()
        {
            self.call_stack.shrink_to(self.call_stack.len() * 2);
        }
    }

    #[inline(always)]
    pub(crate) fn push(&mut self, v: LuaValue) {
        self.stack[self.top] = v;
        self.top += 1;
    }

    /// Set `top`, nil-filling newly exposed slots.
    pub(crate) fn set_top_index(&mut self, new_top: usize) {
        for slot in &mut self.stack[self.top.min(new_top)..new_top] {
            *slot = LuaValue::Nil;
        }
        self.top = new_top;
    }

    /// Position in `open_upvalues` of the first upvalue at or above `level`.
    pub(crate) fn first_open_upvalue_at(&self, level: usize) -> usize {
        self.open_upvalues.partition_point(|(idx, _)| *idx < level)
    }

    pub(crate) fn find_open_upvalue(&self, index: usize) -> Result<UpvalueId, usize> {
        match self.open_upvalues.binary_search_by_key(&index, |(idx, _)| *idx) {
            Ok(pos) => Ok(self.open_upvalues[pos].1),
            Err(pos) => Err(pos),
        }
    }

    /// Slots the collector must treat as live: everything below `top` and
    /// every register of the active frames.
    pub(crate) fn live_extent(&self) -> usize {
        self.call_stack
            .iter()
            .filter(|ci| ci.is_lua())
            .map(|ci| ci.top)
            .max()
            .unwrap_or(0)
            .max(self.top)
            .min(self.stack.len())
    }

    pub(crate) fn mem_size(&self) -> usize {
        std::mem::size_of::<LuaState>()
            + self.stack.capacity() * std::mem::size_of::<LuaValue>()
            + self.call_stack.capacity() * std::mem::size_of::<CallInfo>()
    }
}
