// Lua Virtual Machine
// Owns everything the threads of one runtime instance share: the object
// pool, the intern table, the collector, the registry and the per-type
// metatables. Threads are pool objects like any other; `current` names the
// one that is running.
pub mod api;
pub mod call_info;
pub mod coroutine;
pub mod debug_info;
pub mod execute;
mod lua_error;
pub mod lua_limits;
mod lua_state;
pub mod opcode;
mod safe_option;

use std::any::Any;

use crate::gc::{
    ChunkId, FunctionId, GC, GcKind, GcObject, GcRef, GcRoots, GcState, GcStats, ObjectPool,
    StepResult, StringId, StringInterner, TableId, ThreadId, UpvalueId, UserdataId,
};
use crate::lua_value::{
    Chunk, LuaClosure, LuaFunction, LuaString, LuaTable, LuaUpvalue, LuaUserdata, LuaValue,
    NUM_TYPES, NativeClosure,
};
use crate::lua_vm::lua_limits::{GCFINALIZECOST, LUA_MINSTACK};
pub use call_info::CallInfo;
pub use execute::TmKind;
pub use lua_error::{LuaError, LuaResult, LuaStatus};
pub use lua_state::LuaState;
pub use opcode::{Instruction, OpArgMode, OpCode, OpMode, fb2int, int2fb};
pub use safe_option::SafeOption;

/// Native function: reads its arguments from the stack (index 1 upward),
/// pushes its results and returns how many it pushed.
pub type CFunction = fn(&mut LuaVM) -> LuaResult<usize>;

/// Called when an error escapes with no protected call to catch it.
pub type PanicFn = fn(&mut LuaVM);

/// Collector controls exposed to the host (`lua_gc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOption {
    Stop,
    Restart,
    Collect,
    /// Heap size in KiB
    Count,
    /// Remainder of the heap size in bytes
    CountB,
    /// Run steps worth `n` KiB of allocation
    Step(i64),
    SetPause(i64),
    SetStepMul(i64),
}

const MEMERRMSG: &[u8] = b"not enough memory";

pub struct LuaVM {
    pub(crate) pool: ObjectPool,
    pub(crate) strings: StringInterner,
    pub(crate) gc: GC,
    pub(crate) registry: TableId,
    pub(crate) main_thread: ThreadId,
    /// Running thread
    pub(crate) current: ThreadId,
    /// Metatables for non-table, non-userdata types, indexed by `LuaType`
    pub(crate) metatables: [Option<TableId>; NUM_TYPES],
    /// Metamethod event names, indexed by `TmKind`
    pub(crate) tm_names: [StringId; TmKind::N],
    pub(crate) memerr_msg: StringId,
    pub(crate) safe_option: SafeOption,
    pub(crate) panic_handler: Option<PanicFn>,
    closed: bool,
}

impl LuaVM {
    pub fn new(option: SafeOption) -> Self {
        let mut pool = ObjectPool::new();
        let mut gc = GC::new(option.gc_pause, option.gc_stepmul);

        let header = gc.new_header(GcKind::Table, std::mem::size_of::<LuaTable>());
        let registry = TableId(pool.alloc(header, GcObject::Table(LuaTable::new(0, 2))));
        let header = gc.new_header(GcKind::Table, std::mem::size_of::<LuaTable>());
        let globals = TableId(pool.alloc(header, GcObject::Table(LuaTable::new(0, 20))));
        let state = Box::new(LuaState::new(globals));
        let header = gc.new_header(GcKind::Thread, state.mem_size());
        let main_thread = ThreadId(pool.alloc(header, GcObject::Thread(state)));
        for r in [registry.gc_ref(), globals.gc_ref(), main_thread.gc_ref()] {
            if let Some(h) = pool.header_mut(r) {
                h.set_fixed();
            }
        }

        let mut strings = StringInterner::new();
        let memerr_msg = intern_fixed(&mut pool, &mut strings, &mut gc, MEMERRMSG);
        let tm_names = TmKind::ALL.map(|tm| intern_fixed(&mut pool, &mut strings, &mut gc, tm.name().as_bytes()));
        gc.set_event_names(tm_names[TmKind::Mode as usize], tm_names[TmKind::Gc as usize]);

        let mut vm = LuaVM {
            pool,
            strings,
            gc,
            registry,
            main_thread,
            current: main_thread,
            metatables: [None; NUM_TYPES],
            tm_names,
            memerr_msg,
            safe_option: option,
            panic_handler: None,
            closed: false,
        };
        // registry slot 0 heads the free list of references
        vm.pool.table_mut(registry).raw_set_int(0, LuaValue::Number(0.0));
        vm.gc.threshold = 4 * vm.gc.total_bytes;
        vm
    }

    // ============ Thread access ============

    /// Running thread's state.
    #[inline(always)]
    pub(crate) fn state(&self) -> &LuaState {
        self.pool.thread(self.current)
    }

    #[inline(always)]
    pub(crate) fn state_mut(&mut self) -> &mut LuaState {
        self.pool.thread_mut(self.current)
    }

    #[inline]
    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    #[inline]
    pub fn current_thread(&self) -> ThreadId {
        self.current
    }

    #[inline]
    pub fn registry(&self) -> TableId {
        self.registry
    }

    /// Globals table of the running thread.
    #[inline]
    pub fn globals(&self) -> TableId {
        self.state().globals
    }

    pub fn object_pool(&self) -> &ObjectPool {
        &self.pool
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    /// Bytes currently accounted to live objects.
    pub fn total_bytes(&self) -> usize {
        self.gc.total_bytes
    }

    pub fn set_panic_handler(&mut self, handler: Option<PanicFn>) -> Option<PanicFn> {
        std::mem::replace(&mut self.panic_handler, handler)
    }

    /// Environment of the running function; the thread's globals when no
    /// function is running.
    pub(crate) fn current_env(&self) -> TableId {
        let state = self.state();
        if state.call_stack.len() <= 1 {
            return state.globals;
        }
        match state.stack[state.ci().func] {
            LuaValue::Function(f) => self.pool.function(f).env(),
            _ => state.globals,
        }
    }

    // ============ Allocation ============

    /// Allocate an accounted object, honouring the memory limit.
    fn alloc_object(&mut self, kind: GcKind, size: usize, object: GcObject) -> LuaResult<GcRef> {
        self.reserve_bytes(size)?;
        let header = self.gc.new_header(kind, size);
        let r = self.pool.alloc(header, object);
        self.gc.pin_fresh(r);
        Ok(r)
    }

    /// Make room for `size` more accounted bytes, collecting once if the
    /// memory limit is in the way.
    fn reserve_bytes(&mut self, size: usize) -> LuaResult<()> {
        let limit = self.safe_option.max_memory_limit;
        if self.gc.total_bytes.saturating_add(size) <= limit {
            return Ok(());
        }
        let roots = self.gc_roots();
        self.gc.emergency_collect(&mut self.pool, &mut self.strings, &roots);
        if self.gc.total_bytes.saturating_add(size) > limit {
            return Err(self.memory_error());
        }
        Ok(())
    }

    /// Grow the array part of `t` to `n` slots, charging the growth to the
    /// collector.
    pub(crate) fn grow_table_array(&mut self, t: TableId, n: usize) -> LuaResult<()> {
        let extra = n.saturating_sub(self.pool.table(t).array_size());
        self.reserve_bytes(extra * std::mem::size_of::<LuaValue>())?;
        self.pool.table_mut(t).resize_array(n);
        let size = self.pool.table(t).mem_size();
        self.gc.resize_object(&mut self.pool, t.gc_ref(), size);
        Ok(())
    }

    /// Intern `bytes`, reviving a dead copy that has not been swept yet.
    pub fn create_string(&mut self, bytes: &[u8]) -> LuaResult<StringId> {
        let hash = self.strings.hash_bytes(bytes);
        if let Some(id) = self.strings.find(&self.pool, bytes, hash) {
            let other_white = self.gc.other_white();
            if let Some(h) = self.pool.header_mut(id.gc_ref())
                && h.is_dead(other_white)
            {
                h.change_white();
            }
            return Ok(id);
        }
        let size = std::mem::size_of::<LuaString>() + bytes.len() + 1;
        let r = self.alloc_object(
            GcKind::String,
            size,
            GcObject::String(LuaString::new(bytes, hash)),
        )?;
        let id = StringId { r, hash };
        let can_resize = self.gc.state() != GcState::SweepString;
        self.strings.insert(id, can_resize);
        Ok(id)
    }

    #[inline]
    pub fn create_string_value(&mut self, s: &str) -> LuaResult<LuaValue> {
        Ok(LuaValue::String(self.create_string(s.as_bytes())?))
    }

    pub fn new_table(&mut self, narray: usize, nhash: usize) -> LuaResult<TableId> {
        let table = LuaTable::new(narray, nhash);
        let size = table.mem_size();
        let r = self.alloc_object(GcKind::Table, size, GcObject::Table(table))?;
        Ok(TableId(r))
    }

    pub(crate) fn create_lua_closure(
        &mut self,
        chunk: ChunkId,
        upvalues: Vec<UpvalueId>,
        env: TableId,
    ) -> LuaResult<FunctionId> {
        let size = std::mem::size_of::<LuaFunction>()
            + upvalues.len() * std::mem::size_of::<UpvalueId>();
        let f = LuaFunction::Lua(LuaClosure {
            chunk,
            upvalues,
            env,
        });
        let r = self.alloc_object(GcKind::Function, size, GcObject::Function(f))?;
        Ok(FunctionId(r))
    }

    pub fn create_native_closure(
        &mut self,
        func: CFunction,
        upvalues: Vec<LuaValue>,
    ) -> LuaResult<FunctionId> {
        let env = self.current_env();
        let size = std::mem::size_of::<LuaFunction>()
            + upvalues.len() * std::mem::size_of::<LuaValue>();
        let f = LuaFunction::Native(NativeClosure {
            func,
            upvalues,
            env,
        });
        let r = self.alloc_object(GcKind::Function, size, GcObject::Function(f))?;
        Ok(FunctionId(r))
    }

    pub(crate) fn create_upvalue(&mut self, uv: LuaUpvalue) -> LuaResult<UpvalueId> {
        let size = std::mem::size_of::<LuaUpvalue>();
        let r = self.alloc_object(GcKind::Upvalue, size, GcObject::Upvalue(uv))?;
        Ok(UpvalueId(r))
    }

    /// Full userdata owning `data`; `size` is what the collector accounts.
    pub fn create_userdata(&mut self, data: Box<dyn Any>, size: usize) -> LuaResult<UserdataId> {
        let env = self.current_env();
        let accounted = std::mem::size_of::<LuaUserdata>() + size;
        let r = self.alloc_object(
            GcKind::Userdata,
            accounted,
            GcObject::Userdata(LuaUserdata::new(data, size, env)),
        )?;
        let id = UserdataId(r);
        self.gc.register_udata(id);
        Ok(id)
    }

    /// New thread sharing the creator's globals and hook settings.
    pub(crate) fn create_thread(&mut self) -> LuaResult<ThreadId> {
        let parent = self.state();
        let mut state = LuaState::new(parent.globals);
        state.hook = parent.hook;
        state.hook_mask = parent.hook_mask;
        state.base_hook_count = parent.base_hook_count;
        state.hook_count = parent.base_hook_count;
        let state = Box::new(state);
        let size = state.mem_size();
        let r = self.alloc_object(GcKind::Thread, size, GcObject::Thread(state))?;
        Ok(ThreadId(r))
    }

    pub(crate) fn create_chunk(&mut self, chunk: Chunk) -> LuaResult<ChunkId> {
        let size = std::mem::size_of::<Chunk>()
            + chunk.code.len() * 4
            + chunk.constants.len() * std::mem::size_of::<LuaValue>()
            + chunk.line_info.len() * 4;
        let r = self.alloc_object(GcKind::Chunk, size, GcObject::Chunk(chunk))?;
        Ok(ChunkId(r))
    }

    // ============ Barriers ============

    /// Store into a table that already holds `key`'s slot, with barrier.
    #[inline]
    pub(crate) fn table_barrier(&mut self, t: TableId, v: LuaValue) {
        if v.is_collectable() {
            self.gc.barrier_back(&mut self.pool, t, v);
        }
    }

    #[inline]
    pub(crate) fn object_barrier(&mut self, obj: GcRef, v: LuaValue) {
        if v.is_collectable() {
            self.gc.barrier(&mut self.pool, obj, v);
        }
    }

    /// Raw table store: rejects nil and NaN keys, runs the write barrier.
    pub(crate) fn table_raw_set(&mut self, t: TableId, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        match key {
            LuaValue::Nil => return Err(self.error("table index is nil")),
            LuaValue::Number(n) if n.is_nan() => return Err(self.error("table index is NaN")),
            _ => {}
        }
        *self.pool.table_mut(t).set(key) = value;
        self.table_barrier(t, key);
        self.table_barrier(t, value);
        Ok(())
    }

    pub(crate) fn table_raw_set_int(&mut self, t: TableId, key: i64, value: LuaValue) {
        *self.pool.table_mut(t).set_int(key) = value;
        self.table_barrier(t, value);
    }

    pub(crate) fn set_table_metatable(&mut self, t: TableId, mt: Option<TableId>) {
        self.pool.table_mut(t).set_metatable(mt);
        if let Some(mt) = mt {
            self.table_barrier(t, LuaValue::Table(mt));
        }
    }

    pub(crate) fn set_userdata_metatable(&mut self, u: UserdataId, mt: Option<TableId>) {
        self.pool.userdata_mut(u).metatable = mt;
        if let Some(mt) = mt {
            self.object_barrier(u.gc_ref(), LuaValue::Table(mt));
        }
    }

    // ============ Collector glue ============

    fn gc_roots(&self) -> GcRoots {
        GcRoots {
            registry: self.registry,
            main_thread: self.main_thread,
            current_thread: self.current,
            metatables: self.metatables,
        }
    }

    /// Safe point: run collector work when the allocation debt calls for it.
    pub(crate) fn check_gc(&mut self) -> LuaResult<()> {
        self.gc.clear_fresh();
        if self.gc.total_bytes >= self.gc.threshold {
            self.gc_step()?;
        }
        if self.gc.total_bytes > self.safe_option.max_memory_limit {
            self.full_gc()?;
        }
        Ok(())
    }

    fn gc_single_step(&mut self) -> LuaResult<usize> {
        let roots = self.gc_roots();
        match self.gc.single_step(&mut self.pool, &mut self.strings, &roots) {
            StepResult::Work(work) => Ok(work),
            StepResult::Finalize(ud) => {
                self.run_finalizer(ud)?;
                Ok(GCFINALIZECOST)
            }
        }
    }

    /// One incremental step.
    pub(crate) fn gc_step(&mut self) -> LuaResult<()> {
        let mut lim = self.gc.begin_step();
        loop {
            lim -= self.gc_single_step()? as isize;
            if self.gc.state() == GcState::Pause || lim <= 0 {
                break;
            }
        }
        self.gc.end_step();
        Ok(())
    }

    /// Stop-the-world collection, finalizers included.
    pub fn full_gc(&mut self) -> LuaResult<()> {
        self.gc.reset_to_sweep();
        while self.gc.state() != GcState::Finalize {
            self.gc_single_step()?;
        }
        // a fresh cycle from the roots, run to completion
        self.gc.state = GcState::Pause;
        self.gc_single_step()?;
        while self.gc.state() != GcState::Pause {
            self.gc_single_step()?;
        }
        self.gc.set_threshold();
        Ok(())
    }

    pub fn gc(&mut self, option: GcOption) -> LuaResult<i64> {
        let res = match option {
            GcOption::Stop => {
                self.gc.threshold = usize::MAX;
                0
            }
            GcOption::Restart => {
                self.gc.threshold = self.gc.total_bytes;
                0
            }
            GcOption::Collect => {
                self.full_gc()?;
                0
            }
            GcOption::Count => (self.gc.total_bytes >> 10) as i64,
            GcOption::CountB => (self.gc.total_bytes & 0x3ff) as i64,
            GcOption::Step(kib) => {
                let a = (kib.max(0) as usize) << 10;
                self.gc.threshold = self.gc.total_bytes.saturating_sub(a);
                let mut finished = 0;
                while self.gc.threshold <= self.gc.total_bytes {
                    self.gc_step()?;
                    if self.gc.state() == GcState::Pause {
                        finished = 1;
                        break;
                    }
                }
                finished
            }
            GcOption::SetPause(p) => {
                let old = self.gc.pause as i64;
                self.gc.pause = p.max(0) as usize;
                old
            }
            GcOption::SetStepMul(m) => {
                let old = self.gc.stepmul as i64;
                self.gc.stepmul = m.max(0) as usize;
                old
            }
        };
        Ok(res)
    }

    /// Call the `__gc` metamethod of a userdata. Errors raised by the
    /// finalizer are discarded.
    fn run_finalizer(&mut self, ud: UserdataId) -> LuaResult<()> {
        let Some(mt) = self.pool.userdata(ud).metatable else {
            return Ok(());
        };
        let tm = self.pool.table(mt).get_str(self.tm_names[TmKind::Gc as usize]);
        if tm.is_nil() {
            return Ok(());
        }
        let old_threshold = self.gc.threshold;
        let old_allow_hook = self.state().allow_hook;
        let old_top = self.state().top;
        self.gc.threshold = 2 * self.gc.total_bytes;
        self.state_mut().allow_hook = false;
        let limit = self.safe_option.max_stack_size;
        if !self.state_mut().ensure_stack(2, limit) {
            self.state_mut().allow_hook = old_allow_hook;
            self.gc.threshold = old_threshold;
            return Ok(());
        }
        let func = old_top;
        {
            let state = self.state_mut();
            state.push(tm);
            state.push(LuaValue::Userdata(ud));
        }
        let _ = self.pcall_at(func, 0, 0);
        let state = self.state_mut();
        state.allow_hook = old_allow_hook;
        state.set_top_index(old_top);
        self.gc.threshold = old_threshold;
        Ok(())
    }

    // ============ Errors ============

    /// Preallocated out-of-memory error; bypasses the message handler.
    pub(crate) fn memory_error(&mut self) -> LuaError {
        let msg = self.memerr_msg;
        self.state_mut().error_object = LuaValue::String(msg);
        LuaError::Memory
    }

    /// Raise a runtime error with `msg`, prefixed by the position of the
    /// running Lua function if there is one.
    pub fn error(&mut self, msg: impl AsRef<str>) -> LuaError {
        let msg = match self.where_() {
            Some(position) => format!("{}{}", position, msg.as_ref()),
            None => msg.as_ref().to_string(),
        };
        match self.create_string(msg.as_bytes()) {
            Ok(s) => self.raise(LuaValue::String(s)),
            Err(e) => e,
        }
    }

    /// `"chunkid:line: "` of the running function when it is a Lua function.
    pub(crate) fn where_(&self) -> Option<String> {
        self.where_level(self.state().call_stack.len() - 1)
    }

    /// Raise `value` as a runtime error. The message handler, if any, runs
    /// now, while the erroring frames are still on the stack.
    pub fn raise(&mut self, value: LuaValue) -> LuaError {
        self.state_mut().error_object = value;
        let errfunc = self.state().errfunc;
        if errfunc == 0 {
            return LuaError::Runtime;
        }
        let handler = self.state().stack[errfunc];
        if !handler.is_function() {
            return self.raise_error_in_error_handling();
        }
        let limit = self.safe_option.max_stack_size;
        let state = self.state_mut();
        state.errfunc = 0;
        if !state.ensure_stack(2, limit + LUA_MINSTACK) {
            state.errfunc = errfunc;
            return self.raise_error_in_error_handling();
        }
        let func = state.top;
        state.push(handler);
        state.push(value);
        let result = self.call_at(func, 1);
        self.state_mut().errfunc = errfunc;
        match result {
            Ok(()) => {
                let state = self.state_mut();
                state.top -= 1;
                state.error_object = state.stack[state.top];
                LuaError::Runtime
            }
            Err(_) => self.raise_error_in_error_handling(),
        }
    }

    /// Error value being propagated on the running thread.
    pub fn error_object(&self) -> LuaValue {
        self.state().error_object
    }

    /// Render the pending error value as text.
    pub fn get_error_message(&self, e: LuaError) -> String {
        match self.state().error_object {
            LuaValue::String(s) => String::from_utf8_lossy(self.pool.string(s).as_bytes()).into_owned(),
            LuaValue::Number(n) => crate::lua_value::lua_convert::number_to_string(n),
            LuaValue::Nil => e.to_string(),
            v => format!("({} error object)", v.type_name()),
        }
    }

    // ============ Shutdown ============

    /// Close the main thread's upvalues and run every pending finalizer.
    fn close_state(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current = self.main_thread;
        self.close_upvalues(0);
        self.gc.separate_udata(&mut self.pool, true);
        let state = self.state_mut();
        state.errfunc = 0;
        state.call_stack.truncate(1);
        state.top = state.call_stack[0].base;
        state.n_ccalls = 0;
        state.base_ccalls = 0;
        while let Some(ud) = self.gc.take_pending_finalizer() {
            if let Some(h) = self.pool.header_mut(ud.gc_ref()) {
                h.make_white(self.gc.current_white());
            }
            let _ = self.run_finalizer(ud);
        }
    }

    /// Shut the runtime down, running pending finalizers.
    pub fn close(mut self) {
        self.close_state();
    }
}

impl Drop for LuaVM {
    fn drop(&mut self) {
        self.close_state();
    }
}

/// Intern a string that is never collected.
fn intern_fixed(
    pool: &mut ObjectPool,
    strings: &mut StringInterner,
    gc: &mut GC,
    bytes: &[u8],
) -> StringId {
    let hash = strings.hash_bytes(bytes);
    if let Some(id) = strings.find(pool, bytes, hash) {
        return id;
    }
    let mut header = gc.new_header(GcKind::String, std::mem::size_of::<LuaString>() + bytes.len() + 1);
    header.set_fixed();
    let r = pool.alloc(header, GcObject::String(LuaString::new(bytes, hash)));
    let id = StringId { r, hash };
    strings.insert(id, true);
    id
}
