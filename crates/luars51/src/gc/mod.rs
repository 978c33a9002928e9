// Incremental tri-color garbage collector
//
// A port of the 5.1 collector (lgc.c) onto the object pool:
// - GcState::Pause:       mark the roots, start a cycle
// - GcState::Propagate:   blacken one gray object per unit of work; when no
//                         gray object is left run the atomic phase
// - GcState::SweepString: sweep one intern-table bucket per step
// - GcState::Sweep:       sweep GCSWEEPMAX pool slots per step
// - GcState::Finalize:    hand one pending `__gc` call to the VM per step
//
// Two whites alternate between cycles; objects still carrying the previous
// cycle's white after the atomic phase are garbage. Threads are never left
// black (their stacks change without barriers) and open upvalues stay gray
// until they close.
//
// Tri-color invariant: a black object never points to a white one.

pub mod gc_id;
pub mod gc_object;
pub mod object_pool;
pub mod string_interner;

use std::collections::VecDeque;

use ahash::AHashSet;

use crate::lua_value::{LuaFunction, LuaUpvalue, LuaValue, NUM_TYPES};
use crate::lua_vm::lua_limits::{
    GCFINALIZECOST, GCSTEPSIZE, GCSWEEPCOST, GCSWEEPMAX, LUAI_GCMUL, LUAI_GCPAUSE,
};
pub use gc_id::*;
pub use gc_object::*;
pub use object_pool::ObjectPool;
pub use string_interner::StringInterner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    SweepString,
    Sweep,
    Finalize,
}

/// Host-visible collector counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub cycles: u64,
    pub steps: u64,
    pub objects_freed: u64,
    pub bytes_freed: u64,
    pub finalizers_run: u64,
}

/// Root set handed to the collector by the VM.
pub struct GcRoots {
    pub registry: TableId,
    pub main_thread: ThreadId,
    pub current_thread: ThreadId,
    pub metatables: [Option<TableId>; NUM_TYPES],
}

/// What a single step asks of the VM.
pub enum StepResult {
    /// Work units done
    Work(usize),
    /// Run the `__gc` metamethod of this userdata, then continue
    Finalize(UserdataId),
}

pub struct GC {
    pub(crate) state: GcState,
    current_white: u8,
    gray: Vec<GcRef>,
    grayagain: Vec<GcRef>,
    weak: Vec<TableId>,
    /// Every userdata, in creation order; candidates for finalization.
    udata: Vec<UserdataId>,
    /// Userdata whose finalizer is pending
    tmudata: VecDeque<UserdataId>,
    /// Upvalues still aliasing a stack slot
    pub(crate) open_upvalues: AHashSet<UpvalueId>,
    sweep_str_pos: usize,
    sweep_pos: usize,
    pub(crate) total_bytes: usize,
    pub(crate) threshold: usize,
    estimate: usize,
    gcdept: usize,
    pub(crate) pause: usize,
    pub(crate) stepmul: usize,
    /// `__mode` and `__gc` event names
    mode_key: Option<StringId>,
    gc_key: Option<StringId>,
    scratch: Vec<GcRef>,
    /// Objects allocated since the last safe point; Rust code may hold them
    /// before they are anchored anywhere.
    fresh: Vec<GcRef>,
    pub(crate) stats: GcStats,
}

impl Default for GC {
    fn default() -> Self {
        Self::new(LUAI_GCPAUSE, LUAI_GCMUL)
    }
}

impl GC {
    pub fn new(pause: usize, stepmul: usize) -> Self {
        GC {
            state: GcState::Pause,
            current_white: 1 << WHITE0BIT,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            udata: Vec::new(),
            tmudata: VecDeque::new(),
            open_upvalues: AHashSet::new(),
            sweep_str_pos: 0,
            sweep_pos: 0,
            total_bytes: 0,
            threshold: usize::MAX,
            estimate: 0,
            gcdept: 0,
            pause,
            stepmul,
            mode_key: None,
            gc_key: None,
            scratch: Vec::new(),
            fresh: Vec::new(),
            stats: GcStats::default(),
        }
    }

    pub(crate) fn set_event_names(&mut self, mode_key: StringId, gc_key: StringId) {
        self.mode_key = Some(mode_key);
        self.gc_key = Some(gc_key);
    }

    #[inline(always)]
    pub fn current_white(&self) -> u8 {
        self.current_white
    }

    #[inline(always)]
    pub(crate) fn other_white(&self) -> u8 {
        self.current_white ^ WHITEBITS
    }

    #[inline]
    pub fn state(&self) -> GcState {
        self.state
    }

    #[inline]
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Header for a new object of `size` bytes; the object is accounted.
    #[inline]
    pub(crate) fn new_header(&mut self, kind: GcKind, size: usize) -> GcHeader {
        self.total_bytes += size;
        GcHeader::new(kind, self.current_white, size)
    }

    pub(crate) fn register_udata(&mut self, id: UserdataId) {
        self.udata.push(id);
    }

    /// Pause: next threshold from the live estimate.
    pub(crate) fn set_threshold(&mut self) {
        self.threshold = (self.estimate / 100).saturating_mul(self.pause);
    }

    pub(crate) fn has_pending_finalizers(&self) -> bool {
        !self.tmudata.is_empty()
    }

    /// Update the accounted size of a live object.
    pub(crate) fn resize_object(&mut self, pool: &mut ObjectPool, r: GcRef, new_size: usize) {
        if let Some(h) = pool.header_mut(r) {
            let old = h.size as usize;
            let new_size = new_size.min(u32::MAX as usize);
            h.size = new_size as u32;
            self.total_bytes = (self.total_bytes + new_size).saturating_sub(old);
        }
    }

    // ============ Marking ============

    #[inline]
    pub(crate) fn mark_value(&mut self, pool: &mut ObjectPool, v: LuaValue) {
        if let Some(r) = v.gc_ref() {
            self.mark_object(pool, r);
        }
    }

    #[inline]
    pub(crate) fn mark_object(&mut self, pool: &mut ObjectPool, r: GcRef) {
        if pool.header(r).is_some_and(|h| h.is_white()) {
            self.really_mark(pool, r);
        }
    }

    fn really_mark(&mut self, pool: &mut ObjectPool, r: GcRef) {
        let Some(b) = pool.get_mut(r) else {
            return;
        };
        b.header.white_to_gray();
        match &b.object {
            GcObject::String(_) => b.header.gray_to_black(),
            GcObject::Userdata(u) => {
                let (mt, env) = (u.metatable, u.env);
                b.header.gray_to_black();
                if let Some(mt) = mt {
                    self.mark_object(pool, mt.gc_ref());
                }
                self.mark_object(pool, env.gc_ref());
            }
            GcObject::Upvalue(LuaUpvalue::Closed(v)) => {
                let v = *v;
                b.header.gray_to_black();
                self.mark_value(pool, v);
            }
            GcObject::Upvalue(LuaUpvalue::Open { thread, index }) => {
                // open upvalues stay gray; the atomic phase remarks them
                let (thread, index) = (*thread, *index);
                let v = match pool.get(thread.gc_ref()) {
                    Some(GcBox {
                        object: GcObject::Thread(th),
                        ..
                    }) => th.stack.get(index).copied().unwrap_or_default(),
                    _ => LuaValue::Nil,
                };
                self.mark_value(pool, v);
            }
            _ => self.gray.push(r),
        }
    }

    fn mark_scratch(&mut self, pool: &mut ObjectPool, children: &mut Vec<GcRef>) {
        for r in children.drain(..) {
            self.mark_object(pool, r);
        }
    }

    fn mark_roots(&mut self, pool: &mut ObjectPool, roots: &GcRoots) {
        self.mark_object(pool, roots.main_thread.gc_ref());
        self.mark_object(pool, roots.current_thread.gc_ref());
        let globals = pool.thread(roots.main_thread).globals;
        self.mark_object(pool, globals.gc_ref());
        self.mark_object(pool, roots.registry.gc_ref());
        self.mark_metatables(pool, roots);
    }

    fn mark_metatables(&mut self, pool: &mut ObjectPool, roots: &GcRoots) {
        for mt in roots.metatables.iter().flatten() {
            self.mark_object(pool, mt.gc_ref());
        }
        for i in 0..self.fresh.len() {
            let r = self.fresh[i];
            self.mark_object(pool, r);
        }
    }

    // ============ Traversal ============

    /// Blacken one gray object. Returns its size as the work done.
    fn propagate_mark(&mut self, pool: &mut ObjectPool) -> usize {
        let Some(r) = self.gray.pop() else {
            return 0;
        };
        let Some(b) = pool.get_mut(r) else {
            return 0;
        };
        b.header.gray_to_black();
        match b.header.kind {
            GcKind::Table => self.traverse_table(pool, TableId(r)),
            GcKind::Function => self.traverse_closure(pool, FunctionId(r)),
            GcKind::Thread => self.traverse_thread(pool, ThreadId(r)),
            GcKind::Chunk => self.traverse_proto(pool, ChunkId(r)),
            _ => 0,
        }
    }

    fn propagate_all(&mut self, pool: &mut ObjectPool) -> usize {
        let mut work = 0;
        while !self.gray.is_empty() {
            work += self.propagate_mark(pool);
        }
        work
    }

    fn traverse_table(&mut self, pool: &mut ObjectPool, id: TableId) -> usize {
        let mut children = std::mem::take(&mut self.scratch);
        let (weak_keys, weak_values, size) = {
            let t = pool.table(id);
            let mut weak_keys = false;
            let mut weak_values = false;
            if let Some(mt) = t.metatable {
                children.push(mt.gc_ref());
                if let Some(mode_key) = self.mode_key
                    && let LuaValue::String(mode) = pool.table(mt).get_str(mode_key)
                {
                    let mode = pool.string(mode).as_bytes();
                    weak_keys = mode.contains(&b'k');
                    weak_values = mode.contains(&b'v');
                }
            }
            if !(weak_keys && weak_values) {
                if !weak_values {
                    children.extend(t.array().iter().filter_map(|v| v.gc_ref()));
                }
                for (k, v) in t.hash_entries() {
                    if !weak_keys && let Some(r) = k.gc_ref() {
                        children.push(r);
                    }
                    if !weak_values && let Some(r) = v.gc_ref() {
                        children.push(r);
                    }
                }
            }
            (weak_keys, weak_values, t.mem_size())
        };
        if let Some(h) = pool.header_mut(id.gc_ref()) {
            h.set_weak_mode(weak_keys, weak_values);
            if weak_keys || weak_values {
                // weak tables stay gray so they are revisited atomically
                h.black_to_gray();
            }
        }
        if weak_keys || weak_values {
            self.weak.push(id);
        }
        self.resize_object(pool, id.gc_ref(), size);
        self.mark_scratch(pool, &mut children);
        self.scratch = children;
        size
    }

    fn traverse_closure(&mut self, pool: &mut ObjectPool, id: FunctionId) -> usize {
        let mut children = std::mem::take(&mut self.scratch);
        let size = match pool.function(id) {
            LuaFunction::Lua(c) => {
                children.push(c.env.gc_ref());
                children.push(c.chunk.gc_ref());
                children.extend(c.upvalues.iter().map(|u| u.gc_ref()));
                c.upvalues.len()
            }
            LuaFunction::Native(c) => {
                children.push(c.env.gc_ref());
                children.extend(c.upvalues.iter().filter_map(|v| v.gc_ref()));
                c.upvalues.len()
            }
        };
        self.mark_scratch(pool, &mut children);
        self.scratch = children;
        std::mem::size_of::<LuaFunction>() + size * std::mem::size_of::<LuaValue>()
    }

    fn traverse_proto(&mut self, pool: &mut ObjectPool, id: ChunkId) -> usize {
        let mut children = std::mem::take(&mut self.scratch);
        let size = {
            let p = pool.chunk(id);
            children.extend(p.source.map(|s| s.gc_ref()));
            children.extend(p.constants.iter().filter_map(|k| k.gc_ref()));
            children.extend(p.child_protos.iter().map(|c| c.gc_ref()));
            children.extend(p.locals.iter().map(|l| l.name.gc_ref()));
            children.extend(p.upvalue_names.iter().map(|n| n.gc_ref()));
            p.code.len() * 4 + p.constants.len() * std::mem::size_of::<LuaValue>()
        };
        self.mark_scratch(pool, &mut children);
        self.scratch = children;
        size
    }

    /// Threads go back to gray and are revisited in the atomic phase.
    fn traverse_thread(&mut self, pool: &mut ObjectPool, id: ThreadId) -> usize {
        let mut children = std::mem::take(&mut self.scratch);
        let size = {
            let th = pool.thread_mut(id);
            let live = th.live_extent();
            for slot in &mut th.stack[live..] {
                *slot = LuaValue::Nil;
            }
            th.shrink_stack();
            children.push(th.globals.gc_ref());
            children.extend(th.error_object.gc_ref());
            children.extend(th.stack[..live].iter().filter_map(|v| v.gc_ref()));
            th.mem_size()
        };
        if let Some(h) = pool.header_mut(id.gc_ref()) {
            h.black_to_gray();
        }
        self.grayagain.push(id.gc_ref());
        self.resize_object(pool, id.gc_ref(), size);
        self.mark_scratch(pool, &mut children);
        self.scratch = children;
        size
    }

    /// Values behind open upvalues may have changed since they were marked.
    fn remark_upvalues(&mut self, pool: &mut ObjectPool) {
        let open: Vec<UpvalueId> = self.open_upvalues.iter().copied().collect();
        for uv in open {
            if !pool.header(uv.gc_ref()).is_some_and(|h| h.is_gray()) {
                continue;
            }
            if let LuaUpvalue::Open { thread, index } = *pool.upvalue(uv)
                && let Some(GcBox {
                    object: GcObject::Thread(th),
                    ..
                }) = pool.get(thread.gc_ref())
            {
                let v = th.stack.get(index).copied().unwrap_or_default();
                self.mark_value(pool, v);
            }
        }
    }

    // ============ Atomic phase ============

    fn atomic(&mut self, pool: &mut ObjectPool, roots: &GcRoots) {
        self.remark_upvalues(pool);
        self.propagate_all(pool);
        // revisit weak tables: they may have gained entries
        let weak = std::mem::take(&mut self.weak);
        self.gray.extend(weak.iter().map(|t| t.gc_ref()));
        self.mark_object(pool, roots.current_thread.gc_ref());
        self.mark_metatables(pool, roots);
        self.propagate_all(pool);
        let again = std::mem::take(&mut self.grayagain);
        self.gray.extend(again);
        self.propagate_all(pool);
        let mut udsize = self.separate_udata(pool, false);
        self.mark_tmu(pool);
        udsize += self.propagate_all(pool);
        self.clear_weak_tables(pool);
        self.current_white = self.other_white();
        self.sweep_str_pos = 0;
        self.sweep_pos = 0;
        self.state = GcState::SweepString;
        self.estimate = self.total_bytes.saturating_sub(udsize);
    }

    /// Move unreachable (or, with `all`, every) userdata that has a `__gc`
    /// metamethod to the pending-finalization queue. Each userdata is
    /// considered once. Returns the bytes being kept alive for finalization.
    pub(crate) fn separate_udata(&mut self, pool: &mut ObjectPool, all: bool) -> usize {
        let mut deadmem = 0;
        let mut udata = std::mem::take(&mut self.udata);
        udata.retain(|ud| pool.contains(ud.gc_ref()));
        for &ud in &udata {
            let Some(h) = pool.header(ud.gc_ref()) else {
                continue;
            };
            if !(all || h.is_white()) || h.is_finalized() {
                continue;
            }
            let size = h.size as usize;
            let has_gc = match (pool.userdata(ud).metatable, self.gc_key) {
                (Some(mt), Some(gc_key)) => !pool.table(mt).get_str(gc_key).is_nil(),
                _ => false,
            };
            if let Some(h) = pool.header_mut(ud.gc_ref()) {
                h.set_finalized();
            }
            if has_gc {
                deadmem += size;
                self.tmudata.push_back(ud);
            }
        }
        self.udata = udata;
        deadmem
    }

    /// Resurrect everything awaiting finalization.
    fn mark_tmu(&mut self, pool: &mut ObjectPool) {
        let pending: Vec<UserdataId> = self.tmudata.iter().copied().collect();
        for ud in pending {
            if let Some(h) = pool.header_mut(ud.gc_ref()) {
                h.make_white(self.current_white);
            }
            self.really_mark(pool, ud.gc_ref());
        }
    }

    fn clear_weak_tables(&mut self, pool: &mut ObjectPool) {
        let weak = std::mem::take(&mut self.weak);
        let mut strings = Vec::new();
        for id in weak {
            let Some(h) = pool.header(id.gc_ref()) else {
                continue;
            };
            let (weak_keys, weak_values) = h.weak_mode();
            let mut table = std::mem::take(pool.table_mut(id));
            table.clear_weak(weak_keys, weak_values, |v, is_key| {
                let Some(r) = v.gc_ref() else {
                    return false;
                };
                if v.is_string() {
                    // strings are values, never weak
                    strings.push(r);
                    return false;
                }
                match pool.header(r) {
                    None => true,
                    Some(h) => {
                        h.is_white()
                            || (!is_key && matches!(v, LuaValue::Userdata(_)) && h.is_finalized())
                    }
                }
            });
            *pool.table_mut(id) = table;
        }
        for r in strings {
            self.mark_object(pool, r);
        }
    }

    // ============ Sweeping ============

    fn free_object(&mut self, pool: &mut ObjectPool, r: GcRef) {
        let Some(b) = pool.free(r) else {
            return;
        };
        let size = b.header.size as usize;
        self.total_bytes = self.total_bytes.saturating_sub(size);
        self.stats.objects_freed += 1;
        self.stats.bytes_freed += size as u64;
        match b.object {
            GcObject::Thread(th) => {
                // a collected thread closes its upvalues first
                for (index, uv) in &th.open_upvalues {
                    let v = th.stack.get(*index).copied().unwrap_or_default();
                    if let Some(GcBox {
                        object: GcObject::Upvalue(cell),
                        ..
                    }) = pool.get_mut(uv.gc_ref())
                    {
                        *cell = LuaUpvalue::Closed(v);
                    }
                    self.open_upvalues.remove(uv);
                }
            }
            GcObject::Upvalue(LuaUpvalue::Open { thread, index }) => {
                self.open_upvalues.remove(&UpvalueId(r));
                if let Some(GcBox {
                    object: GcObject::Thread(th),
                    ..
                }) = pool.get_mut(thread.gc_ref())
                    && let Ok(pos) = th.open_upvalues.binary_search_by_key(&index, |(i, _)| *i)
                {
                    th.open_upvalues.remove(pos);
                }
            }
            _ => {}
        }
    }

    fn sweep_string_step(&mut self, pool: &mut ObjectPool, strings: &mut StringInterner) {
        let other = self.other_white();
        let current = self.current_white;
        let dead = strings.sweep_bucket(self.sweep_str_pos, |id| match pool.header_mut(id.gc_ref()) {
            Some(h) if h.is_dead(other) => true,
            Some(h) => {
                h.make_white(current);
                false
            }
            None => true,
        });
        for id in dead {
            self.free_object(pool, id.gc_ref());
        }
        self.sweep_str_pos += 1;
        if self.sweep_str_pos >= strings.bucket_count() {
            self.state = GcState::Sweep;
        }
    }

    /// Sweep up to `max` slots. Returns true when the whole pool is done.
    fn sweep_pool(&mut self, pool: &mut ObjectPool, max: usize) -> bool {
        let other = self.other_white();
        let end = (self.sweep_pos + max).min(pool.slot_count());
        for index in self.sweep_pos..end {
            let Some(r) = pool.ref_at(index) else {
                continue;
            };
            let Some(h) = pool.header_mut(r) else {
                continue;
            };
            // strings were handled bucket by bucket
            if h.kind == GcKind::String {
                continue;
            }
            if h.is_dead(other) {
                self.free_object(pool, r);
            } else {
                h.make_white(self.current_white);
            }
        }
        self.sweep_pos = end;
        self.sweep_pos >= pool.slot_count()
    }

    // ============ Stepping ============

    /// One unit of collector work.
    pub fn single_step(
        &mut self,
        pool: &mut ObjectPool,
        strings: &mut StringInterner,
        roots: &GcRoots,
    ) -> StepResult {
        self.stats.steps += 1;
        match self.state {
            GcState::Pause => {
                self.gray.clear();
                self.grayagain.clear();
                self.weak.clear();
                self.mark_roots(pool, roots);
                self.state = GcState::Propagate;
                StepResult::Work(0)
            }
            GcState::Propagate => {
                if !self.gray.is_empty() {
                    StepResult::Work(self.propagate_mark(pool))
                } else {
                    self.atomic(pool, roots);
                    StepResult::Work(0)
                }
            }
            GcState::SweepString => {
                let old = self.total_bytes;
                self.sweep_string_step(pool, strings);
                self.estimate = self.estimate.saturating_sub(old - self.total_bytes);
                StepResult::Work(GCSWEEPCOST)
            }
            GcState::Sweep => {
                let old = self.total_bytes;
                if self.sweep_pool(pool, GCSWEEPMAX) {
                    strings.check_size();
                    self.state = GcState::Finalize;
                }
                self.estimate = self.estimate.saturating_sub(old.saturating_sub(self.total_bytes));
                StepResult::Work(GCSWEEPMAX * GCSWEEPCOST)
            }
            GcState::Finalize => match self.tmudata.pop_front() {
                Some(ud) => {
                    if let Some(h) = pool.header_mut(ud.gc_ref()) {
                        h.make_white(self.current_white);
                    }
                    if self.estimate > GCFINALIZECOST {
                        self.estimate -= GCFINALIZECOST;
                    }
                    self.stats.finalizers_run += 1;
                    StepResult::Finalize(ud)
                }
                None => {
                    self.state = GcState::Pause;
                    self.gcdept = 0;
                    self.stats.cycles += 1;
                    StepResult::Work(0)
                }
            },
        }
    }

    /// Work budget of one incremental step and debt bookkeeping at its start.
    pub(crate) fn begin_step(&mut self) -> isize {
        let lim = (GCSTEPSIZE / 100 * self.stepmul) as isize;
        self.gcdept += self.total_bytes.saturating_sub(self.threshold);
        if lim == 0 { isize::MAX / 2 } else { lim }
    }

    /// Threshold for the next step once `begin_step`'s budget is spent.
    pub(crate) fn end_step(&mut self) {
        if self.state != GcState::Pause {
            if self.gcdept < GCSTEPSIZE {
                self.threshold = self.total_bytes + GCSTEPSIZE;
            } else {
                self.gcdept -= GCSTEPSIZE;
                self.threshold = self.total_bytes;
            }
        } else {
            self.set_threshold();
        }
    }

    /// Remember an object that is not reachable from the roots yet.
    pub(crate) fn pin_fresh(&mut self, r: GcRef) {
        self.fresh.push(r);
    }

    /// Every object allocated so far is anchored or garbage.
    pub(crate) fn clear_fresh(&mut self) {
        self.fresh.clear();
    }

    /// Full collection run from inside an allocation. Objects allocated
    /// since the last safe point survive, and `__gc` calls are left queued
    /// for the next regular step since no Lua code may run here.
    pub(crate) fn emergency_collect(
        &mut self,
        pool: &mut ObjectPool,
        strings: &mut StringInterner,
        roots: &GcRoots,
    ) {
        self.reset_to_sweep();
        self.run_until_finalize(pool, strings, roots);
        self.state = GcState::Pause;
        self.run_until_finalize(pool, strings, roots);
        self.set_threshold();
        if !self.tmudata.is_empty() {
            self.threshold = self.total_bytes;
        }
    }

    fn run_until_finalize(&mut self, pool: &mut ObjectPool, strings: &mut StringInterner, roots: &GcRoots) {
        while self.state != GcState::Finalize {
            // only the Finalize state hands out finalizers
            let _ = self.single_step(pool, strings, roots);
        }
    }

    /// Abandon marking so that a full collection can start from a sweep
    /// that returns every object to white.
    pub(crate) fn reset_to_sweep(&mut self) {
        if matches!(self.state, GcState::Pause | GcState::Propagate) {
            self.sweep_str_pos = 0;
            self.sweep_pos = 0;
            self.gray.clear();
            self.grayagain.clear();
            self.weak.clear();
            self.state = GcState::SweepString;
        }
    }

    // ============ Barriers ============

    /// Forward barrier: black `obj` now references `v`.
    pub(crate) fn barrier(&mut self, pool: &mut ObjectPool, obj: GcRef, v: LuaValue) {
        let Some(vr) = v.gc_ref() else {
            return;
        };
        if !pool.header(vr).is_some_and(|h| h.is_white()) {
            return;
        }
        if !pool.header(obj).is_some_and(|h| h.is_black()) {
            return;
        }
        if self.state == GcState::Propagate {
            self.really_mark(pool, vr);
        } else if let Some(h) = pool.header_mut(obj) {
            // sweeping: keep the invariant by whitening the parent
            h.make_white(self.current_white);
        }
    }

    /// Backward barrier for tables: a black table that gains a white
    /// reference goes back to gray and is re-traversed atomically.
    pub(crate) fn barrier_back(&mut self, pool: &mut ObjectPool, t: TableId, v: LuaValue) {
        let Some(vr) = v.gc_ref() else {
            return;
        };
        if !pool.header(vr).is_some_and(|h| h.is_white()) {
            return;
        }
        if let Some(h) = pool.header_mut(t.gc_ref())
            && h.is_black()
        {
            h.black_to_gray();
            self.grayagain.push(t.gc_ref());
        }
    }

    /// A closing upvalue that was marked while open becomes black (with a
    /// barrier on its value) or, outside marking, white again.
    pub(crate) fn close_upvalue_barrier(&mut self, pool: &mut ObjectPool, uv: UpvalueId, v: LuaValue) {
        self.open_upvalues.remove(&uv);
        let Some(h) = pool.header_mut(uv.gc_ref()) else {
            return;
        };
        if !h.is_gray() {
            return;
        }
        if self.state == GcState::Propagate {
            h.gray_to_black();
            self.barrier(pool, uv.gc_ref(), v);
        } else {
            // sweeping: the cell may already be behind the sweep cursor
            h.make_white(self.current_white);
        }
    }

    /// Pending finalizers, for shutdown.
    pub(crate) fn take_pending_finalizer(&mut self) -> Option<UserdataId> {
        let ud = self.tmudata.pop_front()?;
        self.stats.finalizers_run += 1;
        Some(ud)
    }
}
