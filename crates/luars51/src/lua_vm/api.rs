// Embedding API (lapi.c)
//
// Every exchange with the host goes through the running thread's stack.
// Positive indices count from the base of the running function (1 is its
// first argument), negative ones from the top (-1 is the topmost value);
// the pseudo-indices below name values that do not live on the stack.

use std::any::Any;

use crate::gc::{StringId, ThreadId, UserdataId};
use crate::lua_value::chunk_serializer::{self, ChunkData, Constant, LUA_SIGNATURE_BYTE, LocVarData};
use crate::lua_value::lua_convert::{number_to_string, str_to_number};
use crate::lua_value::verify::check_chunk;
use crate::lua_value::{Chunk, LocVar, LuaFunction, LuaType, LuaUpvalue, LuaValue};
use crate::lua_vm::execute::metamethod::{Operand, to_number};
use crate::lua_vm::lua_limits::{LUA_MINSTACK, LUA_MULTRET};
use crate::lua_vm::{CFunction, LuaError, LuaResult, LuaStatus, LuaVM};

pub const REGISTRYINDEX: i32 = -10000;
pub const ENVIRONINDEX: i32 = -10001;
pub const GLOBALSINDEX: i32 = -10002;

/// Pseudo-index of the `i`-th (1-based) upvalue of the running native closure.
#[inline]
pub const fn upvalue_index(i: i32) -> i32 {
    GLOBALSINDEX - i
}

/// Reference returned by `reference` for a nil value.
pub const REFNIL: i32 = -1;
/// A reference that is never handed out.
pub const NOREF: i32 = -2;

/// Registry slot heading the free list of references.
const FREELIST_REF: i64 = 0;

#[derive(Debug, Clone, Copy)]
enum Addr {
    Stack(usize),
    Registry,
    Environ,
    Globals,
    Upvalue(usize),
}

impl LuaVM {
    // ============ Index resolution ============

    fn addr(&self, idx: i32) -> Addr {
        let state = self.state();
        if idx > 0 {
            Addr::Stack(state.ci().base + idx as usize - 1)
        } else if idx > REGISTRYINDEX {
            Addr::Stack((state.top as i64 + idx as i64) as usize)
        } else {
            match idx {
                REGISTRYINDEX => Addr::Registry,
                ENVIRONINDEX => Addr::Environ,
                GLOBALSINDEX => Addr::Globals,
                _ => Addr::Upvalue((GLOBALSINDEX - idx) as usize - 1),
            }
        }
    }

    /// Stack slot of a valid stack index.
    fn stack_slot(&self, idx: i32) -> usize {
        match self.addr(idx) {
            Addr::Stack(i) => i,
            _ => self.state().top,
        }
    }

    fn running_native(&self) -> Option<crate::gc::FunctionId> {
        let state = self.state();
        if state.call_stack.len() <= 1 {
            return None;
        }
        match state.stack[state.ci().func] {
            LuaValue::Function(f) if !self.pool.function(f).is_lua() => Some(f),
            _ => None,
        }
    }

    /// Value at an acceptable index; `None` when there is no value there.
    pub fn index_value(&self, idx: i32) -> Option<LuaValue> {
        match self.addr(idx) {
            Addr::Stack(i) => {
                let state = self.state();
                (i >= state.ci().base && i < state.top).then(|| state.stack[i])
            }
            Addr::Registry => Some(LuaValue::Table(self.registry)),
            Addr::Environ => Some(LuaValue::Table(self.current_env())),
            Addr::Globals => Some(LuaValue::Table(self.state().globals)),
            Addr::Upvalue(n) => {
                let f = self.running_native()?;
                match self.pool.function(f) {
                    LuaFunction::Native(cl) => cl.upvalues.get(n).copied(),
                    LuaFunction::Lua(_) => None,
                }
            }
        }
    }

    #[inline]
    fn value(&self, idx: i32) -> LuaValue {
        self.index_value(idx).unwrap_or(LuaValue::Nil)
    }

    /// Convert a relative index into one that stays valid as the stack
    /// changes.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRYINDEX {
            idx
        } else {
            let state = self.state();
            (state.top - state.ci().base) as i32 + idx + 1
        }
    }

    // ============ Stack manipulation ============

    pub fn get_top(&self) -> i32 {
        let state = self.state();
        (state.top - state.ci().base) as i32
    }

    /// Set the top; growing fills with nil, a negative index pops.
    pub fn set_top(&mut self, idx: i32) {
        let state = self.state_mut();
        if idx >= 0 {
            let new_top = state.ci().base + idx as usize;
            state.set_top_index(new_top);
        } else {
            state.top = (state.top as i64 + idx as i64 + 1) as usize;
        }
    }

    #[inline]
    pub fn pop(&mut self, n: i32) {
        self.set_top(-n - 1);
    }

    /// Push any value.
    pub fn push(&mut self, v: LuaValue) {
        let limit = self.safe_option.max_stack_size;
        let state = self.state_mut();
        let room = state.top < state.stack_last() || state.ensure_stack(1, limit + LUA_MINSTACK);
        debug_assert!(room, "stack overflow: push without check_stack");
        if state.top >= state.stack.len() {
            state.stack.push(LuaValue::Nil);
        }
        state.push(v);
    }

    pub fn push_value(&mut self, idx: i32) {
        let v = self.value(idx);
        self.push(v);
    }

    pub fn remove(&mut self, idx: i32) {
        let p = self.stack_slot(idx);
        let state = self.state_mut();
        let top = state.top;
        state.stack.copy_within(p + 1..top, p);
        state.top -= 1;
    }

    /// Move the top value into `idx`, shifting the values above it up.
    pub fn insert(&mut self, idx: i32) {
        let p = self.stack_slot(idx);
        let state = self.state_mut();
        let top = state.top;
        let v = state.stack[top - 1];
        state.stack.copy_within(p..top - 1, p + 1);
        state.stack[p] = v;
    }

    /// Pop the top value into `idx`.
    pub fn replace(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.value(-1);
        match self.addr(idx) {
            Addr::Stack(i) => self.state_mut().stack[i] = v,
            Addr::Environ => {
                let LuaValue::Table(env) = v else {
                    return Err(self.error("environment must be a table"));
                };
                if let Some(f) = self.running_native() {
                    self.pool.function_mut(f).set_env(env);
                    self.object_barrier(f.gc_ref(), v);
                }
            }
            Addr::Globals => {
                let LuaValue::Table(env) = v else {
                    return Err(self.error("globals must be a table"));
                };
                self.state_mut().globals = env;
            }
            Addr::Upvalue(n) => {
                if let Some(f) = self.running_native() {
                    if let LuaFunction::Native(cl) = self.pool.function_mut(f)
                        && let Some(slot) = cl.upvalues.get_mut(n)
                    {
                        *slot = v;
                    }
                    self.object_barrier(f.gc_ref(), v);
                }
            }
            Addr::Registry => return Err(self.error("cannot replace the registry")),
        }
        self.state_mut().top -= 1;
        Ok(())
    }

    /// Make room for `n` more values. False when the stack limit forbids it.
    pub fn check_stack(&mut self, n: usize) -> bool {
        let current = self.current;
        self.check_thread_stack(current, n)
    }

    /// `check_stack` for `th`, which need not be the running thread.
    pub fn check_thread_stack(&mut self, th: ThreadId, n: usize) -> bool {
        let limit = self.safe_option.max_stack_size;
        let state = self.pool.thread_mut(th);
        if state.top - state.ci().base + n > limit {
            return false;
        }
        if !state.ensure_stack(n, limit) {
            return false;
        }
        let wanted = state.top + n;
        let ci = state.ci_mut();
        if ci.top < wanted {
            ci.top = wanted;
        }
        true
    }

    /// Pop `n` values from `from` and push them onto `to`.
    pub fn xmove(&mut self, from: ThreadId, to: ThreadId, n: usize) {
        if from == to || n == 0 {
            return;
        }
        let values: Vec<LuaValue> = {
            let state = self.pool.thread_mut(from);
            state.top -= n;
            state.stack[state.top..state.top + n].to_vec()
        };
        let limit = self.safe_option.max_stack_size;
        let state = self.pool.thread_mut(to);
        state.ensure_stack(n, limit + LUA_MINSTACK);
        for v in values {
            state.push(v);
        }
    }

    // ============ Access ============

    pub fn type_of(&self, idx: i32) -> LuaType {
        self.index_value(idx).map_or(LuaType::None, |v| v.type_of())
    }

    pub fn type_name(&self, idx: i32) -> &'static str {
        self.type_of(idx).name()
    }

    pub fn is_none_or_nil(&self, idx: i32) -> bool {
        self.value(idx).is_nil()
    }

    pub fn is_number(&self, idx: i32) -> bool {
        to_number(self, &self.value(idx)).is_some()
    }

    pub fn is_string(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::String(_) | LuaValue::Number(_))
    }

    pub fn is_native_function(&self, idx: i32) -> bool {
        match self.value(idx) {
            LuaValue::Function(f) => !self.pool.function(f).is_lua(),
            _ => false,
        }
    }

    pub fn is_userdata(&self, idx: i32) -> bool {
        matches!(self.value(idx), LuaValue::Userdata(_) | LuaValue::LightUserdata(_))
    }

    pub fn raw_equal(&self, idx1: i32, idx2: i32) -> bool {
        match (self.index_value(idx1), self.index_value(idx2)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Equality with `__eq`.
    pub fn equal(&mut self, idx1: i32, idx2: i32) -> LuaResult<bool> {
        match (self.index_value(idx1), self.index_value(idx2)) {
            (Some(a), Some(b)) => self.equal_values(a, b),
            _ => Ok(false),
        }
    }

    /// `<` with `__lt`.
    pub fn less_than(&mut self, idx1: i32, idx2: i32) -> LuaResult<bool> {
        match (self.index_value(idx1), self.index_value(idx2)) {
            (Some(a), Some(b)) => self.less_than_values(a, b),
            _ => Ok(false),
        }
    }

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        to_number(self, &self.value(idx))
    }

    /// Number at `idx` truncated toward zero.
    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        self.to_number(idx).map(|n| n as i64)
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        !self.value(idx).is_falsy()
    }

    /// String at `idx`; a number is converted in place first.
    pub fn to_string_id(&mut self, idx: i32) -> LuaResult<Option<StringId>> {
        match self.value(idx) {
            LuaValue::String(s) => Ok(Some(s)),
            LuaValue::Number(n) => {
                let s = self.create_string(number_to_string(n).as_bytes())?;
                if let Addr::Stack(i) = self.addr(idx) {
                    self.state_mut().stack[i] = LuaValue::String(s);
                }
                Ok(Some(s))
            }
            _ => Ok(None),
        }
    }

    pub fn to_bytes(&mut self, idx: i32) -> LuaResult<Option<&[u8]>> {
        let s = self.to_string_id(idx)?;
        Ok(s.map(|s| self.pool.string(s).as_bytes()))
    }

    /// Like `to_bytes`, for strings that are valid UTF-8.
    pub fn to_str(&mut self, idx: i32) -> LuaResult<Option<&str>> {
        let s = self.to_string_id(idx)?;
        Ok(s.and_then(|s| self.pool.string(s).as_str()))
    }

    /// Length without metamethods: string bytes, table boundary, userdata
    /// size; a number counts as its string form.
    pub fn obj_len(&mut self, idx: i32) -> LuaResult<usize> {
        Ok(match self.value(idx) {
            LuaValue::String(s) => self.pool.string(s).len(),
            LuaValue::Table(t) => self.pool.table(t).length(),
            LuaValue::Userdata(u) => self.pool.userdata(u).size(),
            LuaValue::Number(_) => match self.to_string_id(idx)? {
                Some(s) => self.pool.string(s).len(),
                None => 0,
            },
            _ => 0,
        })
    }

    pub fn to_userdata(&self, idx: i32) -> Option<UserdataId> {
        self.value(idx).as_userdata_id()
    }

    pub fn to_light_userdata(&self, idx: i32) -> Option<usize> {
        match self.value(idx) {
            LuaValue::LightUserdata(p) => Some(p),
            _ => None,
        }
    }

    pub fn userdata_ref<T: Any>(&self, ud: UserdataId) -> Option<&T> {
        self.pool.userdata(ud).downcast_ref::<T>()
    }

    pub fn userdata_mut<T: Any>(&mut self, ud: UserdataId) -> Option<&mut T> {
        self.pool.userdata_mut(ud).downcast_mut::<T>()
    }

    pub fn to_thread(&self, idx: i32) -> Option<ThreadId> {
        self.value(idx).as_thread_id()
    }

    /// Bytes of an interned string.
    pub fn string_bytes(&self, s: StringId) -> &[u8] {
        self.pool.string(s).as_bytes()
    }

    // ============ Push ============

    pub fn push_nil(&mut self) {
        self.push(LuaValue::Nil);
    }

    pub fn push_number(&mut self, n: f64) {
        self.push(LuaValue::Number(n));
    }

    pub fn push_integer(&mut self, n: i64) {
        self.push(LuaValue::Number(n as f64));
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> LuaResult<()> {
        self.check_gc()?;
        let s = self.create_string(bytes)?;
        self.push(LuaValue::String(s));
        Ok(())
    }

    pub fn push_string(&mut self, s: &str) -> LuaResult<()> {
        self.push_bytes(s.as_bytes())
    }

    pub fn push_boolean(&mut self, b: bool) {
        self.push(LuaValue::Boolean(b));
    }

    pub fn push_light_userdata(&mut self, p: usize) {
        self.push(LuaValue::LightUserdata(p));
    }

    /// Push the running thread; true when it is the main thread.
    pub fn push_thread(&mut self) -> bool {
        let current = self.current;
        self.push(LuaValue::Thread(current));
        current == self.main_thread
    }

    /// Pop `n` values and push a native closure capturing them as upvalues.
    pub fn push_native_closure(&mut self, f: CFunction, n: usize) -> LuaResult<()> {
        self.check_gc()?;
        let upvalues = {
            let state = self.state();
            state.stack[state.top - n..state.top].to_vec()
        };
        let func = self.create_native_closure(f, upvalues)?;
        self.state_mut().top -= n;
        self.push(LuaValue::Function(func));
        Ok(())
    }

    pub fn push_native_function(&mut self, f: CFunction) -> LuaResult<()> {
        self.push_native_closure(f, 0)
    }

    // ============ Get ============

    /// Replace the key on top with `t[key]`, `t` at `idx`.
    pub fn get_table(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.value(idx);
        let key = self.value(-1);
        let v = self.get_table_value(Operand::new(t, None), key)?;
        self.replace_top(v);
        Ok(())
    }

    /// Push `t[k]`, `t` at `idx`.
    pub fn get_field(&mut self, idx: i32, k: &str) -> LuaResult<()> {
        let t = self.value(idx);
        let key = self.create_string_value(k)?;
        let v = self.get_table_value(Operand::new(t, None), key)?;
        self.push(v);
        Ok(())
    }

    pub fn get_global(&mut self, name: &str) -> LuaResult<()> {
        self.get_field(GLOBALSINDEX, name)
    }

    fn table_at(&mut self, idx: i32) -> LuaResult<crate::gc::TableId> {
        match self.value(idx) {
            LuaValue::Table(t) => Ok(t),
            v => Err(self.error(format!("table expected, got {}", v.type_name()))),
        }
    }

    /// Replace the key on top with `t[key]` without metamethods.
    pub fn raw_get(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.table_at(idx)?;
        let key = self.value(-1);
        let v = self.pool.table(t).get(&key);
        self.replace_top(v);
        Ok(())
    }

    pub fn raw_get_i(&mut self, idx: i32, n: i64) -> LuaResult<()> {
        let t = self.table_at(idx)?;
        let v = self.pool.table(t).get_int(n);
        self.push(v);
        Ok(())
    }

    /// Push a new table with room for `narr` array and `nrec` hash entries.
    pub fn create_table(&mut self, narr: usize, nrec: usize) -> LuaResult<()> {
        self.check_gc()?;
        let t = self.new_table(narr, nrec)?;
        self.push(LuaValue::Table(t));
        Ok(())
    }

    /// Push a full userdata owning `data`.
    pub fn new_userdata<T: Any>(&mut self, data: T) -> LuaResult<UserdataId> {
        self.check_gc()?;
        let ud = self.create_userdata(Box::new(data), std::mem::size_of::<T>())?;
        self.push(LuaValue::Userdata(ud));
        Ok(ud)
    }

    /// Push the metatable of the value at `idx`; false (nothing pushed)
    /// when it has none.
    pub fn get_metatable(&mut self, idx: i32) -> bool {
        let v = self.value(idx);
        match self.get_metatable_of(&v) {
            Some(mt) => {
                self.push(LuaValue::Table(mt));
                true
            }
            None => false,
        }
    }

    /// Push the environment of the value at `idx` (nil for types without one).
    pub fn get_fenv(&mut self, idx: i32) {
        let env = match self.value(idx) {
            LuaValue::Function(f) => LuaValue::Table(self.pool.function(f).env()),
            LuaValue::Userdata(u) => LuaValue::Table(self.pool.userdata(u).env()),
            LuaValue::Thread(t) => LuaValue::Table(self.pool.thread(t).globals),
            _ => LuaValue::Nil,
        };
        self.push(env);
    }

    // ============ Set ============

    /// `t[k] = v` with `k` and `v` the two top values, which are popped.
    pub fn set_table(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.value(idx);
        let (key, v) = (self.value(-2), self.value(-1));
        self.set_table_value(Operand::new(t, None), key, v)?;
        self.state_mut().top -= 2;
        Ok(())
    }

    /// `t[k] = v` with `v` the popped top value.
    pub fn set_field(&mut self, idx: i32, k: &str) -> LuaResult<()> {
        let t = self.value(idx);
        let key = self.create_string_value(k)?;
        let v = self.value(-1);
        self.set_table_value(Operand::new(t, None), key, v)?;
        self.state_mut().top -= 1;
        Ok(())
    }

    pub fn set_global(&mut self, name: &str) -> LuaResult<()> {
        self.set_field(GLOBALSINDEX, name)
    }

    pub fn raw_set(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.table_at(idx)?;
        let (key, v) = (self.value(-2), self.value(-1));
        self.table_raw_set(t, key, v)?;
        self.state_mut().top -= 2;
        Ok(())
    }

    pub fn raw_set_i(&mut self, idx: i32, n: i64) -> LuaResult<()> {
        let t = self.table_at(idx)?;
        let v = self.value(-1);
        self.table_raw_set_int(t, n, v);
        self.state_mut().top -= 1;
        Ok(())
    }

    /// Pop a table (or nil) and make it the metatable of the value at
    /// `idx`. For types other than table and userdata this sets the
    /// metatable shared by the whole type.
    pub fn set_metatable(&mut self, idx: i32) -> LuaResult<()> {
        let obj = self.value(idx);
        let mt = match self.value(-1) {
            LuaValue::Nil => None,
            LuaValue::Table(t) => Some(t),
            _ => return Err(self.error("metatable must be a table or nil")),
        };
        match obj {
            LuaValue::Table(t) => self.set_table_metatable(t, mt),
            LuaValue::Userdata(u) => self.set_userdata_metatable(u, mt),
            other => {
                let ty = other.type_of();
                if ty != LuaType::None {
                    self.metatables[ty as usize] = mt;
                }
            }
        }
        self.state_mut().top -= 1;
        Ok(())
    }

    /// Pop a table and make it the environment of the function, userdata
    /// or thread at `idx`. False when the value cannot have one.
    pub fn set_fenv(&mut self, idx: i32) -> LuaResult<bool> {
        let obj = self.value(idx);
        let env_value = self.value(-1);
        let LuaValue::Table(env) = env_value else {
            return Err(self.error("environment must be a table"));
        };
        let done = match obj {
            LuaValue::Function(f) => {
                self.pool.function_mut(f).set_env(env);
                self.object_barrier(f.gc_ref(), env_value);
                true
            }
            LuaValue::Userdata(u) => {
                self.pool.userdata_mut(u).env = env;
                self.object_barrier(u.gc_ref(), env_value);
                true
            }
            LuaValue::Thread(t) => {
                self.pool.thread_mut(t).globals = env;
                self.object_barrier(t.gc_ref(), env_value);
                true
            }
            _ => false,
        };
        self.state_mut().top -= 1;
        Ok(done)
    }

    /// Register a native function as a global.
    pub fn register(&mut self, name: &str, f: CFunction) -> LuaResult<()> {
        self.push_native_function(f)?;
        self.set_global(name)
    }

    // ============ Calls ============

    fn adjust_results(&mut self, nresults: i32) {
        if nresults == LUA_MULTRET {
            let state = self.state_mut();
            let top = state.top;
            let ci = state.ci_mut();
            if ci.top < top {
                ci.top = top;
            }
        }
    }

    /// Call the function below the top `nargs` values; errors propagate.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> LuaResult<()> {
        let func = self.state().top - nargs - 1;
        self.call_at(func, nresults)?;
        self.adjust_results(nresults);
        Ok(())
    }

    /// Protected `call`. `errfunc` is the stack index of a message
    /// handler, 0 for none. On error the error value replaces the function
    /// and its arguments.
    pub fn pcall(&mut self, nargs: usize, nresults: i32, errfunc: i32) -> LuaStatus {
        let errfunc = if errfunc == 0 { 0 } else { self.stack_slot(errfunc) };
        let func = self.state().top - nargs - 1;
        let status = self.pcall_at(func, nresults, errfunc);
        self.adjust_results(nresults);
        status
    }

    /// Raise the value on top as an error.
    pub fn raise_top(&mut self) -> LuaError {
        let v = self.value(-1);
        self.raise(v)
    }

    // ============ Chunks ============

    /// Load a binary chunk and push its main function, or push an error
    /// message and return `ErrSyntax` (or `ErrMem`).
    pub fn load(&mut self, data: &[u8], chunkname: &str) -> LuaStatus {
        let name = match chunkname.as_bytes().first() {
            Some(b'@') | Some(b'=') => &chunkname[1..],
            Some(&c) if c == LUA_SIGNATURE_BYTE => "binary string",
            _ => chunkname,
        };
        if data.first() != Some(&LUA_SIGNATURE_BYTE) {
            return self.load_error(format!("{}: not a precompiled chunk", name));
        }
        let chunk = match chunk_serializer::undump(data) {
            Ok(chunk) => chunk,
            Err(e) => return self.load_error(format!("{}: {} in precompiled chunk", name, e)),
        };
        if check_chunk(&chunk).is_err() {
            return self.load_error(format!("{}: bad code in precompiled chunk", name));
        }
        self.push_main_closure(&chunk)
    }

    /// Load an in-memory prototype tree (bytecode assembled by the host).
    pub fn load_prototype(&mut self, chunk: &ChunkData) -> LuaStatus {
        if let Err(e) = check_chunk(chunk) {
            return self.load_error(format!("bad code in prototype: {}", e));
        }
        self.push_main_closure(chunk)
    }

    fn load_error(&mut self, msg: String) -> LuaStatus {
        match self.create_string(msg.as_bytes()) {
            Ok(s) => {
                self.push(LuaValue::String(s));
                LuaStatus::ErrSyntax
            }
            Err(_) => {
                let m = self.memerr_msg;
                self.push(LuaValue::String(m));
                LuaStatus::ErrMem
            }
        }
    }

    fn push_main_closure(&mut self, data: &ChunkData) -> LuaStatus {
        let result = self.check_gc().and_then(|_| {
            let proto = self.materialize(data, None)?;
            let mut upvalues = Vec::with_capacity(data.upvalue_count as usize);
            for _ in 0..data.upvalue_count {
                upvalues.push(self.create_upvalue(LuaUpvalue::Closed(LuaValue::Nil))?);
            }
            let globals = self.state().globals;
            self.create_lua_closure(proto, upvalues, globals)
        });
        match result {
            Ok(f) => {
                self.push(LuaValue::Function(f));
                LuaStatus::Ok
            }
            Err(e) => {
                let err = std::mem::take(&mut self.state_mut().error_object);
                self.push(err);
                LuaStatus::from(e)
            }
        }
    }

    /// Turn a serialized prototype tree into collectable prototypes. Objects
    /// stay pinned until the next safe point, so the partly built tree needs
    /// no anchoring.
    fn materialize(
        &mut self,
        data: &ChunkData,
        parent_source: Option<StringId>,
    ) -> LuaResult<crate::gc::ChunkId> {
        let source = match &data.source {
            Some(s) => Some(self.create_string(s)?),
            None => parent_source,
        };
        let mut constants = Vec::with_capacity(data.constants.len());
        for k in &data.constants {
            constants.push(match k {
                Constant::Nil => LuaValue::Nil,
                Constant::Boolean(b) => LuaValue::Boolean(*b),
                Constant::Number(n) => LuaValue::Number(*n),
                Constant::String(s) => LuaValue::String(self.create_string(s)?),
            });
        }
        let mut child_protos = Vec::with_capacity(data.protos.len());
        for p in &data.protos {
            child_protos.push(self.materialize(p, source)?);
        }
        let mut locals = Vec::with_capacity(data.locals.len());
        for l in &data.locals {
            locals.push(LocVar {
                name: self.create_string(&l.name)?,
                startpc: l.startpc,
                endpc: l.endpc,
            });
        }
        let mut upvalue_names = Vec::with_capacity(data.upvalue_names.len());
        for n in &data.upvalue_names {
            upvalue_names.push(self.create_string(n)?);
        }
        self.create_chunk(Chunk {
            code: data.code.clone(),
            constants,
            child_protos,
            line_info: data.line_info.clone(),
            locals,
            upvalue_names,
            source,
            linedefined: data.linedefined,
            lastlinedefined: data.lastlinedefined,
            upvalue_count: data.upvalue_count,
            param_count: data.param_count,
            is_vararg: data.is_vararg,
            max_stack_size: data.max_stack_size,
        })
    }

    fn chunk_data(&self, id: crate::gc::ChunkId) -> ChunkData {
        let p = self.pool.chunk(id);
        let bytes = |s: StringId| self.pool.string(s).as_bytes().to_vec();
        ChunkData {
            source: p.source.map(bytes),
            linedefined: p.linedefined,
            lastlinedefined: p.lastlinedefined,
            upvalue_count: p.upvalue_count,
            param_count: p.param_count,
            is_vararg: p.is_vararg,
            max_stack_size: p.max_stack_size,
            code: p.code.clone(),
            constants: p
                .constants
                .iter()
                .map(|k| match *k {
                    LuaValue::Boolean(b) => Constant::Boolean(b),
                    LuaValue::Number(n) => Constant::Number(n),
                    LuaValue::String(s) => Constant::String(bytes(s)),
                    _ => Constant::Nil,
                })
                .collect(),
            protos: p.child_protos.iter().map(|&c| self.chunk_data(c)).collect(),
            line_info: p.line_info.clone(),
            locals: p
                .locals
                .iter()
                .map(|l| LocVarData {
                    name: bytes(l.name),
                    startpc: l.startpc,
                    endpc: l.endpc,
                })
                .collect(),
            upvalue_names: p.upvalue_names.iter().map(|&s| bytes(s)).collect(),
        }
    }

    /// Serialize the Lua function on top of the stack. `None` when the top
    /// value is not a Lua function.
    pub fn dump(&self, strip: bool) -> Option<Vec<u8>> {
        let LuaValue::Function(f) = self.value(-1) else {
            return None;
        };
        match self.pool.function(f) {
            LuaFunction::Lua(cl) => Some(chunk_serializer::dump(&self.chunk_data(cl.chunk), strip)),
            LuaFunction::Native(_) => None,
        }
    }

    // ============ Miscellaneous ============

    /// Pop a key and push the next key/value pair of the table at `idx`.
    /// False (nothing pushed) after the last pair.
    pub fn next(&mut self, idx: i32) -> LuaResult<bool> {
        let t = self.table_at(idx)?;
        let key = self.value(-1);
        match self.pool.table(t).next(&key) {
            Ok(Some((k, v))) => {
                self.replace_top(k);
                self.push(v);
                Ok(true)
            }
            Ok(None) => {
                self.state_mut().top -= 1;
                Ok(false)
            }
            Err(_) => Err(self.error("invalid key to 'next'")),
        }
    }

    /// Concatenate the top `n` values, leaving the result.
    pub fn concat_top(&mut self, n: usize) -> LuaResult<()> {
        match n {
            0 => self.push_bytes(b""),
            1 => Ok(()),
            _ => {
                self.check_gc()?;
                let top = self.state().top;
                self.concat(n, top - 1)?;
                self.state_mut().top -= n - 1;
                Ok(())
            }
        }
    }

    /// Pop the top value and store it in the table at `t` under a fresh
    /// integer key. Nil values get `REFNIL` and are not stored.
    pub fn reference(&mut self, t: i32) -> LuaResult<i32> {
        let t = self.abs_index(t);
        if self.value(-1).is_nil() {
            self.pop(1);
            return Ok(REFNIL);
        }
        let table = self.table_at(t)?;
        let free = match self.pool.table(table).get_int(FREELIST_REF) {
            LuaValue::Number(n) => n as i64,
            _ => 0,
        };
        let r = if free != 0 {
            let next_free = self.pool.table(table).get_int(free);
            self.table_raw_set_int(table, FREELIST_REF, next_free);
            free
        } else {
            self.pool.table(table).length() as i64 + 1
        };
        let v = self.value(-1);
        self.table_raw_set_int(table, r, v);
        self.pop(1);
        Ok(r as i32)
    }

    /// Release reference `r` of the table at `t`, recycling its slot.
    pub fn unreference(&mut self, t: i32, r: i32) -> LuaResult<()> {
        if r < 0 {
            return Ok(());
        }
        let table = self.table_at(t)?;
        let head = self.pool.table(table).get_int(FREELIST_REF);
        self.table_raw_set_int(table, r as i64, head);
        self.table_raw_set_int(table, FREELIST_REF, LuaValue::Number(r as f64));
        Ok(())
    }

    fn replace_top(&mut self, v: LuaValue) {
        let state = self.state_mut();
        let top = state.top;
        state.stack[top - 1] = v;
    }

    /// Numeric value of a string in Lua's decimal/hex syntax.
    pub fn parse_number(&self, s: StringId) -> Option<f64> {
        str_to_number(self.pool.string(s).as_bytes())
    }
}
