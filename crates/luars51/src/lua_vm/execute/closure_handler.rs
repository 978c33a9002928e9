// Upvalue cells: creation, sharing and closing (lfunc.c)
//
// Each thread keeps its open upvalues sorted by stack slot, so two
// closures capturing the same slot always receive the same cell.

use crate::gc::{ThreadId, UpvalueId};
use crate::lua_value::{LuaUpvalue, LuaValue};
use crate::lua_vm::{LuaResult, LuaVM};

impl LuaVM {
    /// Open upvalue for slot `index` of the running thread, reusing an
    /// existing cell.
    pub(crate) fn find_upvalue(&mut self, index: usize) -> LuaResult<UpvalueId> {
        let pos = match self.state().find_open_upvalue(index) {
            Ok(uv) => {
                // a dead cell not yet swept comes back to life
                let other_white = self.gc.other_white();
                if let Some(h) = self.pool.header_mut(uv.gc_ref())
                    && h.is_dead(other_white)
                {
                    h.change_white();
                }
                return Ok(uv);
            }
            Err(pos) => pos,
        };
        let thread = self.current;
        let uv = self.create_upvalue(LuaUpvalue::Open { thread, index })?;
        self.gc.open_upvalues.insert(uv);
        self.state_mut().open_upvalues.insert(pos, (index, uv));
        Ok(uv)
    }

    /// Close every open upvalue of the running thread at or above `level`.
    pub(crate) fn close_upvalues(&mut self, level: usize) {
        let thread = self.current;
        self.close_thread_upvalues(thread, level);
    }

    pub(crate) fn close_thread_upvalues(&mut self, thread: ThreadId, level: usize) {
        let state = self.pool.thread_mut(thread);
        let from = state.first_open_upvalue_at(level);
        if from == state.open_upvalues.len() {
            return;
        }
        let closing: Vec<(usize, UpvalueId)> = state.open_upvalues.drain(from..).collect();
        for (index, uv) in closing {
            let value = self.pool.thread(thread).stack[index];
            *self.pool.upvalue_mut(uv) = LuaUpvalue::Closed(value);
            self.gc.close_upvalue_barrier(&mut self.pool, uv, value);
        }
    }

    #[inline]
    pub(crate) fn get_upvalue_value(&self, uv: UpvalueId) -> LuaValue {
        match *self.pool.upvalue(uv) {
            LuaUpvalue::Open { thread, index } => self.pool.thread(thread).stack[index],
            LuaUpvalue::Closed(v) => v,
        }
    }

    #[inline]
    pub(crate) fn set_upvalue_value(&mut self, uv: UpvalueId, value: LuaValue) {
        match *self.pool.upvalue(uv) {
            LuaUpvalue::Open { thread, index } => {
                self.pool.thread_mut(thread).stack[index] = value;
            }
            LuaUpvalue::Closed(_) => {
                *self.pool.upvalue_mut(uv) = LuaUpvalue::Closed(value);
                self.object_barrier(uv.gc_ref(), value);
            }
        }
    }
}
