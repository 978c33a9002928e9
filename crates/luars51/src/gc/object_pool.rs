// Object Pool - arena holding every heap object of a runtime instance
//
// Key Design Principles:
// 1. Every object lives in one slot of a single Vec; ids are slot indices
// 2. Each slot carries a generation, bumped on free, so stale ids are detected
// 3. Free slots are recycled through a free list
// 4. Slot order doubles as the collector's "global object list" for sweeping

use crate::gc::gc_id::*;
use crate::gc::gc_object::{GcBox, GcHeader, GcKind, GcObject};
use crate::lua_value::{Chunk, LuaFunction, LuaString, LuaTable, LuaUpvalue, LuaUserdata};
use crate::lua_vm::LuaState;

struct Slot {
    generation: u32,
    cell: Option<GcBox>,
}

pub struct ObjectPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Accessing an object through a handle whose object was collected is a
/// broken GC invariant, never a recoverable condition.
#[cold]
#[inline(never)]
fn dangling(r: GcRef, expected: GcKind) -> ! {
    panic!("dangling {:?} handle {:?}", expected, r)
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $id:ty, $variant:ident, $ty:ty) => {
        #[inline]
        pub fn $get(&self, id: $id) -> &$ty {
            match self.get(id.gc_ref()).map(|b| &b.object) {
                Some(GcObject::$variant(v)) => v,
                _ => dangling(id.gc_ref(), GcKind::$variant),
            }
        }

        #[inline]
        pub fn $get_mut(&mut self, id: $id) -> &mut $ty {
            match self.get_mut(id.gc_ref()).map(|b| &mut b.object) {
                Some(GcObject::$variant(v)) => v,
                _ => dangling(id.gc_ref(), GcKind::$variant),
            }
        }
    };
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(256),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, header: GcHeader, object: GcObject) -> GcRef {
        debug_assert_eq!(header.kind, object.kind());
        self.live += 1;
        let cell = Some(GcBox { header, object });
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.cell = cell;
            GcRef::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                cell,
            });
            GcRef::new(index, 0)
        }
    }

    /// Release a slot. The generation bump invalidates every outstanding id.
    pub fn free(&mut self, r: GcRef) -> Option<GcBox> {
        let slot = self.slots.get_mut(r.index())?;
        if slot.generation != r.generation || slot.cell.is_none() {
            return None;
        }
        let cell = slot.cell.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(r.index);
        self.live -= 1;
        cell
    }

    #[inline]
    pub fn get(&self, r: GcRef) -> Option<&GcBox> {
        let slot = self.slots.get(r.index())?;
        if slot.generation != r.generation {
            return None;
        }
        slot.cell.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut GcBox> {
        let slot = self.slots.get_mut(r.index())?;
        if slot.generation != r.generation {
            return None;
        }
        slot.cell.as_mut()
    }

    #[inline]
    pub fn contains(&self, r: GcRef) -> bool {
        self.get(r).is_some()
    }

    #[inline]
    pub fn header(&self, r: GcRef) -> Option<&GcHeader> {
        self.get(r).map(|b| &b.header)
    }

    #[inline]
    pub fn header_mut(&mut self, r: GcRef) -> Option<&mut GcHeader> {
        self.get_mut(r).map(|b| &mut b.header)
    }

    /// Number of slots (occupied or not); the sweep cursor runs over this range.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Live object at a slot index, if any.
    #[inline]
    pub fn ref_at(&self, index: usize) -> Option<GcRef> {
        let slot = self.slots.get(index)?;
        slot.cell
            .as_ref()
            .map(|_| GcRef::new(index as u32, slot.generation))
    }

    /// Number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    typed_access!(table, table_mut, TableId, Table, LuaTable);
    typed_access!(function, function_mut, FunctionId, Function, LuaFunction);
    typed_access!(upvalue, upvalue_mut, UpvalueId, Upvalue, LuaUpvalue);
    typed_access!(userdata, userdata_mut, UserdataId, Userdata, LuaUserdata);
    typed_access!(chunk, chunk_mut, ChunkId, Chunk, Chunk);

    #[inline]
    pub fn string(&self, id: StringId) -> &LuaString {
        match self.get(id.gc_ref()).map(|b| &b.object) {
            Some(GcObject::String(s)) => s,
            _ => dangling(id.gc_ref(), GcKind::String),
        }
    }

    #[inline]
    pub fn thread(&self, id: ThreadId) -> &LuaState {
        match self.get(id.gc_ref()).map(|b| &b.object) {
            Some(GcObject::Thread(t)) => t,
            _ => dangling(id.gc_ref(), GcKind::Thread),
        }
    }

    #[inline]
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut LuaState {
        match self.get_mut(id.gc_ref()).map(|b| &mut b.object) {
            Some(GcObject::Thread(t)) => t,
            _ => dangling(id.gc_ref(), GcKind::Thread),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::gc_object::WHITE0BIT;

    fn upvalue_header() -> GcHeader {
        GcHeader::new(GcKind::Upvalue, 1 << WHITE0BIT, 32)
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut pool = ObjectPool::new();
        let a = pool.alloc(
            upvalue_header(),
            GcObject::Upvalue(LuaUpvalue::Closed(crate::LuaValue::Nil)),
        );
        assert!(pool.free(a).is_some());
        let b = pool.alloc(
            upvalue_header(),
            GcObject::Upvalue(LuaUpvalue::Closed(crate::LuaValue::Boolean(true))),
        );
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(pool.get(a).is_none());
        assert!(pool.get(b).is_some());
        assert!(pool.free(a).is_none());
        assert_eq!(pool.len(), 1);
    }
}
