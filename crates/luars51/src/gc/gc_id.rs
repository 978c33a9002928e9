// ============ Object IDs ============
// Every heap object is addressed by a slot index into the object pool plus
// the generation the slot had when the object was allocated. A freed slot
// bumps its generation, so a stale id never aliases a newer object.

/// Generation-checked handle into the object pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GcRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl GcRef {
    #[inline(always)]
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline(always)]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

macro_rules! gc_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        #[repr(transparent)]
        pub struct $name(pub(crate) GcRef);

        impl $name {
            #[inline(always)]
            pub fn gc_ref(self) -> GcRef {
                self.0
            }
        }
    };
}

gc_handle!(
    /// Handle to a table.
    TableId
);
gc_handle!(
    /// Handle to a Lua or native closure.
    FunctionId
);
gc_handle!(
    /// Handle to an upvalue cell.
    UpvalueId
);
gc_handle!(
    /// Handle to a full userdata block.
    UserdataId
);
gc_handle!(
    /// Handle to a coroutine (thread).
    ThreadId
);
gc_handle!(
    /// Handle to a function prototype.
    ChunkId
);

/// Handle to an interned string.
///
/// The string hash travels with the handle so the table engine can place
/// string keys without reaching back into the pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StringId {
    pub(crate) r: GcRef,
    pub(crate) hash: u32,
}

impl StringId {
    #[inline(always)]
    pub fn gc_ref(self) -> GcRef {
        self.r
    }

    #[inline(always)]
    pub fn hash(self) -> u32 {
        self.hash
    }
}
