// Lua 5.1 value representation and heap object payloads.
// Values are 16-byte Copy handles; every heap object is reached through its pool id.
pub mod chunk_serializer;
pub mod lua_convert;
mod lua_table;
mod lua_value;
pub mod verify;

use std::any::Any;
use std::fmt;

use crate::gc::gc_id::*;
use crate::lua_vm::{CFunction, Instruction};

pub use lua_table::{InvalidNextKey, LuaTable};
pub use lua_value::{LuaType, LuaValue, NUM_TYPES};

/// Immutable interned byte string with its cached hash.
pub struct LuaString {
    pub(crate) hash: u32,
    data: Box<[u8]>,
}

impl LuaString {
    pub fn new(data: &[u8], hash: u32) -> Self {
        Self {
            hash,
            data: data.into(),
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// UTF-8 view, when the bytes happen to be valid UTF-8.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.data))
    }
}

/// Full userdata: a host-owned Rust value plus its metatable and environment.
pub struct LuaUserdata {
    data: Box<dyn Any>,
    /// Size reported by the length operator and accounted by the collector
    size: usize,
    pub(crate) metatable: Option<TableId>,
    pub(crate) env: TableId,
}

impl LuaUserdata {
    pub fn new(data: Box<dyn Any>, size: usize, env: TableId) -> Self {
        LuaUserdata {
            data,
            size,
            metatable: None,
            env,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> &dyn Any {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> &mut dyn Any {
        self.data.as_mut()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut::<T>()
    }

    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    pub fn env(&self) -> TableId {
        self.env
    }
}

/// Scripted closure: shared prototype plus its own upvalue cells.
#[derive(Debug, Clone)]
pub struct LuaClosure {
    pub chunk: ChunkId,
    pub upvalues: Vec<UpvalueId>,
    pub env: TableId,
}

/// Native closure: a Rust callback plus captured values.
#[derive(Clone)]
pub struct NativeClosure {
    pub func: CFunction,
    pub upvalues: Vec<LuaValue>,
    pub env: TableId,
}

pub enum LuaFunction {
    Lua(LuaClosure),
    Native(NativeClosure),
}

impl LuaFunction {
    #[inline]
    pub fn is_lua(&self) -> bool {
        matches!(self, LuaFunction::Lua(_))
    }

    #[inline]
    pub fn env(&self) -> TableId {
        match self {
            LuaFunction::Lua(c) => c.env,
            LuaFunction::Native(c) => c.env,
        }
    }

    #[inline]
    pub fn set_env(&mut self, env: TableId) {
        match self {
            LuaFunction::Lua(c) => c.env = env,
            LuaFunction::Native(c) => c.env = env,
        }
    }

    pub fn upvalue_count(&self) -> usize {
        match self {
            LuaFunction::Lua(c) => c.upvalues.len(),
            LuaFunction::Native(c) => c.upvalues.len(),
        }
    }
}

/// Upvalue cell. Open while the captured slot is alive on its thread's
/// stack, closed (owning a copy) afterwards.
#[derive(Debug, Clone, Copy)]
pub enum LuaUpvalue {
    Open { thread: ThreadId, index: usize },
    Closed(LuaValue),
}

impl LuaUpvalue {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, LuaUpvalue::Open { .. })
    }

    /// Stack slot aliased by an open upvalue.
    #[inline]
    pub fn stack_index(&self) -> Option<usize> {
        match self {
            LuaUpvalue::Open { index, .. } => Some(*index),
            LuaUpvalue::Closed(_) => None,
        }
    }
}

/// Debug record of a local variable's live range.
#[derive(Debug, Clone, Copy)]
pub struct LocVar {
    pub name: StringId,
    pub startpc: u32,
    pub endpc: u32,
}

pub const VARARG_HASARG: u8 = 1;
pub const VARARG_ISVARARG: u8 = 2;
pub const VARARG_NEEDSARG: u8 = 4;

/// Function prototype, shared by every closure instantiated from it.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub code: Vec<Instruction>,
    pub constants: Vec<LuaValue>,
    pub child_protos: Vec<ChunkId>,
    pub line_info: Vec<u32>,
    pub locals: Vec<LocVar>,
    pub upvalue_names: Vec<StringId>,
    pub source: Option<StringId>,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    pub upvalue_count: u8,
    pub param_count: u8,
    pub is_vararg: u8,
    pub max_stack_size: u8,
}

impl Chunk {
    /// Line of the instruction at `pc`, when line info is present.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_info.get(pc).copied()
    }

    /// Name of the `n`-th (1-based) local variable active at `pc`.
    pub fn local_name(&self, mut n: usize, pc: usize) -> Option<StringId> {
        for var in &self.locals {
            if var.startpc as usize > pc {
                break;
            }
            if pc < var.endpc as usize {
                n -= 1;
                if n == 0 {
                    return Some(var.name);
                }
            }
        }
        None
    }
}
