// Lua 5.1 Runtime
// An embeddable bytecode interpreter with an incremental garbage collector

#[cfg(test)]
mod test;

pub mod gc;
pub mod lib_registry;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use gc::*;
pub use lib_registry::LibraryRegistry;
pub use lua_value::chunk_serializer::ChunkData;
pub use lua_value::{Chunk, LuaFunction, LuaTable, LuaType, LuaValue};
pub use lua_vm::api::{ENVIRONINDEX, GLOBALSINDEX, REGISTRYINDEX, upvalue_index};
pub use lua_vm::coroutine::CoroutineStatus;
pub use lua_vm::debug_info::{DebugInfo, HookEvent};
pub use lua_vm::{
    CFunction, GcOption, Instruction, LuaError, LuaResult, LuaStatus, LuaVM, OpCode, SafeOption,
};
pub use stdlib::Stdlib;
