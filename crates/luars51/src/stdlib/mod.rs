// Lua 5.1 standard libraries: base and coroutine

pub mod basic;
pub mod coroutine;

use crate::lib_registry::LibraryRegistry;
use crate::lua_vm::{LuaResult, LuaVM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdlib {
    Basic,
    Coroutine,

    All,
}

impl LuaVM {
    /// Install a standard library into the running thread's globals.
    pub fn open_stdlib(&mut self, lib: Stdlib) -> LuaResult<()> {
        let mut registry = LibraryRegistry::new();
        match lib {
            Stdlib::Basic => registry.register(basic::create_basic_lib()),
            Stdlib::Coroutine => registry.register(coroutine::create_coroutine_lib()),
            Stdlib::All => registry = crate::lib_registry::create_standard_registry(),
        }
        let top = self.get_top();
        let result = registry.load_all(self);
        self.set_top(top);
        result
    }
}
