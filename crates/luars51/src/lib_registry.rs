// Library registration and argument checking for native library functions
// (the lauxlib layer: luaL_register, luaL_argerror, luaL_check*).

use crate::lua_value::{LuaType, LuaValue};
use crate::lua_vm::{CFunction, LuaError, LuaResult, LuaVM};
use crate::stdlib;

/// Builds a value when its module loads.
pub type ValueInitializer = fn(&mut LuaVM) -> LuaResult<LuaValue>;

/// Entry in a library module - a function or a value
pub enum LibraryEntry {
    Function(CFunction),
    Value(ValueInitializer),
}

/// A named group of functions and values. The module named `_G` is
/// installed directly into the globals table.
pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, LibraryEntry)>,
}

impl LibraryModule {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn with_function(mut self, name: &'static str, func: CFunction) -> Self {
        self.entries.push((name, LibraryEntry::Function(func)));
        self
    }

    pub fn with_value(mut self, name: &'static str, value_init: ValueInitializer) -> Self {
        self.entries.push((name, LibraryEntry::Value(value_init)));
        self
    }
}

/// Builder for library modules made of functions
#[macro_export]
macro_rules! lib_module {
    ($name:expr, {
        $($item_name:expr => $item:expr),* $(,)?
    }) => {{
        let mut module = $crate::lib_registry::LibraryModule::new($name);
        $(
            module.entries.push(($item_name, $crate::lib_registry::LibraryEntry::Function($item)));
        )*
        module
    }};
}

/// Registry of the libraries to install into a VM, in order.
pub struct LibraryRegistry {
    modules: Vec<LibraryModule>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, module: LibraryModule) {
        self.modules.push(module);
    }

    pub fn load_all(&self, vm: &mut LuaVM) -> LuaResult<()> {
        for module in &self.modules {
            self.load_module(vm, module)?;
        }
        Ok(())
    }

    /// Install one module: `_G` entries go straight into the globals
    /// table, any other module becomes a global table of that name.
    pub fn load_module(&self, vm: &mut LuaVM, module: &LibraryModule) -> LuaResult<()> {
        let target = if module.name == "_G" {
            vm.globals()
        } else {
            let t = vm.new_table(0, module.entries.len())?;
            vm.push(LuaValue::Table(t));
            vm.set_global(module.name)?;
            t
        };
        for (name, entry) in &module.entries {
            // anchor the target while entries allocate
            vm.push(LuaValue::Table(target));
            match entry {
                LibraryEntry::Function(func) => vm.push_native_function(*func)?,
                LibraryEntry::Value(value_init) => {
                    let v = value_init(vm)?;
                    vm.push(v);
                }
            }
            vm.set_field(-2, name)?;
            vm.pop(1);
        }
        Ok(())
    }

    pub fn get_module(&self, name: &str) -> Option<&LibraryModule> {
        self.modules.iter().find(|m| m.name == name)
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry holding the base and coroutine libraries.
pub fn create_standard_registry() -> LibraryRegistry {
    let mut registry = LibraryRegistry::new();
    registry.register(stdlib::basic::create_basic_lib());
    registry.register(stdlib::coroutine::create_coroutine_lib());
    registry
}

// ============ Argument helpers ============

/// Raise `msg` prefixed with the position of the Lua code that called the
/// running native function.
pub fn lib_error(vm: &mut LuaVM, msg: impl AsRef<str>) -> LuaError {
    let msg = format!("{}{}", vm.where_at(1), msg.as_ref());
    match vm.create_string(msg.as_bytes()) {
        Ok(s) => vm.raise(LuaValue::String(s)),
        Err(e) => e,
    }
}

/// `bad argument #narg to 'name' (extramsg)`
pub fn arg_error(vm: &mut LuaVM, mut narg: i32, extramsg: &str) -> LuaError {
    let Some(info) = vm.get_info(0) else {
        return lib_error(vm, format!("bad argument #{} ({})", narg, extramsg));
    };
    let name = info.name.unwrap_or_else(|| "?".to_string());
    if info.namewhat == "method" {
        narg -= 1;
        if narg == 0 {
            return lib_error(vm, format!("calling '{}' on bad self ({})", name, extramsg));
        }
    }
    lib_error(vm, format!("bad argument #{} to '{}' ({})", narg, name, extramsg))
}

pub fn type_error_arg(vm: &mut LuaVM, narg: i32, tname: &str) -> LuaError {
    let msg = format!("{} expected, got {}", tname, vm.type_name(narg));
    arg_error(vm, narg, &msg)
}

pub fn check_any(vm: &mut LuaVM, narg: i32) -> LuaResult<LuaValue> {
    match vm.index_value(narg) {
        Some(v) => Ok(v),
        None => Err(arg_error(vm, narg, "value expected")),
    }
}

pub fn check_type(vm: &mut LuaVM, narg: i32, t: LuaType) -> LuaResult<LuaValue> {
    if vm.type_of(narg) != t {
        return Err(type_error_arg(vm, narg, t.name()));
    }
    check_any(vm, narg)
}

pub fn check_table(vm: &mut LuaVM, narg: i32) -> LuaResult<crate::gc::TableId> {
    match vm.index_value(narg) {
        Some(LuaValue::Table(t)) => Ok(t),
        _ => Err(type_error_arg(vm, narg, "table")),
    }
}

pub fn check_number(vm: &mut LuaVM, narg: i32) -> LuaResult<f64> {
    match vm.to_number(narg) {
        Some(n) => Ok(n),
        None => Err(type_error_arg(vm, narg, "number")),
    }
}

pub fn check_integer(vm: &mut LuaVM, narg: i32) -> LuaResult<i64> {
    check_number(vm, narg).map(|n| n as i64)
}

pub fn opt_number(vm: &mut LuaVM, narg: i32, default: f64) -> LuaResult<f64> {
    if vm.is_none_or_nil(narg) {
        Ok(default)
    } else {
        check_number(vm, narg)
    }
}

pub fn opt_integer(vm: &mut LuaVM, narg: i32, default: i64) -> LuaResult<i64> {
    if vm.is_none_or_nil(narg) {
        Ok(default)
    } else {
        check_integer(vm, narg)
    }
}

/// String argument; numbers are converted in place.
pub fn check_string(vm: &mut LuaVM, narg: i32) -> LuaResult<crate::gc::StringId> {
    match vm.to_string_id(narg)? {
        Some(s) => Ok(s),
        None => Err(type_error_arg(vm, narg, "string")),
    }
}

pub fn opt_string(vm: &mut LuaVM, narg: i32) -> LuaResult<Option<crate::gc::StringId>> {
    if vm.is_none_or_nil(narg) {
        Ok(None)
    } else {
        check_string(vm, narg).map(Some)
    }
}

/// Number of arguments passed to the running native function.
#[inline]
pub fn arg_count(vm: &LuaVM) -> usize {
    vm.get_top() as usize
}

/// Raise an argument error unless `cond` holds.
pub fn arg_check(vm: &mut LuaVM, cond: bool, narg: i32, extramsg: &str) -> LuaResult<()> {
    if cond { Ok(()) } else { Err(arg_error(vm, narg, extramsg)) }
}
