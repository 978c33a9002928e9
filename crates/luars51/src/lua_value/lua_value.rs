// Tagged Lua value.
//
// Values are small Copy handles: inline payload for nil/boolean/number/light
// userdata, a generation-checked pool id for everything collectable.

use crate::gc::gc_id::*;

/// Basic type tags, numbered like the reference implementation's `LUA_T*`.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    None = -1,
    Nil = 0,
    Boolean = 1,
    LightUserdata = 2,
    Number = 3,
    String = 4,
    Table = 5,
    Function = 6,
    Userdata = 7,
    Thread = 8,
}

/// Number of basic types that can carry a per-type metatable.
pub const NUM_TYPES: usize = 9;

impl LuaType {
    pub fn name(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Userdata => "userdata",
            LuaType::Thread => "thread",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    Boolean(bool),
    LightUserdata(usize),
    Number(f64),
    String(StringId),
    Table(TableId),
    Function(FunctionId),
    Userdata(UserdataId),
    Thread(ThreadId),
}

/// Raw equality: no metamethods. Numbers compare with IEEE `==`, so NaN is
/// never equal to itself; collectable values compare by handle.
impl PartialEq for LuaValue {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::LightUserdata(a), LuaValue::LightUserdata(b)) => a == b,
            (LuaValue::Number(a), LuaValue::Number(b)) => a == b,
            (LuaValue::String(a), LuaValue::String(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => a == b,
            (LuaValue::Function(a), LuaValue::Function(b)) => a == b,
            (LuaValue::Userdata(a), LuaValue::Userdata(b)) => a == b,
            (LuaValue::Thread(a), LuaValue::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl LuaValue {
    #[inline(always)]
    pub const fn nil() -> Self {
        LuaValue::Nil
    }

    #[inline(always)]
    pub const fn boolean(b: bool) -> Self {
        LuaValue::Boolean(b)
    }

    #[inline(always)]
    pub const fn number(n: f64) -> Self {
        LuaValue::Number(n)
    }

    #[inline(always)]
    pub fn type_of(&self) -> LuaType {
        match self {
            LuaValue::Nil => LuaType::Nil,
            LuaValue::Boolean(_) => LuaType::Boolean,
            LuaValue::LightUserdata(_) => LuaType::LightUserdata,
            LuaValue::Number(_) => LuaType::Number,
            LuaValue::String(_) => LuaType::String,
            LuaValue::Table(_) => LuaType::Table,
            LuaValue::Function(_) => LuaType::Function,
            LuaValue::Userdata(_) => LuaType::Userdata,
            LuaValue::Thread(_) => LuaType::Thread,
        }
    }

    #[inline(always)]
    pub fn type_name(&self) -> &'static str {
        self.type_of().name()
    }

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    /// `nil` and `false` are the only false values.
    #[inline(always)]
    pub fn is_falsy(&self) -> bool {
        matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        matches!(self, LuaValue::Number(_))
    }

    #[inline(always)]
    pub fn is_string(&self) -> bool {
        matches!(self, LuaValue::String(_))
    }

    #[inline(always)]
    pub fn is_table(&self) -> bool {
        matches!(self, LuaValue::Table(_))
    }

    #[inline(always)]
    pub fn is_function(&self) -> bool {
        matches!(self, LuaValue::Function(_))
    }

    #[inline(always)]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            LuaValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_string_id(&self) -> Option<StringId> {
        match self {
            LuaValue::String(s) => Some(*s),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_table_id(&self) -> Option<TableId> {
        match self {
            LuaValue::Table(t) => Some(*t),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_function_id(&self) -> Option<FunctionId> {
        match self {
            LuaValue::Function(f) => Some(*f),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_userdata_id(&self) -> Option<UserdataId> {
        match self {
            LuaValue::Userdata(u) => Some(*u),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_thread_id(&self) -> Option<ThreadId> {
        match self {
            LuaValue::Thread(t) => Some(*t),
            _ => None,
        }
    }

    /// Pool reference of a collectable value.
    #[inline(always)]
    pub fn gc_ref(&self) -> Option<GcRef> {
        match self {
            LuaValue::String(s) => Some(s.gc_ref()),
            LuaValue::Table(t) => Some(t.gc_ref()),
            LuaValue::Function(f) => Some(f.gc_ref()),
            LuaValue::Userdata(u) => Some(u.gc_ref()),
            LuaValue::Thread(t) => Some(t.gc_ref()),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_collectable(&self) -> bool {
        self.gc_ref().is_some()
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

impl From<f64> for LuaValue {
    fn from(n: f64) -> Self {
        LuaValue::Number(n)
    }
}

impl From<i64> for LuaValue {
    fn from(n: i64) -> Self {
        LuaValue::Number(n as f64)
    }
}

impl From<TableId> for LuaValue {
    fn from(t: TableId) -> Self {
        LuaValue::Table(t)
    }
}

impl From<StringId> for LuaValue {
    fn from(s: StringId) -> Self {
        LuaValue::String(s)
    }
}

impl From<FunctionId> for LuaValue {
    fn from(f: FunctionId) -> Self {
        LuaValue::Function(f)
    }
}

#[cfg(test)]
mod value_tests {
    use super::*;

    #[test]
    fn test_raw_equality() {
        assert_eq!(LuaValue::Nil, LuaValue::Nil);
        assert_eq!(LuaValue::Number(0.0), LuaValue::Number(-0.0));
        assert_ne!(LuaValue::Number(f64::NAN), LuaValue::Number(f64::NAN));
        assert_ne!(LuaValue::Boolean(false), LuaValue::Nil);
        assert_ne!(LuaValue::Number(1.0), LuaValue::Boolean(true));
    }

    #[test]
    fn test_truthiness() {
        assert!(LuaValue::Nil.is_falsy());
        assert!(LuaValue::Boolean(false).is_falsy());
        assert!(!LuaValue::Number(0.0).is_falsy());
        assert!(!LuaValue::LightUserdata(0).is_falsy());
    }

    #[test]
    fn test_value_is_compact() {
        assert!(std::mem::size_of::<LuaValue>() <= 16);
    }
}
