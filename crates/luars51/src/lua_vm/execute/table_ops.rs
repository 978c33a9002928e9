// Indexing with `__index` / `__newindex` chains (luaV_gettable / luaV_settable)

use crate::lua_value::LuaValue;
use crate::lua_vm::execute::metamethod::{Operand, TmKind};
use crate::lua_vm::lua_limits::MAXTAGLOOP;
use crate::lua_vm::{LuaResult, LuaVM};

impl LuaVM {
    /// `t[key]` with metamethods. `t.slot` names the indexed variable in
    /// error messages.
    pub(crate) fn get_table_value(&mut self, t: Operand, key: LuaValue) -> LuaResult<LuaValue> {
        let mut current = t;
        for _ in 0..MAXTAGLOOP {
            let tm = match current.value {
                LuaValue::Table(id) => {
                    let table = self.pool.table(id);
                    let res = table.get(&key);
                    if !res.is_nil() {
                        return Ok(res);
                    }
                    let mt = table.metatable();
                    match self.fast_tm(mt, TmKind::Index) {
                        Some(tm) => tm,
                        None => return Ok(res),
                    }
                }
                other => {
                    let tm = self.get_tm_by_obj(&other, TmKind::Index);
                    if tm.is_nil() {
                        return Err(self.type_error(current, "index"));
                    }
                    tm
                }
            };
            if tm.is_function() {
                return self.call_tm_res(tm, current.value, key);
            }
            current = Operand::new(tm, None);
        }
        Err(self.error("loop in gettable"))
    }

    /// `t[key] = value` with metamethods and write barrier.
    pub(crate) fn set_table_value(&mut self, t: Operand, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        let mut current = t;
        for _ in 0..MAXTAGLOOP {
            let tm = match current.value {
                LuaValue::Table(id) => {
                    match key {
                        LuaValue::Nil => return Err(self.error("table index is nil")),
                        LuaValue::Number(n) if n.is_nan() => {
                            return Err(self.error("table index is NaN"));
                        }
                        _ => {}
                    }
                    let table = self.pool.table(id);
                    let old = table.get(&key);
                    let mt = table.metatable();
                    let tm = if old.is_nil() {
                        self.fast_tm(mt, TmKind::NewIndex)
                    } else {
                        None
                    };
                    match tm {
                        Some(tm) => tm,
                        None => return self.table_raw_set(id, key, value),
                    }
                }
                other => {
                    let tm = self.get_tm_by_obj(&other, TmKind::NewIndex);
                    if tm.is_nil() {
                        return Err(self.type_error(current, "index"));
                    }
                    tm
                }
            };
            if tm.is_function() {
                return self.call_tm(tm, current.value, key, value);
            }
            current = Operand::new(tm, None);
        }
        Err(self.error("loop in settable"))
    }
}
