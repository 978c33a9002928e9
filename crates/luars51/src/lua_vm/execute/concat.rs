// String concatenation over a register range (luaV_concat)
//
// Works right to left: every pass joins the longest run of strings and
// numbers ending at the top, or hands the last two operands to `__concat`.

use crate::lua_value::LuaValue;
use crate::lua_value::lua_convert::number_to_string;
use crate::lua_vm::execute::metamethod::{Operand, TmKind};
use crate::lua_vm::{LuaResult, LuaVM};

impl LuaVM {
    /// Convert a number at `slot` to a string in place. False when the
    /// value is neither string nor number.
    pub(crate) fn to_string_in_place(&mut self, slot: usize) -> LuaResult<bool> {
        match self.state().stack[slot] {
            LuaValue::String(_) => Ok(true),
            LuaValue::Number(n) => {
                let s = self.create_string(number_to_string(n).as_bytes())?;
                self.state_mut().stack[slot] = LuaValue::String(s);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Concatenate the `total` values ending at absolute slot `last`;
    /// the result replaces the first of them.
    pub(crate) fn concat(&mut self, mut total: usize, mut last: usize) -> LuaResult<()> {
        while total > 1 {
            let top = last + 1;
            let mut n = 2;
            let first_ok = matches!(
                self.state().stack[top - 2],
                LuaValue::String(_) | LuaValue::Number(_)
            );
            if !first_ok || !self.to_string_in_place(top - 1)? {
                let (p1, p2) = {
                    let stack = &self.state().stack;
                    (stack[top - 2], stack[top - 1])
                };
                match self.call_bin_tm(p1, p2, TmKind::Concat)? {
                    Some(v) => self.state_mut().stack[top - 2] = v,
                    None => {
                        return Err(self.concat_error(
                            Operand::new(p1, Some(top - 2)),
                            Operand::new(p2, Some(top - 1)),
                        ));
                    }
                }
            } else if self.string_len_at(top - 1) == 0 {
                self.to_string_in_place(top - 2)?;
            } else {
                let mut tl = self.string_len_at(top - 1);
                n = 1;
                while n < total && self.to_string_in_place(top - n - 1)? {
                    tl += self.string_len_at(top - n - 1);
                    n += 1;
                }
                let mut buffer = Vec::with_capacity(tl);
                for slot in top - n..top {
                    if let LuaValue::String(s) = self.state().stack[slot] {
                        buffer.extend_from_slice(self.pool.string(s).as_bytes());
                    }
                }
                let s = self.create_string(&buffer)?;
                self.state_mut().stack[top - n] = LuaValue::String(s);
            }
            total -= n - 1;
            last -= n - 1;
        }
        Ok(())
    }

    fn string_len_at(&self, slot: usize) -> usize {
        match self.state().stack[slot] {
            LuaValue::String(s) => self.pool.string(s).len(),
            _ => 0,
        }
    }
}
