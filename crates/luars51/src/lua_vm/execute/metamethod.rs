/// Metamethod lookup and the operations that fall back on it
///
/// Based on Lua 5.1 ltm.c and the slow paths of lvm.c
use crate::gc::TableId;
use crate::lua_value::{LuaValue, lua_convert::str_to_number};
use crate::lua_vm::{LuaResult, LuaVM};

/// Tag Method types (TMS from ltm.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex = 1,
    Gc = 2,
    Mode = 3,
    Eq = 4, // last event with a fast-access absence bit
    Add = 5,
    Sub = 6,
    Mul = 7,
    Div = 8,
    Mod = 9,
    Pow = 10,
    Unm = 11,
    Len = 12,
    Lt = 13,
    Le = 14,
    Concat = 15,
    Call = 16,
}

impl TmKind {
    /// Number of tag methods
    pub const N: usize = 17;

    pub const ALL: [TmKind; TmKind::N] = [
        TmKind::Index,
        TmKind::NewIndex,
        TmKind::Gc,
        TmKind::Mode,
        TmKind::Eq,
        TmKind::Add,
        TmKind::Sub,
        TmKind::Mul,
        TmKind::Div,
        TmKind::Mod,
        TmKind::Pow,
        TmKind::Unm,
        TmKind::Len,
        TmKind::Lt,
        TmKind::Le,
        TmKind::Concat,
        TmKind::Call,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Gc => "__gc",
            TmKind::Mode => "__mode",
            TmKind::Eq => "__eq",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Div => "__div",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Unm => "__unm",
            TmKind::Len => "__len",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Concat => "__concat",
            TmKind::Call => "__call",
        }
    }
}

/// Operand of an instruction: its value plus the stack slot it came from,
/// when it came from one (used to name variables in error messages).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Operand {
    pub value: LuaValue,
    pub slot: Option<usize>,
}

impl Operand {
    #[inline(always)]
    pub fn new(value: LuaValue, slot: Option<usize>) -> Self {
        Operand { value, slot }
    }
}

/// Number value of `v`, converting numeric strings.
#[inline]
pub(crate) fn to_number(vm: &LuaVM, v: &LuaValue) -> Option<f64> {
    match v {
        LuaValue::Number(n) => Some(*n),
        LuaValue::String(s) => str_to_number(vm.pool.string(*s).as_bytes()),
        _ => None,
    }
}

#[inline]
pub(crate) fn arith_op(op: TmKind, a: f64, b: f64) -> f64 {
    match op {
        TmKind::Add => a + b,
        TmKind::Sub => a - b,
        TmKind::Mul => a * b,
        TmKind::Div => a / b,
        TmKind::Mod => a - (a / b).floor() * b,
        TmKind::Pow => a.powf(b),
        TmKind::Unm => -a,
        _ => f64::NAN,
    }
}

impl LuaVM {
    /// Metamethod of a table that caches absence for the first events.
    pub(crate) fn fast_tm(&mut self, mt: Option<TableId>, event: TmKind) -> Option<LuaValue> {
        let mt = mt?;
        let bit = 1u8 << (event as u8);
        let table = self.pool.table_mut(mt);
        if table.flags & bit != 0 {
            return None;
        }
        let tm = table.get_str(self.tm_names[event as usize]);
        if tm.is_nil() {
            table.flags |= bit;
            None
        } else {
            Some(tm)
        }
    }

    /// Metatable of any value.
    pub fn get_metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        match v {
            LuaValue::Table(t) => self.pool.table(*t).metatable(),
            LuaValue::Userdata(u) => self.pool.userdata(*u).metatable(),
            other => self.metatables[other.type_of() as usize],
        }
    }

    pub(crate) fn get_tm_by_obj(&self, v: &LuaValue, event: TmKind) -> LuaValue {
        match self.get_metatable_of(v) {
            Some(mt) => self.pool.table(mt).get_str(self.tm_names[event as usize]),
            None => LuaValue::Nil,
        }
    }

    /// Call metamethod `tm(p1, p2)` and return its first result.
    pub(crate) fn call_tm_res(&mut self, tm: LuaValue, p1: LuaValue, p2: LuaValue) -> LuaResult<LuaValue> {
        self.check_stack_or_error(3)?;
        let func = self.state().top;
        {
            let state = self.state_mut();
            state.push(tm);
            state.push(p1);
            state.push(p2);
        }
        self.call_at(func, 1)?;
        let state = self.state_mut();
        state.top -= 1;
        Ok(state.stack[state.top])
    }

    /// Call metamethod `tm(p1, p2, p3)` discarding results.
    pub(crate) fn call_tm(&mut self, tm: LuaValue, p1: LuaValue, p2: LuaValue, p3: LuaValue) -> LuaResult<()> {
        self.check_stack_or_error(4)?;
        let func = self.state().top;
        {
            let state = self.state_mut();
            state.push(tm);
            state.push(p1);
            state.push(p2);
            state.push(p3);
        }
        self.call_at(func, 0)
    }

    /// Binary event handler from the first operand, else the second.
    pub(crate) fn call_bin_tm(
        &mut self,
        p1: LuaValue,
        p2: LuaValue,
        event: TmKind,
    ) -> LuaResult<Option<LuaValue>> {
        let mut tm = self.get_tm_by_obj(&p1, event);
        if tm.is_nil() {
            tm = self.get_tm_by_obj(&p2, event);
        }
        if tm.is_nil() {
            return Ok(None);
        }
        self.call_tm_res(tm, p1, p2).map(Some)
    }

    /// Arithmetic with string coercion and metamethod fallback.
    pub(crate) fn arith(&mut self, b: Operand, c: Operand, op: TmKind) -> LuaResult<LuaValue> {
        if let (Some(nb), Some(nc)) = (to_number(self, &b.value), to_number(self, &c.value)) {
            return Ok(LuaValue::Number(arith_op(op, nb, nc)));
        }
        match self.call_bin_tm(b.value, c.value, op)? {
            Some(v) => Ok(v),
            None => Err(self.arith_error(b, c)),
        }
    }

    /// `#v` for values other than strings and tables.
    pub(crate) fn obj_len_tm(&mut self, v: Operand) -> LuaResult<LuaValue> {
        match self.call_bin_tm(v.value, LuaValue::Nil, TmKind::Len)? {
            Some(r) => Ok(r),
            None => Err(self.type_error(v, "get length of")),
        }
    }

    // ============ Comparison ============

    fn get_comp_tm(&mut self, mt1: Option<TableId>, mt2: Option<TableId>, event: TmKind) -> Option<LuaValue> {
        let tm1 = self.fast_tm(mt1, event)?;
        if mt1 == mt2 {
            return Some(tm1);
        }
        let tm2 = self.fast_tm(mt2, event)?;
        if tm1 == tm2 { Some(tm1) } else { None }
    }

    /// Equality with `__eq` for tables and userdata.
    pub fn equal_values(&mut self, t1: LuaValue, t2: LuaValue) -> LuaResult<bool> {
        if t1.type_of() != t2.type_of() {
            return Ok(false);
        }
        let tm = match (t1, t2) {
            (LuaValue::Table(a), LuaValue::Table(b)) => {
                if a == b {
                    return Ok(true);
                }
                let (mt1, mt2) = (self.pool.table(a).metatable(), self.pool.table(b).metatable());
                self.get_comp_tm(mt1, mt2, TmKind::Eq)
            }
            (LuaValue::Userdata(a), LuaValue::Userdata(b)) => {
                if a == b {
                    return Ok(true);
                }
                let (mt1, mt2) = (
                    self.pool.userdata(a).metatable(),
                    self.pool.userdata(b).metatable(),
                );
                self.get_comp_tm(mt1, mt2, TmKind::Eq)
            }
            _ => return Ok(t1 == t2),
        };
        match tm {
            Some(tm) => Ok(!self.call_tm_res(tm, t1, t2)?.is_falsy()),
            None => Ok(false),
        }
    }

    /// Order metamethod shared by both operands; `None` when absent.
    fn call_order_tm(&mut self, p1: LuaValue, p2: LuaValue, event: TmKind) -> LuaResult<Option<bool>> {
        let tm1 = self.get_tm_by_obj(&p1, event);
        if tm1.is_nil() {
            return Ok(None);
        }
        let tm2 = self.get_tm_by_obj(&p2, event);
        if tm1 != tm2 {
            return Ok(None);
        }
        Ok(Some(!self.call_tm_res(tm1, p1, p2)?.is_falsy()))
    }

    pub fn less_than_values(&mut self, l: LuaValue, r: LuaValue) -> LuaResult<bool> {
        match (l, r) {
            (LuaValue::Number(a), LuaValue::Number(b)) => Ok(a < b),
            (LuaValue::String(a), LuaValue::String(b)) => {
                Ok(self.pool.string(a).as_bytes() < self.pool.string(b).as_bytes())
            }
            _ if l.type_of() != r.type_of() => Err(self.order_error(l, r)),
            _ => match self.call_order_tm(l, r, TmKind::Lt)? {
                Some(res) => Ok(res),
                None => Err(self.order_error(l, r)),
            },
        }
    }

    pub fn less_equal_values(&mut self, l: LuaValue, r: LuaValue) -> LuaResult<bool> {
        match (l, r) {
            (LuaValue::Number(a), LuaValue::Number(b)) => Ok(a <= b),
            (LuaValue::String(a), LuaValue::String(b)) => {
                Ok(self.pool.string(a).as_bytes() <= self.pool.string(b).as_bytes())
            }
            _ if l.type_of() != r.type_of() => Err(self.order_error(l, r)),
            _ => {
                if let Some(res) = self.call_order_tm(l, r, TmKind::Le)? {
                    return Ok(res);
                }
                match self.call_order_tm(r, l, TmKind::Lt)? {
                    Some(res) => Ok(!res),
                    None => Err(self.order_error(l, r)),
                }
            }
        }
    }

    // ============ Calls ============

    /// Replace a non-function at `func` by its `__call` handler, shifting
    /// the arguments up by one so the object becomes the first argument.
    pub(crate) fn try_func_tm(&mut self, func: usize) -> LuaResult<LuaValue> {
        let obj = self.state().stack[func];
        let tm = self.get_tm_by_obj(&obj, TmKind::Call);
        if !tm.is_function() {
            return Err(self.type_error(Operand::new(obj, Some(func)), "call"));
        }
        self.check_stack_or_error(1)?;
        let state = self.state_mut();
        let top = state.top;
        state.stack.copy_within(func..top, func + 1);
        state.top += 1;
        state.stack[func] = tm;
        Ok(tm)
    }
}
