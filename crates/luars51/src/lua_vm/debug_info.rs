// Frame inspection, hooks and error-message helpers (ldebug.c)
//
// Stack levels count from the running function (level 0) outward; every
// tail call collapsed into a frame adds one pseudo level right after it.

use crate::gc::ChunkId;
use crate::lua_value::{LuaFunction, LuaValue};
use crate::lua_vm::execute::metamethod::{Operand, to_number};
use crate::lua_vm::lua_limits::{LUA_IDSIZE, LUA_MINSTACK};
use crate::lua_vm::{Instruction, LuaError, LuaResult, LuaVM, OpCode};

pub const MASK_CALL: u8 = 1 << 0;
pub const MASK_RET: u8 = 1 << 1;
pub const MASK_LINE: u8 = 1 << 2;
pub const MASK_COUNT: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    /// Return from a function whose frame was reused by a tail call
    TailReturn,
    Line,
    Count,
}

/// Debug hook. Receives the event and, for line events, the new line.
pub type HookFn = fn(&mut LuaVM, HookEvent, i32) -> LuaResult<()>;

/// Description of one stack level, the fields of `lua_Debug`.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    /// Source name as stored in the prototype (`"=[C]"` for native code)
    pub source: String,
    /// Printable form of `source`, at most `LUA_IDSIZE` bytes
    pub short_src: String,
    /// `"Lua"`, `"C"`, `"main"` or `"tail"`
    pub what: &'static str,
    pub currentline: i32,
    pub linedefined: i32,
    pub lastlinedefined: i32,
    pub nups: usize,
    /// Name the caller used for the function, if it can be recovered
    pub name: Option<String>,
    /// `"global"`, `"local"`, `"method"`, `"field"`, `"upvalue"` or empty
    pub namewhat: &'static str,
    pub func: LuaValue,
}

/// A stack level: a real frame or a collapsed tail call.
#[derive(Debug, Clone, Copy)]
enum Level {
    Frame(usize),
    Tail,
}

/// Printable chunk name (luaO_chunkid).
pub fn chunk_id(source: &[u8]) -> String {
    let text = |b: &[u8]| String::from_utf8_lossy(b).into_owned();
    match source.first() {
        Some(b'=') => {
            let rest = &source[1..];
            text(&rest[..rest.len().min(LUA_IDSIZE - 1)])
        }
        Some(b'@') => {
            let rest = &source[1..];
            let room = LUA_IDSIZE - " '...' ".len() - 1;
            if rest.len() > room {
                format!("...{}", text(&rest[rest.len() - room..]))
            } else {
                text(rest)
            }
        }
        _ => {
            let line_end = source
                .iter()
                .position(|&c| c == b'\n' || c == b'\r')
                .unwrap_or(source.len());
            let room = LUA_IDSIZE - " [string \"...\"] ".len() - 1;
            let len = line_end.min(room);
            if len < source.len() {
                format!("[string \"{}...\"]", text(&source[..len]))
            } else {
                format!("[string \"{}\"]", text(source))
            }
        }
    }
}

impl LuaVM {
    // ============ Hooks ============

    /// Install (or with `None` or an empty mask, remove) the running
    /// thread's debug hook.
    pub fn set_hook(&mut self, hook: Option<HookFn>, mask: u8, count: u32) {
        let (hook, mask) = match hook {
            Some(h) if mask != 0 => (Some(h), mask),
            _ => (None, 0),
        };
        let state = self.state_mut();
        state.hook = hook;
        state.base_hook_count = count;
        state.hook_count = count;
        state.hook_mask = mask;
    }

    pub fn get_hook(&self) -> (Option<HookFn>, u8, u32) {
        let state = self.state();
        (state.hook, state.hook_mask, state.base_hook_count)
    }

    /// Run the hook for `event` unless a hook is already running.
    pub(crate) fn call_hook(&mut self, event: HookEvent, line: i32) -> LuaResult<()> {
        let Some(hook) = self.state().hook else {
            return Ok(());
        };
        if !self.state().allow_hook {
            return Ok(());
        }
        let (saved_top, saved_ci_top) = {
            let state = self.state();
            (state.top, state.ci().top)
        };
        self.check_stack_or_error(LUA_MINSTACK)?;
        {
            let state = self.state_mut();
            let top = state.top;
            state.ci_mut().top = top + LUA_MINSTACK;
            state.allow_hook = false;
        }
        let result = hook(self, event, line);
        let state = self.state_mut();
        state.allow_hook = true;
        state.ci_mut().top = saved_ci_top;
        state.top = saved_top;
        result
    }

    /// Count and line events before the instruction at `pc` runs.
    pub(crate) fn trace_exec(&mut self, chunk: ChunkId, pc: usize) -> LuaResult<()> {
        let mask = self.state().hook_mask;
        let old_pc = self.state().old_pc;
        self.state_mut().old_pc = pc;
        if mask & MASK_COUNT != 0 {
            let state = self.state_mut();
            state.hook_count = state.hook_count.saturating_sub(1);
            if state.hook_count == 0 {
                state.hook_count = state.base_hook_count;
                self.call_hook(HookEvent::Count, -1)?;
            }
        }
        if mask & MASK_LINE != 0 {
            let p = self.pool.chunk(chunk);
            let new_line = p.line_at(pc).unwrap_or(0);
            if pc == 0 || pc <= old_pc || p.line_at(old_pc).unwrap_or(0) != new_line {
                self.call_hook(HookEvent::Line, new_line as i32)?;
            }
        }
        Ok(())
    }

    // ============ Frame inspection ============

    fn frame_chunk(&self, ci_index: usize) -> Option<ChunkId> {
        let state = self.state();
        let ci = state.call_stack.get(ci_index)?;
        if !ci.is_lua() {
            return None;
        }
        match state.stack[ci.func] {
            LuaValue::Function(f) => match self.pool.function(f) {
                LuaFunction::Lua(cl) => Some(cl.chunk),
                LuaFunction::Native(_) => None,
            },
            _ => None,
        }
    }

    /// Index of the instruction a frame is executing.
    fn current_pc(&self, ci_index: usize) -> usize {
        self.state().call_stack[ci_index].saved_pc.saturating_sub(1)
    }

    fn current_line(&self, ci_index: usize) -> i32 {
        match self.frame_chunk(ci_index) {
            Some(chunk) => {
                let pc = self.current_pc(ci_index);
                self.pool.chunk(chunk).line_at(pc).map_or(0, |l| l as i32)
            }
            None => -1,
        }
    }

    fn chunk_source(&self, chunk: ChunkId) -> String {
        match self.pool.chunk(chunk).source {
            Some(s) => chunk_id(self.pool.string(s).as_bytes()),
            None => "?".to_string(),
        }
    }

    /// `"chunkid:line: "` for the frame at `ci_index` when it runs Lua code.
    pub(crate) fn where_level(&self, ci_index: usize) -> Option<String> {
        let chunk = self.frame_chunk(ci_index)?;
        let line = self.current_line(ci_index);
        Some(format!("{}:{}: ", self.chunk_source(chunk), line))
    }

    /// Position prefix for `error(msg, level)`: empty unless the function
    /// at `level` is a Lua function with line information.
    pub fn where_at(&self, level: usize) -> String {
        if let Some(Level::Frame(ci_index)) = self.levels().get(level).copied()
            && let Some(chunk) = self.frame_chunk(ci_index)
        {
            let line = self.current_line(ci_index);
            if line > 0 {
                return format!("{}:{}: ", self.chunk_source(chunk), line);
            }
        }
        String::new()
    }

    fn levels(&self) -> Vec<Level> {
        let state = self.state();
        let mut levels = Vec::with_capacity(state.call_stack.len());
        for index in (1..state.call_stack.len()).rev() {
            levels.push(Level::Frame(index));
            let ci = &state.call_stack[index];
            if ci.is_lua() {
                levels.extend(std::iter::repeat_n(Level::Tail, ci.tailcalls as usize));
            }
        }
        levels
    }

    /// Number of stack levels of the running thread.
    pub fn stack_depth(&self) -> usize {
        self.levels().len()
    }

    /// Describe stack level `level` (0 is the running function).
    pub fn get_info(&self, level: usize) -> Option<DebugInfo> {
        let ci_index = match self.levels().get(level).copied()? {
            Level::Tail => {
                return Some(DebugInfo {
                    source: "=(tail call)".to_string(),
                    short_src: "(tail call)".to_string(),
                    what: "tail",
                    currentline: -1,
                    linedefined: -1,
                    lastlinedefined: -1,
                    namewhat: "",
                    ..Default::default()
                });
            }
            Level::Frame(i) => i,
        };
        let func = self.state().stack[self.state().call_stack[ci_index].func];
        let mut info = DebugInfo {
            func,
            currentline: self.current_line(ci_index),
            namewhat: "",
            ..Default::default()
        };
        if let LuaValue::Function(f) = func {
            info.nups = self.pool.function(f).upvalue_count();
        }
        match self.frame_chunk(ci_index) {
            Some(chunk) => {
                let p = self.pool.chunk(chunk);
                info.source = match p.source {
                    Some(s) => String::from_utf8_lossy(self.pool.string(s).as_bytes()).into_owned(),
                    None => "=?".to_string(),
                };
                info.short_src = self.chunk_source(chunk);
                info.linedefined = p.linedefined as i32;
                info.lastlinedefined = p.lastlinedefined as i32;
                info.what = if p.linedefined == 0 { "main" } else { "Lua" };
            }
            None => {
                info.source = "=[C]".to_string();
                info.short_src = "[C]".to_string();
                info.linedefined = -1;
                info.lastlinedefined = -1;
                info.what = "C";
            }
        }
        if let Some((namewhat, name)) = self.func_name(ci_index) {
            info.namewhat = namewhat;
            info.name = Some(name);
        }
        Some(info)
    }

    /// Name the caller used for the function of frame `ci_index`.
    fn func_name(&self, ci_index: usize) -> Option<(&'static str, String)> {
        let state = self.state();
        let ci = &state.call_stack[ci_index];
        if (ci.is_lua() && ci.tailcalls > 0) || ci.is_tail() || ci_index < 2 {
            return None;
        }
        let caller = ci_index - 1;
        let chunk = self.frame_chunk(caller)?;
        let pc = self.current_pc(caller);
        let i = *self.pool.chunk(chunk).code.get(pc)?;
        match i.opcode()? {
            OpCode::Call | OpCode::TailCall | OpCode::TForLoop => {
                self.obj_name(chunk, pc, i.get_a() as usize)
            }
            _ => None,
        }
    }

    /// Recover a name for register `reg` of a prototype, as of `lastpc`.
    fn obj_name(&self, chunk: ChunkId, lastpc: usize, reg: usize) -> Option<(&'static str, String)> {
        let p = self.pool.chunk(chunk);
        let string_at = |s| String::from_utf8_lossy(self.pool.string(s).as_bytes()).into_owned();
        if let Some(name) = p.local_name(reg + 1, lastpc) {
            return Some(("local", string_at(name)));
        }
        let pc = find_set_reg(&p.code, lastpc, reg, |k| {
            p.child_protos
                .get(k)
                .map_or(0, |&c| self.pool.chunk(c).upvalue_count as usize)
        })?;
        let i = p.code[pc];
        let constant_name = |k: u32| -> String {
            if Instruction::is_k(k)
                && let Some(LuaValue::String(s)) = p.constants.get(Instruction::rk_index(k) as usize)
            {
                return string_at(*s);
            }
            "?".to_string()
        };
        match i.opcode()? {
            OpCode::GetGlobal => match p.constants.get(i.get_bx() as usize) {
                Some(LuaValue::String(s)) => Some(("global", string_at(*s))),
                _ => None,
            },
            OpCode::Move => {
                let (a, b) = (i.get_a() as usize, i.get_b() as usize);
                if b < a { self.obj_name(chunk, pc, b) } else { None }
            }
            OpCode::GetTable => Some(("field", constant_name(i.get_c()))),
            OpCode::GetUpval => {
                let name = p
                    .upvalue_names
                    .get(i.get_b() as usize)
                    .map_or_else(|| "?".to_string(), |s| string_at(*s));
                Some(("upvalue", name))
            }
            OpCode::Self_ => Some(("method", constant_name(i.get_c()))),
            _ => None,
        }
    }

    /// Describe an operand for an error message when it lives in a
    /// register of the running Lua frame.
    fn operand_name(&self, o: &Operand) -> Option<(&'static str, String)> {
        let slot = o.slot?;
        let state = self.state();
        let ci_index = state.call_stack.len() - 1;
        let ci = state.ci();
        if slot < ci.base || slot >= ci.top {
            return None;
        }
        let chunk = self.frame_chunk(ci_index)?;
        self.obj_name(chunk, self.current_pc(ci_index), slot - ci.base)
    }

    // ============ Error helpers ============

    pub(crate) fn type_error(&mut self, o: Operand, op: &str) -> LuaError {
        let t = o.value.type_name();
        let msg = match self.operand_name(&o) {
            Some((kind, name)) => format!("attempt to {} {} '{}' (a {} value)", op, kind, name, t),
            None => format!("attempt to {} a {} value", op, t),
        };
        self.error(msg)
    }

    pub(crate) fn concat_error(&mut self, p1: Operand, p2: Operand) -> LuaError {
        let culprit = match p1.value {
            LuaValue::String(_) | LuaValue::Number(_) => p2,
            _ => p1,
        };
        self.type_error(culprit, "concatenate")
    }

    pub(crate) fn arith_error(&mut self, p1: Operand, p2: Operand) -> LuaError {
        let culprit = if to_number(self, &p1.value).is_none() { p1 } else { p2 };
        self.type_error(culprit, "perform arithmetic on")
    }

    pub(crate) fn order_error(&mut self, p1: LuaValue, p2: LuaValue) -> LuaError {
        let (t1, t2) = (p1.type_name(), p2.type_name());
        if t1 == t2 {
            self.error(format!("attempt to compare two {} values", t1))
        } else {
            self.error(format!("attempt to compare {} with {}", t1, t2))
        }
    }

    // ============ Traceback ============

    /// Standard `stack traceback:` text starting at `level`, preceded by
    /// `msg` when given.
    pub fn traceback(&self, msg: Option<&str>, level: usize) -> String {
        const LEVELS1: usize = 12;
        const LEVELS2: usize = 10;
        let mut out = String::new();
        if let Some(msg) = msg {
            out.push_str(msg);
            out.push('\n');
        }
        out.push_str("stack traceback:");
        let total = self.stack_depth();
        let mut lv = level;
        let mut first_part = true;
        while lv < total {
            if lv >= level + LEVELS1 && first_part && total - lv > LEVELS2 {
                out.push_str("\n\t...");
                lv = total - LEVELS2;
                first_part = false;
                continue;
            }
            let Some(ar) = self.get_info(lv) else { break };
            lv += 1;
            out.push_str("\n\t");
            out.push_str(&ar.short_src);
            out.push(':');
            if ar.currentline > 0 {
                out.push_str(&format!("{}:", ar.currentline));
            }
            match (&ar.name, ar.what) {
                (Some(name), _) => out.push_str(&format!(" in function '{}'", name)),
                (None, "main") => out.push_str(" in main chunk"),
                (None, "C") | (None, "tail") => out.push_str(" ?"),
                (None, _) => {
                    out.push_str(&format!(" in function <{}:{}>", ar.short_src, ar.linedefined))
                }
            }
        }
        out
    }
}

/// Last instruction before `lastpc` that wrote register `reg`, ignoring
/// writes that a forward jump may have skipped.
fn find_set_reg(
    code: &[Instruction],
    lastpc: usize,
    reg: usize,
    upvalue_count: impl Fn(usize) -> usize,
) -> Option<usize> {
    let mut setreg = None;
    let mut jmp_target = 0;
    let mut pc = 0;
    let lastpc = lastpc.min(code.len());
    while pc < lastpc {
        let i = code[pc];
        let Some(op) = i.opcode() else { break };
        let a = i.get_a() as usize;
        let hit = match op {
            OpCode::LoadNil => a <= reg && reg <= i.get_b() as usize,
            OpCode::TForLoop => reg >= a + 3,
            OpCode::Call | OpCode::TailCall => reg >= a,
            OpCode::Jmp => {
                let dest = pc as i64 + 1 + i.get_sbx() as i64;
                if (pc as i64) < dest && dest <= lastpc as i64 && dest as usize > jmp_target {
                    jmp_target = dest as usize;
                }
                false
            }
            OpCode::Closure => {
                // the pseudo-instructions after CLOSURE are operands
                let hit = a == reg;
                let skipped = upvalue_count(i.get_bx() as usize);
                if hit {
                    setreg = if pc < jmp_target { None } else { Some(pc) };
                }
                pc += 1 + skipped;
                continue;
            }
            _ => op.sets_a() && a == reg,
        };
        if hit {
            setreg = if pc < jmp_target { None } else { Some(pc) };
        }
        pc += 1;
    }
    setreg
}
