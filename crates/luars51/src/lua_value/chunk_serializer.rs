// Precompiled chunk reader/writer for the Lua 5.1 binary format.
//
// Loading is split in two: `undump` turns bytes into a plain `ChunkData`
// tree (no heap objects are touched), then the VM materializes it into
// collectable prototypes. A bad header is therefore rejected before any
// function body is allocated.

use std::io::{Cursor, Read};

use crate::Instruction;

/// Signature, version 5.1, official format, little endian, int 4,
/// size_t 8, instruction 4, number 8, floating point numbers.
pub const LUAC_HEADER: [u8; 12] = [0x1B, b'L', b'u', b'a', 0x51, 0, 1, 4, 8, 4, 8, 0];

/// First byte of every binary chunk.
pub const LUA_SIGNATURE_BYTE: u8 = 0x1B;

const TAG_NIL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UndumpError {
    #[error("bad header")]
    BadHeader,
    #[error("unexpected end")]
    UnexpectedEnd,
    #[error("bad integer")]
    BadInteger,
    #[error("bad constant")]
    BadConstant,
    #[error("bad code")]
    BadCode,
}

/// Constant pool entry as stored in a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocVarData {
    pub name: Vec<u8>,
    pub startpc: u32,
    pub endpc: u32,
}

/// A function prototype in serialized form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChunkData {
    pub source: Option<Vec<u8>>,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    pub upvalue_count: u8,
    pub param_count: u8,
    pub is_vararg: u8,
    pub max_stack_size: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub protos: Vec<ChunkData>,
    pub line_info: Vec<u32>,
    pub locals: Vec<LocVarData>,
    pub upvalue_names: Vec<Vec<u8>>,
}

impl ChunkData {
    /// Bare prototype with the given code and constants, used by hosts that
    /// assemble bytecode directly.
    pub fn new(code: Vec<Instruction>, constants: Vec<Constant>, max_stack_size: u8) -> Self {
        ChunkData {
            code,
            constants,
            max_stack_size,
            ..Default::default()
        }
    }
}

/// Parse a binary chunk. The result still has to pass `verify::check_chunk`.
pub fn undump(data: &[u8]) -> Result<ChunkData, UndumpError> {
    let mut cursor = Cursor::new(data);
    let mut header = [0u8; 12];
    read_block(&mut cursor, &mut header)?;
    if header != LUAC_HEADER {
        return Err(UndumpError::BadHeader);
    }
    read_function(&mut cursor, None)
}

/// Serialize a prototype tree; `strip` drops line info, local and upvalue names.
pub fn dump(chunk: &ChunkData, strip: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&LUAC_HEADER);
    write_function(&mut buf, chunk, None, strip);
    buf
}

fn read_function(
    cursor: &mut Cursor<&[u8]>,
    parent_source: Option<&[u8]>,
) -> Result<ChunkData, UndumpError> {
    let source = match read_string(cursor)? {
        Some(s) => Some(s),
        None => parent_source.map(|s| s.to_vec()),
    };
    let linedefined = read_int(cursor)?;
    let lastlinedefined = read_int(cursor)?;
    let upvalue_count = read_u8(cursor)?;
    let param_count = read_u8(cursor)?;
    let is_vararg = read_u8(cursor)?;
    let max_stack_size = read_u8(cursor)?;

    let n = read_int(cursor)? as usize;
    let mut code = Vec::with_capacity(n.min(data_left(cursor) / 4));
    for _ in 0..n {
        code.push(Instruction::from_u32(read_u32(cursor)?));
    }

    let n = read_int(cursor)? as usize;
    let mut constants = Vec::with_capacity(n.min(data_left(cursor)));
    for _ in 0..n {
        constants.push(read_constant(cursor)?);
    }

    let n = read_int(cursor)? as usize;
    let mut protos = Vec::with_capacity(n.min(data_left(cursor)));
    for _ in 0..n {
        protos.push(read_function(cursor, source.as_deref())?);
    }

    let n = read_int(cursor)? as usize;
    let mut line_info = Vec::with_capacity(n.min(data_left(cursor) / 4));
    for _ in 0..n {
        line_info.push(read_int(cursor)?);
    }

    let n = read_int(cursor)? as usize;
    let mut locals = Vec::with_capacity(n.min(data_left(cursor)));
    for _ in 0..n {
        let name = read_string(cursor)?.unwrap_or_default();
        let startpc = read_int(cursor)?;
        let endpc = read_int(cursor)?;
        locals.push(LocVarData {
            name,
            startpc,
            endpc,
        });
    }

    let n = read_int(cursor)? as usize;
    let mut upvalue_names = Vec::with_capacity(n.min(data_left(cursor)));
    for _ in 0..n {
        upvalue_names.push(read_string(cursor)?.unwrap_or_default());
    }

    Ok(ChunkData {
        source,
        linedefined,
        lastlinedefined,
        upvalue_count,
        param_count,
        is_vararg,
        max_stack_size,
        code,
        constants,
        protos,
        line_info,
        locals,
        upvalue_names,
    })
}

fn read_constant(cursor: &mut Cursor<&[u8]>) -> Result<Constant, UndumpError> {
    match read_u8(cursor)? {
        TAG_NIL => Ok(Constant::Nil),
        TAG_BOOLEAN => Ok(Constant::Boolean(read_u8(cursor)? != 0)),
        TAG_NUMBER => Ok(Constant::Number(read_f64(cursor)?)),
        TAG_STRING => Ok(Constant::String(read_string(cursor)?.unwrap_or_default())),
        _ => Err(UndumpError::BadConstant),
    }
}

fn write_function(buf: &mut Vec<u8>, f: &ChunkData, parent_source: Option<&[u8]>, strip: bool) {
    let source = if strip || f.source.as_deref() == parent_source {
        None
    } else {
        f.source.as_deref()
    };
    write_string(buf, source);
    write_int(buf, f.linedefined);
    write_int(buf, f.lastlinedefined);
    buf.push(f.upvalue_count);
    buf.push(f.param_count);
    buf.push(f.is_vararg);
    buf.push(f.max_stack_size);

    write_int(buf, f.code.len() as u32);
    for instr in &f.code {
        buf.extend_from_slice(&instr.as_u32().to_le_bytes());
    }

    write_int(buf, f.constants.len() as u32);
    for k in &f.constants {
        match k {
            Constant::Nil => buf.push(TAG_NIL),
            Constant::Boolean(b) => {
                buf.push(TAG_BOOLEAN);
                buf.push(*b as u8);
            }
            Constant::Number(n) => {
                buf.push(TAG_NUMBER);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            Constant::String(s) => {
                buf.push(TAG_STRING);
                write_string(buf, Some(s));
            }
        }
    }

    write_int(buf, f.protos.len() as u32);
    for p in &f.protos {
        write_function(buf, p, f.source.as_deref(), strip);
    }

    if strip {
        write_int(buf, 0);
        write_int(buf, 0);
        write_int(buf, 0);
        return;
    }
    write_int(buf, f.line_info.len() as u32);
    for line in &f.line_info {
        write_int(buf, *line);
    }
    write_int(buf, f.locals.len() as u32);
    for var in &f.locals {
        write_string(buf, Some(&var.name));
        write_int(buf, var.startpc);
        write_int(buf, var.endpc);
    }
    write_int(buf, f.upvalue_names.len() as u32);
    for name in &f.upvalue_names {
        write_string(buf, Some(name));
    }
}

// ============ Primitive encoders ============

fn write_int(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&(value as i32).to_le_bytes());
}

/// `size_t` length counting the trailing NUL, then the bytes and the NUL.
fn write_string(buf: &mut Vec<u8>, s: Option<&[u8]>) {
    match s {
        None => buf.extend_from_slice(&0u64.to_le_bytes()),
        Some(s) => {
            buf.extend_from_slice(&(s.len() as u64 + 1).to_le_bytes());
            buf.extend_from_slice(s);
            buf.push(0);
        }
    }
}

fn data_left(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len().saturating_sub(cursor.position() as usize)
}

fn read_block(cursor: &mut Cursor<&[u8]>, out: &mut [u8]) -> Result<(), UndumpError> {
    cursor
        .read_exact(out)
        .map_err(|_| UndumpError::UnexpectedEnd)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, UndumpError> {
    let mut b = [0u8; 1];
    read_block(cursor, &mut b)?;
    Ok(b[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, UndumpError> {
    let mut b = [0u8; 4];
    read_block(cursor, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Non-negative C `int`.
fn read_int(cursor: &mut Cursor<&[u8]>) -> Result<u32, UndumpError> {
    let mut b = [0u8; 4];
    read_block(cursor, &mut b)?;
    let n = i32::from_le_bytes(b);
    if n < 0 {
        return Err(UndumpError::BadInteger);
    }
    Ok(n as u32)
}

fn read_f64(cursor: &mut Cursor<&[u8]>) -> Result<f64, UndumpError> {
    let mut b = [0u8; 8];
    read_block(cursor, &mut b)?;
    Ok(f64::from_le_bytes(b))
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<Option<Vec<u8>>, UndumpError> {
    let mut b = [0u8; 8];
    read_block(cursor, &mut b)?;
    let size = u64::from_le_bytes(b) as usize;
    if size == 0 {
        return Ok(None);
    }
    if size > data_left(cursor) {
        return Err(UndumpError::UnexpectedEnd);
    }
    let mut data = vec![0u8; size];
    read_block(cursor, &mut data)?;
    data.pop();
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpCode;

    fn sample() -> ChunkData {
        let mut inner = ChunkData::new(
            vec![Instruction::abc(OpCode::Return, 0, 1, 0)],
            vec![Constant::Boolean(true)],
            2,
        );
        inner.source = Some(b"@test.lua".to_vec());
        let mut main = ChunkData::new(
            vec![
                Instruction::abx(OpCode::LoadK, 0, 0),
                Instruction::abx(OpCode::Closure, 1, 0),
                Instruction::abc(OpCode::Return, 0, 2, 0),
            ],
            vec![Constant::Number(1.5), Constant::String(b"hi".to_vec()), Constant::Nil],
            2,
        );
        main.source = Some(b"@test.lua".to_vec());
        main.is_vararg = 2;
        main.line_info = vec![1, 2, 3];
        main.locals = vec![LocVarData {
            name: b"x".to_vec(),
            startpc: 1,
            endpc: 3,
        }];
        main.protos.push(inner);
        main
    }

    #[test]
    fn test_dump_then_undump_preserves_tree() {
        let chunk = sample();
        let bytes = dump(&chunk, false);
        assert_eq!(&bytes[..12], &LUAC_HEADER);
        assert_eq!(undump(&bytes).unwrap(), chunk);
    }

    #[test]
    fn test_nested_source_is_inherited() {
        let bytes = dump(&sample(), false);
        let loaded = undump(&bytes).unwrap();
        assert_eq!(loaded.protos[0].source.as_deref(), Some(&b"@test.lua"[..]));
    }

    #[test]
    fn test_strip_drops_debug_info() {
        let loaded = undump(&dump(&sample(), true)).unwrap();
        assert!(loaded.source.is_none());
        assert!(loaded.line_info.is_empty());
        assert!(loaded.locals.is_empty());
        assert_eq!(loaded.code.len(), 3);
    }

    #[test]
    fn test_rejects_bad_header_and_truncation() {
        let mut bytes = dump(&sample(), false);
        let mut wrong_version = bytes.clone();
        wrong_version[4] = 0x52;
        assert_eq!(undump(&wrong_version), Err(UndumpError::BadHeader));
        assert_eq!(undump(&bytes[..5]), Err(UndumpError::UnexpectedEnd));
        bytes.truncate(bytes.len() - 3);
        assert_eq!(undump(&bytes), Err(UndumpError::UnexpectedEnd));
    }

    #[test]
    fn test_rejects_unknown_constant_tag() {
        let mut chunk = ChunkData::new(vec![], vec![Constant::Nil], 2);
        chunk.source = None;
        let mut bytes = dump(&chunk, false);
        // header + source(8) + 2 ints + 4 bytes + code count + constant count
        let tag_pos = 12 + 8 + 8 + 4 + 4 + 4;
        assert_eq!(bytes[tag_pos], TAG_NIL);
        bytes[tag_pos] = 9;
        assert_eq!(undump(&bytes), Err(UndumpError::BadConstant));
    }
}
