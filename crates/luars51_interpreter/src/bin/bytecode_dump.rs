use luars51::lua_value::chunk_serializer::{self, ChunkData, Constant};
use luars51::lua_vm::{Instruction, OpArgMode, OpCode, OpMode};
use std::env;
use std::fs;

fn main() {
    let args: Vec<String> = env::args().collect();
    let Some(filename) = args.get(1) else {
        println!("Usage: bytecode_dump <chunk.luac>");
        std::process::exit(0);
    };

    let data = match fs::read(filename) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", filename, e);
            std::process::exit(1);
        }
    };

    match chunk_serializer::undump(&data) {
        Ok(chunk) => dump_chunk(&chunk, chunk.source.as_deref(), true),
        Err(e) => {
            eprintln!("{}: {} in precompiled chunk", filename, e);
            std::process::exit(1);
        }
    }
}

fn source_name(source: Option<&[u8]>) -> String {
    match source {
        Some(s) if s.first() == Some(&b'@') || s.first() == Some(&b'=') => {
            String::from_utf8_lossy(&s[1..]).into_owned()
        }
        Some(_) => "(string)".to_string(),
        None => "?".to_string(),
    }
}

fn constant_text(k: &Constant) -> String {
    match k {
        Constant::Nil => "nil".to_string(),
        Constant::Boolean(b) => b.to_string(),
        Constant::Number(n) => format!("{}", n),
        Constant::String(s) => format!("{:?}", String::from_utf8_lossy(s)),
    }
}

/// Operand text as `luac -l` prints it: constants as negative indices.
fn rk(x: u32) -> i64 {
    if Instruction::is_k(x) {
        -1 - Instruction::rk_index(x) as i64
    } else {
        x as i64
    }
}

fn operands(op: OpCode, i: Instruction) -> String {
    let a = i.get_a();
    match op.get_mode() {
        OpMode::IABx => {
            let (b_mode, _) = op.arg_modes();
            if b_mode == OpArgMode::K {
                format!("{} {}", a, -1 - i.get_bx() as i64)
            } else {
                format!("{} {}", a, i.get_bx())
            }
        }
        OpMode::IAsBx => {
            if op == OpCode::Jmp {
                format!("{}", i.get_sbx())
            } else {
                format!("{} {}", a, i.get_sbx())
            }
        }
        OpMode::IABC => {
            let (b_mode, c_mode) = op.arg_modes();
            let mut text = a.to_string();
            if b_mode != OpArgMode::N {
                let b = if b_mode == OpArgMode::K { rk(i.get_b()) } else { i.get_b() as i64 };
                text.push_str(&format!(" {}", b));
            }
            if c_mode != OpArgMode::N {
                let c = if c_mode == OpArgMode::K { rk(i.get_c()) } else { i.get_c() as i64 };
                text.push_str(&format!(" {}", c));
            }
            text
        }
    }
}

/// Trailing comment naming the constant an instruction refers to.
fn comment(chunk: &ChunkData, op: OpCode, i: Instruction, pc: usize) -> String {
    let k = |x: u32| chunk.constants.get(x as usize).map(constant_text).unwrap_or_default();
    match op {
        OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal => format!("\t; {}", k(i.get_bx())),
        OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep => {
            format!("\t; to {}", pc as i64 + 2 + i.get_sbx() as i64)
        }
        OpCode::Closure => format!("\t; function <{}>", i.get_bx()),
        _ => {
            let (b_mode, c_mode) = op.arg_modes();
            let mut parts = Vec::new();
            if b_mode == OpArgMode::K && Instruction::is_k(i.get_b()) {
                parts.push(k(Instruction::rk_index(i.get_b())));
            }
            if c_mode == OpArgMode::K && Instruction::is_k(i.get_c()) {
                parts.push(k(Instruction::rk_index(i.get_c())));
            }
            if parts.is_empty() { String::new() } else { format!("\t; {}", parts.join(" ")) }
        }
    }
}

fn dump_chunk(chunk: &ChunkData, source: Option<&[u8]>, is_main: bool) {
    let kind = if is_main { "main" } else { "function" };
    println!(
        "\n{} <{}:{},{}> ({} instructions)",
        kind,
        source_name(source),
        chunk.linedefined,
        chunk.lastlinedefined,
        chunk.code.len()
    );
    println!(
        "{}{} params, {} slots, {} upvalues, {} locals, {} constants, {} functions",
        chunk.param_count,
        if chunk.is_vararg != 0 { "+" } else { "" },
        chunk.max_stack_size,
        chunk.upvalue_count,
        chunk.locals.len(),
        chunk.constants.len(),
        chunk.protos.len()
    );

    for (pc, &instr) in chunk.code.iter().enumerate() {
        let line = chunk
            .line_info
            .get(pc)
            .map_or_else(|| "-".to_string(), |l| l.to_string());
        match instr.opcode() {
            Some(op) => println!(
                "\t{}\t[{}]\t{:<9}\t{}{}",
                pc + 1,
                line,
                op.name(),
                operands(op, instr),
                comment(chunk, op, instr, pc)
            ),
            None => println!("\t{}\t[{}]\t<bad opcode 0x{:08x}>", pc + 1, line, instr.as_u32()),
        }
    }

    if !chunk.constants.is_empty() {
        println!("constants ({}):", chunk.constants.len());
        for (i, k) in chunk.constants.iter().enumerate() {
            println!("\t{}\t{}", i + 1, constant_text(k));
        }
    }
    if !chunk.locals.is_empty() {
        println!("locals ({}):", chunk.locals.len());
        for (i, local) in chunk.locals.iter().enumerate() {
            println!(
                "\t{}\t{}\t{}\t{}",
                i,
                String::from_utf8_lossy(&local.name),
                local.startpc + 1,
                local.endpc + 1
            );
        }
    }
    if !chunk.upvalue_names.is_empty() {
        println!("upvalues ({}):", chunk.upvalue_names.len());
        for (i, name) in chunk.upvalue_names.iter().enumerate() {
            println!("\t{}\t{}", i, String::from_utf8_lossy(name));
        }
    }

    for child in &chunk.protos {
        dump_chunk(child, child.source.as_deref().or(source), false);
    }
}
