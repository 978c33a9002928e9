// Binary chunks: dump, load, and rejection of malformed input
use super::{Asm, new_vm, run, string_at};
use crate::lua_value::chunk_serializer::{self, Constant};
use crate::lua_vm::lua_limits::LUA_MULTRET;
use crate::*;
use OpCode::*;

/// local function add(a, b) return a + b end
/// return add(2, 3), "five"
fn sample_program() -> ChunkData {
    let mut add = Asm::function(3, 2);
    add.abc(Add, 2, 0, 1);
    add.abc(Return, 2, 2, 0);
    add.local("a", 0, 2);
    add.local("b", 0, 2);

    let mut main = Asm::new(4);
    let p = main.child(add.build());
    main.abx(Closure, 0, p);
    main.abc(Move, 1, 0, 0);
    let two = main.kn(2.0);
    let three = main.kn(3.0);
    main.abx(LoadK, 2, two);
    main.abx(LoadK, 3, three);
    main.abc(Call, 1, 3, 2);
    let five = main.ks("five");
    main.abx(LoadK, 2, five);
    main.abc(Return, 1, 3, 0);
    main.local("add", 1, 8);
    main.build()
}

fn dumped(vm: &mut LuaVM, strip: bool) -> Vec<u8> {
    assert_eq!(vm.load_prototype(&sample_program()), LuaStatus::Ok);
    let bytes = vm.dump(strip).unwrap();
    vm.pop(1);
    bytes
}

fn check_results(vm: &mut LuaVM) {
    assert_eq!(vm.get_top(), 2);
    assert_eq!(vm.to_integer(1), Some(5));
    assert_eq!(string_at(vm, 2), "five");
}

#[test]
fn test_dump_and_load_round_trip() {
    let mut vm = new_vm();
    for strip in [false, true] {
        let bytes = dumped(&mut vm, strip);
        assert_eq!(bytes[0], 0x1b);
        assert_eq!(vm.load(&bytes, "=roundtrip"), LuaStatus::Ok);
        vm.call(0, LUA_MULTRET).unwrap();
        check_results(&mut vm);
        vm.set_top(0);
    }
}

#[test]
fn test_dump_refuses_native_functions() {
    let mut vm = new_vm();
    vm.get_global("print").unwrap();
    assert!(vm.dump(false).is_none());
}

#[test]
fn test_stripped_chunk_is_smaller_and_keeps_source() {
    let mut vm = new_vm();
    let full = dumped(&mut vm, false);
    let stripped = dumped(&mut vm, true);
    assert!(stripped.len() < full.len());
    let data = chunk_serializer::undump(&full).unwrap();
    assert_eq!(data.source.as_deref(), Some(&b"@test.lua"[..]));
    assert_eq!(data.protos[0].locals.len(), 2);
    let data = chunk_serializer::undump(&stripped).unwrap();
    assert!(data.line_info.is_empty());
    assert!(data.protos[0].locals.is_empty());
}

fn load_error(vm: &mut LuaVM, bytes: &[u8], name: &str) -> String {
    assert_eq!(vm.load(bytes, name), LuaStatus::ErrSyntax);
    let msg = string_at(vm, -1);
    vm.pop(1);
    msg
}

#[test]
fn test_load_rejects_malformed_chunks() {
    let mut vm = new_vm();
    assert_eq!(
        load_error(&mut vm, b"return 1", "=src"),
        "src: not a precompiled chunk"
    );

    let good = dumped(&mut vm, false);
    let mut bad_version = good.clone();
    bad_version[4] = 0x52;
    assert_eq!(
        load_error(&mut vm, &bad_version, "=bin"),
        "bin: bad header in precompiled chunk"
    );

    let truncated = &good[..good.len() - 3];
    assert_eq!(
        load_error(&mut vm, truncated, "@file.luac"),
        "file.luac: unexpected end in precompiled chunk"
    );

    // well-formed bytes holding an invalid program
    let mut data = ChunkData::new(
        vec![
            Instruction::abx(LoadK, 0, 5),
            Instruction::abc(Return, 0, 1, 0),
        ],
        vec![Constant::Number(1.0)],
        2,
    );
    data.source = Some(b"=bin".to_vec());
    let bytes = chunk_serializer::dump(&data, false);
    assert_eq!(
        load_error(&mut vm, &bytes, "=bin"),
        "bin: bad code in precompiled chunk"
    );
    assert_eq!(vm.get_top(), 0);
}

#[test]
fn test_load_prototype_verifies_code() {
    let mut vm = new_vm();
    // no final RETURN
    let data = ChunkData::new(vec![Instruction::abc(Move, 0, 1, 0)], vec![], 2);
    assert_eq!(vm.load_prototype(&data), LuaStatus::ErrSyntax);
    assert!(string_at(&mut vm, -1).starts_with("bad code in prototype"));
}

#[test]
fn test_load_prototype_checks_register_ranges() {
    let mut vm = new_vm();
    // LOADNIL with its last register below its first
    let mut main = Asm::new(6);
    main.abc(LoadNil, 5, 0, 0);
    main.abc(Return, 0, 1, 0);
    assert_eq!(vm.load_prototype(&main.build()), LuaStatus::ErrSyntax);
    assert_eq!(
        string_at(&mut vm, -1),
        "bad code in prototype: LOADNIL range is empty at pc 0"
    );

    // SETLIST whose batch word is zero
    let mut main = Asm::new(2);
    main.abc(NewTable, 0, 0, 0);
    main.abc(SetList, 0, 1, 0);
    main.emit(Instruction::from_u32(0));
    main.abc(Return, 0, 1, 0);
    assert_eq!(vm.load_prototype(&main.build()), LuaStatus::ErrSyntax);
    assert_eq!(
        string_at(&mut vm, -1),
        "bad code in prototype: SETLIST batch is zero at pc 1"
    );
}

#[test]
fn test_loadstring_from_bytecode() {
    let mut vm = new_vm();
    let bytes = dumped(&mut vm, false);
    vm.push_bytes(&bytes).unwrap();
    vm.set_global("code").unwrap();

    // return loadstring(code)()
    let mut main = Asm::new(2);
    let loadstring = main.ks("loadstring");
    let code = main.ks("code");
    main.abx(GetGlobal, 0, loadstring);
    main.abx(GetGlobal, 1, code);
    main.abc(Call, 0, 2, 2);
    main.abc(Call, 0, 1, 0);
    main.abc(Return, 0, 0, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    check_results(&mut vm);
    vm.set_top(0);

    // return loadstring("garbage", "=input")
    let mut main = Asm::new(3);
    let loadstring = main.ks("loadstring");
    main.abx(GetGlobal, 0, loadstring);
    let garbage = main.ks("garbage");
    main.abx(LoadK, 1, garbage);
    let name = main.ks("=input");
    main.abx(LoadK, 2, name);
    main.abc(Call, 0, 3, 0);
    main.abc(Return, 0, 0, 0);
    assert_eq!(run(&mut vm, &main.build()), LuaStatus::Ok);
    assert_eq!(vm.get_top(), 2);
    assert!(vm.is_none_or_nil(1));
    assert_eq!(string_at(&mut vm, 2), "input: not a precompiled chunk");
}
