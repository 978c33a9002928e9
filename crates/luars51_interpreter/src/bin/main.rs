use luars51::lua_vm::lua_limits::LUA_MULTRET;
use luars51::{LuaResult, LuaStatus, LuaVM, SafeOption, Stdlib};
use std::env;
use std::fs;
use std::io::{self, Read};

const PROGNAME: &str = "lua51";
const VERSION: &str = "Lua 5.1 (bytecode runtime)";
const COPYRIGHT: &str = "Copyright (C) 2026 luars51 contributors";

fn print_usage() {
    eprintln!("usage: {} [options] [chunk [args]]", PROGNAME);
    eprintln!("Available options are:");
    eprintln!("  -v        show version information");
    eprintln!("  -E        ignore environment variables");
    eprintln!("  --        stop handling options");
    eprintln!("  -         stop handling options and load a chunk from stdin");
    eprintln!("Chunks must be precompiled (luac output).");
}

fn print_version() {
    println!("{}", VERSION);
    println!("{}", COPYRIGHT);
}

#[derive(Default)]
struct Options {
    show_version: bool,
    ignore_env: bool,
    read_stdin: bool,
    chunk_file: Option<String>,
    chunk_args: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options::default();
    let mut i = 1;
    let mut stop_options = false;

    while i < args.len() {
        let arg = &args[i];
        if !stop_options && arg.starts_with('-') {
            match arg.as_str() {
                "-v" => opts.show_version = true,
                "-E" => opts.ignore_env = true,
                "--" => stop_options = true,
                "-" => {
                    opts.read_stdin = true;
                    opts.chunk_args = args[i + 1..].to_vec();
                    break;
                }
                _ => return Err(format!("unrecognized option '{}'", arg)),
            }
        } else {
            opts.chunk_file = Some(arg.clone());
            opts.chunk_args = args[i + 1..].to_vec();
            break;
        }
        i += 1;
    }

    Ok(opts)
}

/// Message handler: append a traceback to string errors.
fn traceback(vm: &mut LuaVM) -> LuaResult<usize> {
    let Some(msg) = vm.to_str(1)?.map(str::to_string) else {
        // non-string error object; keep it as is
        return Ok(1);
    };
    let trace = vm.traceback(Some(&msg), 1);
    vm.push_string(&trace)?;
    Ok(1)
}

/// Call the function below `nargs` arguments with the traceback handler.
fn docall(vm: &mut LuaVM, nargs: usize) -> LuaStatus {
    let base = vm.get_top() - nargs as i32;
    if vm.push_native_function(traceback).is_err() {
        return LuaStatus::ErrMem;
    }
    vm.insert(base);
    let status = vm.pcall(nargs, LUA_MULTRET, base);
    vm.remove(base);
    if status != LuaStatus::Ok {
        // force a full collection after an error
        let _ = vm.full_gc();
    }
    status
}

/// Print the error message on top of the stack and pop it.
fn report(vm: &mut LuaVM, status: LuaStatus) -> i32 {
    if status == LuaStatus::Ok {
        return 0;
    }
    let msg = match vm.to_str(-1) {
        Ok(Some(s)) => s.to_string(),
        _ => "(error object is not a string)".to_string(),
    };
    eprintln!("{}: {}", PROGNAME, msg);
    vm.pop(1);
    1
}

/// Global `arg`: arg[0] is the chunk name, arg[-1] the interpreter and
/// arg[1..] the chunk arguments.
fn setup_arg_table(vm: &mut LuaVM, exe: &str, chunk: &str, args: &[String]) -> LuaResult<()> {
    vm.create_table(args.len(), 2)?;
    vm.push_string(exe)?;
    vm.raw_set_i(-2, -1)?;
    vm.push_string(chunk)?;
    vm.raw_set_i(-2, 0)?;
    for (i, a) in args.iter().enumerate() {
        vm.push_string(a)?;
        vm.raw_set_i(-2, i as i64 + 1)?;
    }
    vm.set_global("arg")
}

fn read_chunk(path: Option<&str>) -> Result<Vec<u8>, String> {
    match path {
        Some(path) => fs::read(path).map_err(|e| format!("cannot open {}: {}", path, e)),
        None => {
            let mut data = Vec::new();
            io::stdin()
                .read_to_end(&mut data)
                .map_err(|e| format!("cannot read stdin: {}", e))?;
            Ok(data)
        }
    }
}

/// Load a chunk file (stdin when `path` is None) and run it with `args`.
fn run_chunk(vm: &mut LuaVM, path: Option<&str>, args: &[String]) -> i32 {
    let data = match read_chunk(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("{}: {}", PROGNAME, e);
            return 1;
        }
    };
    let chunkname = match path {
        Some(path) => format!("@{}", path),
        None => "=stdin".to_string(),
    };
    let status = vm.load(&data, &chunkname);
    if status != LuaStatus::Ok {
        return report(vm, status);
    }
    for a in args {
        if let Err(e) = vm.push_string(a) {
            eprintln!("{}: {}", PROGNAME, vm.get_error_message(e));
            return 1;
        }
    }
    let status = docall(vm, args.len());
    report(vm, status)
}

/// LUA_INIT names a chunk file with a leading '@'; anything else would
/// need a source compiler.
fn handle_init(vm: &mut LuaVM) -> i32 {
    let Ok(init) = env::var("LUA_INIT") else {
        return 0;
    };
    match init.strip_prefix('@') {
        Some(path) => run_chunk(vm, Some(path), &[]),
        None => {
            eprintln!("{}: LUA_INIT: source code is not supported, use @file", PROGNAME);
            1
        }
    }
}

fn lua_main() -> i32 {
    let args: Vec<String> = env::args().collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("{}: {}", PROGNAME, e);
            print_usage();
            return 1;
        }
    };

    if opts.show_version {
        print_version();
    }
    if opts.chunk_file.is_none() && !opts.read_stdin {
        if !opts.show_version {
            print_usage();
        }
        return 0;
    }

    let mut vm = LuaVM::new(SafeOption::default());
    if let Err(e) = vm.open_stdlib(Stdlib::All) {
        eprintln!("{}: {}", PROGNAME, vm.get_error_message(e));
        return 1;
    }

    if !opts.ignore_env {
        let code = handle_init(&mut vm);
        if code != 0 {
            return code;
        }
    }

    let exe = args.first().map_or(PROGNAME, String::as_str);
    let chunk = opts.chunk_file.as_deref().unwrap_or("-");
    if let Err(e) = setup_arg_table(&mut vm, exe, chunk, &opts.chunk_args) {
        eprintln!("{}: {}", PROGNAME, vm.get_error_message(e));
        return 1;
    }

    let code = run_chunk(&mut vm, opts.chunk_file.as_deref(), &opts.chunk_args);
    vm.close();
    code
}

fn main() {
    std::process::exit(lua_main());
}
