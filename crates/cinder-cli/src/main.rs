//! Command-line driver: run a script file, or an interactive line loop when
//! no path is given.

use std::{
    env, fs,
    io::{self, BufRead, Write},
    process::ExitCode,
};

use cinder::{DisassemblingTracer, InterpretError, StdPrint, Vm, VmTracer};

/// Exit code for scripts that fail to compile.
const EXIT_COMPILE_ERROR: u8 = 65;
/// Exit code for scripts that fail at runtime.
const EXIT_RUNTIME_ERROR: u8 = 70;

fn main() -> ExitCode {
    let mut trace = false;
    let mut path = None;
    for arg in env::args().skip(1) {
        if arg == "--trace" {
            trace = true;
        } else if path.is_none() {
            path = Some(arg);
        } else {
            eprintln!("usage: cinder [--trace] [script]");
            return ExitCode::FAILURE;
        }
    }

    match (path, trace) {
        (Some(path), true) => run_file(&mut Vm::with_tracer(DisassemblingTracer), &path),
        (Some(path), false) => run_file(&mut Vm::new(), &path),
        (None, true) => repl(&mut Vm::with_tracer(DisassemblingTracer)),
        (None, false) => repl(&mut Vm::new()),
    }
}

fn run_file<Tr: VmTracer>(vm: &mut Vm<Tr>, path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("could not read '{path}': {err}");
            return ExitCode::FAILURE;
        }
    };

    match vm.interpret(&source, &mut StdPrint) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(errors)) => {
            eprintln!("{errors}");
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        Err(InterpretError::Runtime(error)) => {
            eprintln!("{error}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

/// Reads one statement per line; errors are reported and the session keeps
/// going.
fn repl<Tr: VmTracer>(vm: &mut Vm<Tr>) -> ExitCode {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        let _ = stdout.flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return ExitCode::SUCCESS,
            Ok(_) => {}
        }
        if let Err(err) = vm.interpret(&line, &mut StdPrint) {
            eprintln!("{err}");
        }
    }
}
