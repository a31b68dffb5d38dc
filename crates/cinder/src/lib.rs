#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "bytecode operands are checked before narrowing")]
#![expect(clippy::float_cmp, reason = "value equality is defined as exact IEEE comparison")]
#![expect(clippy::items_after_statements, reason = "dispatch helpers declare their result enums next to use")]

mod builtins;
mod bytecode;
mod compiler;
mod error;
mod heap;
mod io;
mod lexer;
mod table;
mod tracer;
mod value;
mod vm;

pub use crate::{
    error::{CompileError, CompileErrors, ErrorSite, InterpretError, RuntimeError, TraceFrame},
    io::{CollectStringPrint, PrintWriter, StdPrint},
    tracer::{DisassemblingTracer, NoopTracer, VmTracer},
    vm::Vm,
};
