//! Bytecode disassembler.
//!
//! Backs the tracing hook and tests. Output format, one instruction per
//! line: offset, source line (or `|` when unchanged), opcode name, operands.

use std::fmt::Write as _;

use super::{Chunk, Opcode};
use crate::{heap::Heap, value::format_value};

/// Renders the instruction at `offset`; returns the text and the offset of
/// the next instruction.
pub(crate) fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        text.push_str("   | ");
    } else {
        let _ = write!(text, "{:4} ", chunk.line_at(offset));
    }

    let Some(op) = Opcode::from_repr(chunk.code[offset]) else {
        let _ = write!(text, "BAD_OPCODE {:#04x}", chunk.code[offset]);
        return (text, offset + 1);
    };

    let next = match op {
        Opcode::Constant
        | Opcode::GetGlobal
        | Opcode::DefineGlobal
        | Opcode::SetGlobal
        | Opcode::GetProperty
        | Opcode::SetProperty
        | Opcode::GetSuper
        | Opcode::Class
        | Opcode::Method => {
            let index = chunk.code[offset + 1];
            let constant = chunk.constants[index as usize];
            let _ = write!(text, "{:<16} {index:4} '{}'", op.name(), format_value(heap, constant));
            offset + 2
        }
        Opcode::GetLocal
        | Opcode::SetLocal
        | Opcode::GetUpvalue
        | Opcode::SetUpvalue
        | Opcode::Call
        | Opcode::List => {
            let _ = write!(text, "{:<16} {:4}", op.name(), chunk.code[offset + 1]);
            offset + 2
        }
        Opcode::Jump | Opcode::JumpIfFalse | Opcode::Loop => {
            let operand = u16::from_le_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let target = if op == Opcode::Loop {
                offset + 3 - operand as usize
            } else {
                offset + 3 + operand as usize
            };
            let _ = write!(text, "{:<16} {offset:4} -> {target}", op.name());
            offset + 3
        }
        Opcode::Invoke | Opcode::SuperInvoke => {
            let index = chunk.code[offset + 1];
            let arg_count = chunk.code[offset + 2];
            let constant = chunk.constants[index as usize];
            let _ = write!(
                text,
                "{:<16} ({arg_count} args) {index:4} '{}'",
                op.name(),
                format_value(heap, constant)
            );
            offset + 3
        }
        Opcode::Closure => {
            let index = chunk.code[offset + 1];
            let constant = chunk.constants[index as usize];
            let _ = write!(text, "{:<16} {index:4} {}", op.name(), format_value(heap, constant));
            let mut next = offset + 2;
            let upvalue_count = match constant {
                crate::value::Value::Obj(id) => heap.function(id).upvalue_count,
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = chunk.code[next];
                let slot = chunk.code[next + 1];
                let kind = if is_local == 1 { "local" } else { "upvalue" };
                let _ = write!(text, "\n{:04}      |                     {kind} {slot}", next);
                next += 2;
            }
            next
        }
        _ => {
            text.push_str(op.name());
            offset + 1
        }
    };
    (text, next)
}

/// Renders a whole chunk. Test and debugging helper.
#[cfg(test)]
pub(crate) fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}
