/// Bytecode disassembler: one line per instruction, with function headers at
/// each `Meta` entry point.
use crate::bytecode::{ByteCode, MetaKind};
use crate::opcode::OpCode;
use std::fmt::Write;
use tarn_core::string::StringInterner;

/// Disassemble the whole instruction stream.
pub fn disassemble(code: &ByteCode, strings: &StringInterner) -> String {
    disassemble_range(code, 0, code.len(), strings)
}

/// Disassemble `code[from..to]` (clamped to the stream length).
pub fn disassemble_range(
    code: &ByteCode,
    from: usize,
    to: usize,
    strings: &StringInterner,
) -> String {
    let mut out = String::new();
    let to = to.min(code.len());
    for (ip, instr) in code.code.iter().enumerate().take(to).skip(from) {
        if instr.op == OpCode::Meta {
            let name = instr
                .name
                .map_or_else(|| "?".to_string(), |n| strings.get_str(n).into_owned());
            let kind = if instr.num_val2 == MetaKind::ChunkEntryPoint as i32 {
                "chunk"
            } else {
                "function"
            };
            writeln!(out, "; {kind} {name} ({} instructions)", instr.num_val).unwrap();
        }
        let line = match instr.source {
            Some(src) => format!("[{}]", src.line),
            None => "[-]".to_string(),
        };
        writeln!(out, "{ip:>6} {line:>6}  {}", instr.display(strings)).unwrap();
    }
    out
}
