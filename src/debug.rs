use std::fmt::Write;

use crate::chunk::{BuildOpCode, Chunk, OpCode, TestOpCode};

pub fn disassemble_chunk(chunk: &Chunk) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", chunk.name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }

    let _ = writeln!(out, "-- constants --");
    for (index, constant) in chunk.constants.iter().enumerate() {
        let _ = writeln!(out, "{:>4} {:?}", index, constant);
    }
    out
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:08} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        let _ = write!(out, "       | ");
    } else {
        let _ = write!(out, "{:8} ", chunk.line_at(offset));
    }

    let byte = chunk.read_byte(offset).unwrap_or(u8::MAX);
    let op = match OpCode::from_byte(byte) {
        Some(op) => op,
        None => {
            let _ = writeln!(out, "Unknown opcode {}", byte);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant
        | OpCode::DefineGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::Method
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper => constant_instruction(op, chunk, offset, out),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(op, chunk, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => jump_instruction(op, 1, chunk, offset, out),
        OpCode::Loop => jump_instruction(op, -1, chunk, offset, out),
        OpCode::Invoke => {
            let constant = operand(chunk, offset, 1);
            let argc = operand(chunk, offset, 2);
            let _ = writeln!(out, "{:<16} ({} args) {:>4} '{}'", op, argc, constant, constant_text(chunk, constant));
            offset + 3
        }
        OpCode::Closure => {
            let constant = operand(chunk, offset, 1);
            let count = operand(chunk, offset, 2);
            let _ = writeln!(out, "{:<16} {:>4} {} upvalues={}", op, constant, constant_text(chunk, constant), count);
            offset + 3
        }
        OpCode::Capture => {
            let kind = if operand(chunk, offset, 1) == 1 { "local" } else { "upvalue" };
            let _ = writeln!(out, "{:<16} {} {}", op, kind, operand(chunk, offset, 2));
            offset + 3
        }
        OpCode::Class => {
            let constant = operand(chunk, offset, 1);
            let chain = u16::from_be_bytes([operand(chunk, offset, 2), operand(chunk, offset, 3)]);
            let _ = writeln!(out, "{:<16} {:>4} '{}' init_chain={}", op, constant, constant_text(chunk, constant), chain);
            offset + 4
        }
        OpCode::Test => {
            let sub = TestOpCode::from_repr(operand(chunk, offset, 1));
            let (a, b) = (operand(chunk, offset, 2), operand(chunk, offset, 3));
            match sub {
                Some(TestOpCode::CaseAddress) => {
                    let _ = writeln!(out, "{:<16} {} {}", op, TestOpCode::CaseAddress, u16::from_be_bytes([a, b]));
                }
                Some(TestOpCode::SetEnd) => {
                    let _ = writeln!(out, "{:<16} {}", op, TestOpCode::SetEnd);
                }
                Some(sub) => {
                    let _ = writeln!(out, "{:<16} {} '{}' {}", op, sub, constant_text(chunk, a), b);
                }
                None => {
                    let _ = writeln!(out, "{:<16} ?", op);
                }
            }
            offset + 4
        }
        OpCode::Build => {
            let sub = BuildOpCode::from_repr(operand(chunk, offset, 1))
                .map(|s| s.to_string())
                .unwrap_or_else(|| "?".to_string());
            let constant = operand(chunk, offset, 2);
            let _ = writeln!(out, "{:<16} {} '{}'", op, sub, constant_text(chunk, constant));
            offset + 3
        }
        _ => simple_instruction(op, offset, out),
    }
}

/// Offsets that some jump, loop or init-chain operand lands on, sorted.
pub fn jump_targets(chunk: &Chunk) -> Vec<usize> {
    let mut targets = vec![];
    let mut offset = 0;
    while offset < chunk.len() {
        let op = match chunk.read_byte(offset).and_then(OpCode::from_byte) {
            Some(op) => op,
            None => {
                offset += 1;
                continue;
            }
        };
        let after = offset + 1 + op.operand_count();
        match op {
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
                targets.push(after + chunk.read_u16(offset + 1).unwrap_or(0) as usize);
            }
            OpCode::Loop => {
                targets.push(after.saturating_sub(chunk.read_u16(offset + 1).unwrap_or(0) as usize));
            }
            OpCode::Class => match chunk.read_u16(offset + 2) {
                Some(chain) if chain != crate::chunk::NO_INIT_CHAIN => targets.push(chain as usize),
                _ => {}
            },
            OpCode::Test if chunk.read_byte(offset + 1) == Some(TestOpCode::CaseAddress as u8) => {
                targets.push(chunk.read_u16(offset + 2).unwrap_or(0) as usize);
            }
            _ => {}
        }
        offset = after;
    }
    targets.sort_unstable();
    targets.dedup();
    targets
}

fn operand(chunk: &Chunk, offset: usize, index: usize) -> u8 {
    chunk.read_byte(offset + index).unwrap_or(0)
}

fn constant_text(chunk: &Chunk, index: u8) -> String {
    chunk
        .get_constant(index as usize)
        .map(|value| value.to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn simple_instruction(op: OpCode, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{}", op);
    offset + 1
}

fn constant_instruction(op: OpCode, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let constant = operand(chunk, offset, 1);
    let _ = writeln!(out, "{:<16} {:>4} '{}'", op, constant, constant_text(chunk, constant));
    offset + 2
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{:<16} {:>4}", op, operand(chunk, offset, 1));
    offset + 2
}

fn jump_instruction(op: OpCode, sign: i64, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = chunk.read_u16(offset + 1).unwrap_or(0) as i64;
    let target = offset as i64 + 3 + sign * jump;
    let _ = writeln!(out, "{:<16} {:>4} -> {}", op, offset, target);
    offset + 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compiler::Compiler, scanner::Scanner};

    fn chunk_for(text: &str) -> std::rc::Rc<Chunk> {
        let tokens = Scanner::new().scan(text).unwrap();
        Compiler::new(tokens, "test").compile().unwrap()
    }

    #[test]
    fn test_disassemble_lists_every_instruction() {
        let chunk = chunk_for("var a = 1; a = a + 2;");
        let text = disassemble_chunk(&chunk);
        assert!(text.starts_with("== test =="));
        assert!(text.contains("DefineGlobal"));
        assert!(text.contains("Add"));
        assert!(text.contains("Return"));
    }

    #[test]
    fn test_jump_targets_of_if_else() {
        let chunk = chunk_for("if (true) { 1; } else { 2; }");
        let targets = jump_targets(&chunk);
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| *t <= chunk.len()));
    }
}
