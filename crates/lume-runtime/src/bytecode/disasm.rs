//! Bytecode disassembler
//!
//! Renders an instruction stream in a human-readable, offset-prefixed form
//! for debugging and test failure output.

use std::fmt::Write;

use super::{
    decode_opcode, instruction_size, read_i16, read_i32, read_u16, read_u32, read_u64, read_u8,
    ConstantEntry, Opcode, UnlinkedCodeBlock,
};
use crate::value::TValue;

/// Disassemble one function's bytecode.
pub fn disassemble(ucb: &UnlinkedCodeBlock) -> String {
    let mut output = String::new();

    if !ucb.constants.is_empty() {
        writeln!(output, "=== Constants ===").expect("writing to String");
        let len = ucb.constants.len() as i64;
        for (index, entry) in ucb.constants.iter().enumerate() {
            let ord = index as i64 - len;
            match entry {
                ConstantEntry::Value(v) => {
                    writeln!(output, "{}: {:?}", ord, v).expect("writing to String")
                }
                ConstantEntry::Code(id) => {
                    writeln!(output, "{}: <code block {}>", ord, id.0).expect("writing to String")
                }
            }
        }
        writeln!(output).expect("writing to String");
    }

    writeln!(output, "=== Instructions ===").expect("writing to String");
    let code = &ucb.bytecode;
    let mut offset = 0;
    while offset < code.len() {
        let line = disassemble_instruction(code, &mut offset);
        writeln!(output, "{}", line).expect("writing to String");
    }
    output
}

fn disassemble_instruction(code: &[u8], offset: &mut usize) -> String {
    let start = *offset;

    let byte = match read_u8(code, start) {
        Some(b) => b,
        None => return format!("{:04}  <truncated>", start),
    };
    let opcode = match decode_opcode(byte) {
        Some(op) => op,
        None => {
            *offset = start + 1;
            return format!("{:04}  <invalid opcode: {:#04x}>", start, byte);
        }
    };
    let size = instruction_size(opcode);
    if start + size > code.len() {
        *offset = code.len();
        return format!("{:04}  {} <truncated operands>", start, opcode.mnemonic());
    }
    *offset = start + size;

    let i32_at = |at: usize| read_i32(code, at).expect("bounds checked above");
    let u32_at = |at: usize| read_u32(code, at).expect("bounds checked above");
    let u16_at = |at: usize| read_u16(code, at).expect("bounds checked above");
    let i16_at = |at: usize| read_i16(code, at).expect("bounds checked above");
    let u8_at = |at: usize| read_u8(code, at).expect("bounds checked above");
    let target = |at: usize| (start as i64 + i32_at(at) as i64) as usize;

    let operands = match opcode {
        Opcode::UpvalueGet | Opcode::UpvaluePut => {
            format!("{} uv{}", i32_at(start + 1), u16_at(start + 5))
        }
        Opcode::UpvalueClose => {
            format!("{} -> {:04}", i32_at(start + 1), target(start + 5))
        }
        Opcode::TableGetById
        | Opcode::TablePutById
        | Opcode::TableGetByVal
        | Opcode::TablePutByVal => format!(
            "{} {} {}",
            i32_at(start + 1),
            i32_at(start + 5),
            i32_at(start + 9)
        ),
        Opcode::TableGetByIntegerVal | Opcode::TablePutByIntegerVal => format!(
            "{} {} [{}]",
            i32_at(start + 1),
            i32_at(start + 5),
            i16_at(start + 9)
        ),
        Opcode::TableVariadicPutSeq => {
            format!("{} [{}...]", i32_at(start + 1), i32_at(start + 5))
        }
        Opcode::TableNew => format!(
            "{} stepping={} hint={}",
            i32_at(start + 1),
            u8_at(start + 5),
            u16_at(start + 6)
        ),
        Opcode::TableDup | Opcode::GlobalGet | Opcode::GlobalPut | Opcode::NewClosure => {
            format!("{} {}", i32_at(start + 1), i32_at(start + 5))
        }
        Opcode::Call => format!(
            "keep_vr={} pass_vr={} params={} rets={} func={}",
            u8_at(start + 1),
            u8_at(start + 2),
            u32_at(start + 3),
            u32_at(start + 7),
            i32_at(start + 11)
        ),
        Opcode::TailCall => format!(
            "pass_vr={} params={} func={}",
            u8_at(start + 1),
            u32_at(start + 2),
            i32_at(start + 6)
        ),
        Opcode::Return => format!(
            "variadic={} num={} begin={}",
            u8_at(start + 1),
            u16_at(start + 2),
            i32_at(start + 4)
        ),
        Opcode::VariadicArgsToVariadicRet => String::new(),
        Opcode::PutVariadicArgs | Opcode::FillNil => {
            format!("{} n={}", i32_at(start + 1), u32_at(start + 5))
        }
        Opcode::Move | Opcode::UnaryMinus | Opcode::IsFalsy | Opcode::Len => {
            format!("{} {}", i32_at(start + 1), i32_at(start + 5))
        }
        Opcode::Constant => {
            let v = TValue::from_raw(read_u64(code, start + 5).expect("bounds checked above"));
            format!("{} {:?}", i32_at(start + 1), v)
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => format!(
            "{} {} -> {}",
            i32_at(start + 1),
            i32_at(start + 5),
            i32_at(start + 9)
        ),
        Opcode::IsEq
        | Opcode::IsNeq
        | Opcode::IsLt
        | Opcode::IsNlt
        | Opcode::IsLe
        | Opcode::IsNle => format!(
            "{} {} -> {:04}",
            i32_at(start + 1),
            i32_at(start + 5),
            target(start + 9)
        ),
        Opcode::CopyAndBranchIfTruthy | Opcode::CopyAndBranchIfFalsy => format!(
            "{} {} -> {:04}",
            i32_at(start + 1),
            i32_at(start + 5),
            target(start + 9)
        ),
        Opcode::BranchIfTruthy | Opcode::BranchIfFalsy => {
            format!("{} -> {:04}", i32_at(start + 1), target(start + 5))
        }
        Opcode::Jump => format!("-> {:04}", target(start + 1)),
        Opcode::ForLoopInit | Opcode::ForLoopStep => {
            format!("{} -> {:04}", i32_at(start + 1), target(start + 5))
        }
    };

    if operands.is_empty() {
        format!("{:04}  {}", start, opcode.mnemonic())
    } else {
        format!("{:04}  {} {}", start, opcode.mnemonic(), operands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, Slot};

    #[test]
    fn test_disassemble_straight_line() {
        let mut b = BytecodeBuilder::new(0, false, 4);
        b.emit_constant(0, TValue::create_double(1.5));
        b.emit_move(Slot::Local(0), 1);
        b.emit_return(false, 1, 1);
        let text = disassemble(&b.build());
        assert!(text.contains("Constant 0 TValue(1.5)"));
        assert!(text.contains("Move 0 1"));
        assert!(text.contains("Return variadic=0 num=1 begin=1"));
    }

    #[test]
    fn test_disassemble_branch_targets() {
        let mut b = BytecodeBuilder::new(0, false, 4);
        let j = b.emit_jump();
        b.emit_move(Slot::Local(0), 1);
        b.patch_branch_to_here(j);
        let text = disassemble(&b.build());
        assert!(text.contains("Jump -> 0014"), "got:\n{text}");
    }

    #[test]
    fn test_disassemble_invalid_byte() {
        let mut b = BytecodeBuilder::new(0, false, 4);
        b.emit_return(false, 0, 0);
        let mut ucb = b.build();
        ucb.bytecode.push(0xEE);
        let text = disassemble(&ucb);
        assert!(text.contains("<invalid opcode: 0xee>"));
    }
}
