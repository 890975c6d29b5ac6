//! Disassembly formatting: `IP:\t mnemonic\t operands`. This is part of the public testable
//! surface — test cases diff against it — so its shape must stay exactly as below.

use crate::isa::{Class, HelperId, RawInsn};
use ptir::node::AluOp;

fn alu_name(op_id: u8) -> &'static str {
    match op_id {
        0 => "add",
        1 => "sub",
        2 => "mul",
        3 => "div",
        4 => "mod",
        5 => "or",
        6 => "and",
        7 => "xor",
        8 => "lsh",
        9 => "rsh",
        10 => "neg",
        11 => "mov",
        _ => "alu?",
    }
}

fn jmp_name(op_id: u8) -> &'static str {
    match op_id {
        0 => "ja",
        1 => "jeq",
        2 => "jne",
        3 => "jgt",
        4 => "jge",
        5 => "jsgt",
        6 => "jsge",
        7 => "call",
        8 => "exit",
        _ => "jmp?",
    }
}

fn width_name(op_id: u8) -> &'static str {
    match op_id {
        0 => "b",
        1 => "h",
        2 => "w",
        3 => "dw",
        _ => "w?",
    }
}

fn mem_operand(base: u8, off: i16) -> String {
    if off >= 0 {
        format!("[r{base} + {off:#x}]")
    } else {
        format!("[r{base} - {:#x}]", -(off as i32))
    }
}

/// Disassemble a single instruction word, without its leading `IP:` tab column (used by the
/// `Program`'s live debug trace, which prefixes the IP itself).
pub fn dump_one(ip: usize, insn: &RawInsn) -> String {
    let class = insn.class();
    let op = insn.op();
    let body = if class == Class::Alu as u8 {
        format!("{}\tr{}, r{}", alu_name(op), insn.dst, insn.src)
    } else if class == Class::AluImm as u8 {
        format!("{}\tr{}, {}", alu_name(op), insn.dst, insn.imm)
    } else if class == Class::Jmp as u8 {
        match op {
            7 => format!("call\t{}", helper_name(insn.imm)),
            8 => "exit".to_string(),
            _ => format!(
                "{}\tr{}, r{}, {:+}",
                jmp_name(op),
                insn.dst,
                insn.src,
                insn.off
            ),
        }
    } else if class == Class::JmpImm as u8 {
        match op {
            7 => format!("call\t{}", helper_name(insn.imm)),
            8 => "exit".to_string(),
            0 => format!("ja\t{:+}", insn.off),
            _ => format!(
                "{}\tr{}, {}, {:+}",
                jmp_name(op),
                insn.dst,
                insn.imm,
                insn.off
            ),
        }
    } else if class == Class::Ldx as u8 {
        format!(
            "ldx{}\tr{}, {}",
            width_name(op),
            insn.dst,
            mem_operand(insn.src, insn.off)
        )
    } else if class == Class::Stx as u8 {
        format!(
            "stx{}\t{}, r{}",
            width_name(op),
            mem_operand(insn.dst, insn.off),
            insn.src
        )
    } else if class == Class::StImm as u8 {
        format!("stw\t{}, {}", mem_operand(insn.dst, insn.off), insn.imm)
    } else if class == Class::LdMapFd as u8 {
        if insn.src == 0 && op == 0 {
            format!("ld_mapfd\tr{}, fd={}", insn.dst, insn.imm)
        } else {
            "ld_mapfd.hi".to_string()
        }
    } else if class == Class::LdImm64 as u8 {
        if insn.src == 0 && insn.dst != 0 {
            format!("ld_imm64.lo\tr{}, {:#x}", insn.dst, insn.imm)
        } else {
            format!("ld_imm64.hi\t{:#x}", insn.imm)
        }
    } else {
        "??".to_string()
    };
    format!("{ip}:\t{body}")
}

fn helper_name(id: i32) -> String {
    match HelperId::from_id(id) {
        Some(h) => h.name().to_string(),
        None => format!("helper#{id}"),
    }
}

pub fn dump_program(insns: &[RawInsn]) -> String {
    insns
        .iter()
        .enumerate()
        .map(|(ip, insn)| dump_one(ip, insn))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Symbolic mnemonic for an [`AluOp`], used by a couple of emitters' debug logging (the encoder
/// itself only ever needs the numeric id, via `isa::alu`/`isa::alu_imm`).
pub fn alu_mnemonic(op: AluOp) -> String {
    op.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa;

    #[test]
    fn dumps_mov_imm() {
        let insn = isa::mov_imm(0, 42);
        assert_eq!(dump_one(0, &insn), "0:\tmov\tr0, 42");
    }

    #[test]
    fn dumps_call_with_symbolic_helper_name() {
        let insn = isa::call(isa::HelperId::GetCurrentPidTgid.id());
        assert_eq!(dump_one(5, &insn), "5:\tcall\tget_current_pid_tgid");
    }

    #[test]
    fn dumps_negative_offset_memory_operand() {
        let insn = isa::stx(isa::Width::Dw, 10, -16, 1);
        assert_eq!(dump_one(1, &insn), "1:\tstxdw\t[r10 - 0x10], r1");
    }
}
