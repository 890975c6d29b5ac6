//! Post-emission invariant checks, run once per compiled probe before it is handed to the
//! driver. Catches annotator/emitter bugs early rather than letting a malformed program reach
//! the kernel.

use crate::error::CompileError;
use crate::isa::{Class, JmpOp, RawInsn};
use crate::program::Program;
use ptir::descriptor::FRAME_POINTER;
use ptir::{Ast, NodeId};

/// Every non-virtual, non-`Nowhere` node must carry a positive size and a resolved location.
pub fn check_ast_resolved(ast: &Ast) -> Result<(), CompileError> {
    for i in 0..ast.len() {
        let id = NodeId::from(i);
        let d = ast.dyn_(id);
        if matches!(d.loc, ptir::Loc::Nowhere) {
            continue;
        }
        if !matches!(d.loc, ptir::Loc::Virtual) && d.size == 0 {
            return Err(CompileError::DestinationUnknown { node: id });
        }
    }
    Ok(())
}

/// A finished program must end in `exit`, never write the frame pointer, and every jump must
/// land inside the buffer.
pub fn check_program(prog: &Program) -> Result<(), CompileError> {
    let insns = prog.insns();
    match insns.last() {
        Some(last) if last.class() == Class::JmpImm as u8 && is_exit(last) => {}
        _ => {
            return Err(CompileError::UnlowerableNode {
                node: NodeId::from(0),
                variant: "program does not end in exit",
            })
        }
    }

    for (ip, insn) in insns.iter().enumerate() {
        if is_write_class(insn) && insn.dst == FRAME_POINTER {
            return Err(CompileError::UnlowerableNode {
                node: NodeId::from(ip),
                variant: "instruction writes the frame pointer",
            });
        }
        if is_conditional_jump(insn) {
            let target = ip as i64 + 1 + insn.off as i64;
            if target < 0 || target as usize >= insns.len() {
                return Err(CompileError::UnlowerableNode {
                    node: NodeId::from(ip),
                    variant: "jump target out of bounds",
                });
            }
        }
    }
    Ok(())
}

fn is_exit(insn: &RawInsn) -> bool {
    insn.op() == jmp_op_code(JmpOp::Exit)
}

fn jmp_op_code(op: JmpOp) -> u8 {
    match op {
        JmpOp::Ja => 0,
        JmpOp::Jeq => 1,
        JmpOp::Jne => 2,
        JmpOp::Jgt => 3,
        JmpOp::Jge => 4,
        JmpOp::Jsgt => 5,
        JmpOp::Jsge => 6,
        JmpOp::Call => 7,
        JmpOp::Exit => 8,
    }
}

/// Classes whose `dst` field is a true write-destination register. `Stx`/`StImm` reuse `dst` as
/// the memory operand's *base* register instead, and `Jmp`/`JmpImm` reuse it as a read-only
/// comparand, so neither belongs here.
fn is_write_class(insn: &RawInsn) -> bool {
    matches!(
        insn.class(),
        c if c == Class::Alu as u8
            || c == Class::AluImm as u8
            || c == Class::Ldx as u8
            || c == Class::LdMapFd as u8
            || c == Class::LdImm64 as u8
    )
}

fn is_conditional_jump(insn: &RawInsn) -> bool {
    let class = insn.class();
    (class == Class::Jmp as u8 || class == Class::JmpImm as u8)
        && insn.op() != jmp_op_code(JmpOp::Call)
        && insn.op() != jmp_op_code(JmpOp::Exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa;

    #[test]
    fn program_must_end_in_exit() {
        let mut p = Program::new(false);
        p.emit(isa::mov_imm(0, 0)).unwrap();
        assert!(check_program(&p).is_err());
        p.emit(isa::exit()).unwrap();
        assert!(check_program(&p).is_ok());
    }

    #[test]
    fn frame_pointer_destination_is_rejected() {
        let mut p = Program::new(false);
        p.emit(isa::mov(FRAME_POINTER, 1)).unwrap();
        p.emit(isa::exit()).unwrap();
        assert!(check_program(&p).is_err());
    }

    #[test]
    fn out_of_bounds_jump_is_rejected() {
        let mut p = Program::new(false);
        p.emit(isa::jmp_imm(isa::JmpOp::Jeq, 0, 0, 50)).unwrap();
        p.emit(isa::exit()).unwrap();
        assert!(check_program(&p).is_err());
    }

    #[test]
    fn jump_to_the_trailing_exit_is_in_bounds() {
        let mut p = Program::new(false);
        p.emit(isa::jmp_imm(isa::JmpOp::Jeq, 0, 0, 0)).unwrap();
        p.emit(isa::exit()).unwrap();
        assert!(check_program(&p).is_ok());
    }

    #[test]
    fn stack_store_through_the_frame_pointer_is_not_a_frame_pointer_write() {
        // `dst` on a Stx is the memory operand's base register, not a write target — every
        // spilled stack slot is addressed this way and must not trip the frame-pointer check.
        let mut p = Program::new(false);
        p.emit(isa::stx(isa::Width::Dw, FRAME_POINTER, -8, 1)).unwrap();
        p.emit(isa::exit()).unwrap();
        assert!(check_program(&p).is_ok());
    }
}
