//! Binary operation lowering.
//!
//! ALU ops always target a register (`ALU(op, dst, src)` requires a register `dst`), so the left
//! operand is materialized into one at emission time — `materialize` reloads it from its stack
//! shadow with `LDXDW` when annotation left it there (e.g. a map read). Comparisons only have
//! `{eq,ne,gt,ge,sgt,sge}` jump forms — no `lt`/`le` — so `<`/`<=` are lowered by swapping
//! operands into the matching `>`/`>=` form before materializing the same way.

use crate::emit::EmitCtx;
use crate::error::CompileError;
use crate::isa::{self, JmpOp};
use crate::xfer::{emit_xfer, XferSrc};
use ptir::node::{AluOp, BinOp, BinOpKind, CmpOp, NodeKind};
use ptir::{Ast, NodeId};

/// `(equivalent jump op, whether operands must be swapped to express it)`.
fn cmp_dispatch(op: CmpOp) -> (JmpOp, bool) {
    match op {
        CmpOp::Eq => (JmpOp::Jeq, false),
        CmpOp::Ne => (JmpOp::Jne, false),
        CmpOp::Gt => (JmpOp::Jsgt, false),
        CmpOp::Ge => (JmpOp::Jsge, false),
        CmpOp::Lt => (JmpOp::Jsgt, true),
        CmpOp::Le => (JmpOp::Jsge, true),
    }
}

fn fits_i32(v: i64) -> Option<i32> {
    if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
        Some(v as i32)
    } else {
        None
    }
}

fn small_int_literal(ast: &Ast, id: NodeId) -> Option<i32> {
    match &ast.node(id).kind {
        NodeKind::Int(v) => fits_i32(*v),
        _ => None,
    }
}

/// Ensures `id`'s value is resident in some register, returning which one. If it's already
/// register-resident this is free; otherwise it's reloaded from its stack slot into `scratch`.
fn materialize(ctx: &mut EmitCtx, id: NodeId, scratch: u8) -> Result<u8, CompileError> {
    match ctx.ast.dyn_(id).loc {
        ptir::Loc::Reg(r) => Ok(r),
        ptir::Loc::Stack(addr) => {
            emit_xfer(ctx.prog, id, ptir::Loc::Reg(scratch), XferSrc::Stack(addr))?;
            Ok(scratch)
        }
        ptir::Loc::Nowhere | ptir::Loc::Virtual => Err(CompileError::SourceUnknown { node: id }),
    }
}

pub fn emit(ctx: &mut EmitCtx, id: NodeId, b: &BinOp) -> Result<(), CompileError> {
    super::emit_node(ctx, b.left)?;
    super::emit_node(ctx, b.right)?;

    match b.kind {
        BinOpKind::Alu(op) => {
            let dst = materialize(ctx, b.left, 0)?;
            if let Some(imm) = small_int_literal(ctx.ast, b.right) {
                ctx.prog.emit(isa::alu_imm(op, dst, imm))?;
            } else {
                let scratch = if dst == 0 { 1 } else { 0 };
                let src = materialize(ctx, b.right, scratch)?;
                ctx.prog.emit(isa::alu(op, dst, src))?;
            }
            emit_xfer(ctx.prog, id, ctx.ast.dyn_(id).loc, XferSrc::Reg(dst))
        }
        BinOpKind::Cmp(cmp) => {
            let (jmp_op, swap) = cmp_dispatch(cmp);
            let (forced, other) = if swap { (b.right, b.left) } else { (b.left, b.right) };
            let dst = materialize(ctx, forced, 0)?;
            if let Some(imm) = small_int_literal(ctx.ast, other) {
                ctx.prog.emit(isa::jmp_imm(jmp_op, dst, imm, 2))?;
            } else {
                let scratch = if dst == 0 { 1 } else { 0 };
                let src = materialize(ctx, other, scratch)?;
                ctx.prog.emit(isa::jmp(jmp_op, dst, src, 2))?;
            }
            ctx.prog.emit(isa::mov_imm(dst, 0))?;
            ctx.prog.emit(isa::ja(1))?;
            ctx.prog.emit(isa::mov_imm(dst, 1))?;
            emit_xfer(ctx.prog, id, ctx.ast.dyn_(id).loc, XferSrc::Reg(dst))
        }
    }
}

/// Lowers a logical-not (including the double-not used to normalize `&&`/`||` operands).
pub fn emit_not(ctx: &mut EmitCtx, id: NodeId, operand: NodeId) -> Result<(), CompileError> {
    super::emit_node(ctx, operand)?;
    let r = materialize(ctx, operand, 0)?;
    ctx.prog.emit(isa::jmp_imm(JmpOp::Jne, r, 0, 2))?;
    ctx.prog.emit(isa::mov_imm(r, 1))?;
    ctx.prog.emit(isa::ja(1))?;
    ctx.prog.emit(isa::mov_imm(r, 0))?;
    emit_xfer(ctx.prog, id, ctx.ast.dyn_(id).loc, XferSrc::Reg(r))
}

#[allow(unused)]
pub fn alu_op_name(op: AluOp) -> String {
    crate::dump::alu_mnemonic(op)
}
