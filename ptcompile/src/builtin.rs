//! The generic builtin table, shared by every provider. Only `arg0..argN`/`retval` differ per
//! provider (via [`Provider::context_arg_offset`]/[`Provider::context_retval_offset`]); every
//! other name here is provider-independent.

use crate::emit::EmitCtx;
use crate::error::CompileError;
use crate::isa::{self, HelperId, Width};
use crate::provider::{Provider, CTX_REG};
use crate::xfer::{emit_xfer, XferSrc};
use ptir::descriptor::FRAME_POINTER;
use ptir::node::{Call, NodeKind};
use ptir::{Ast, Loc, NodeId};

/// `TASK_COMM_LEN`, the fixed buffer size `get_current_comm` fills.
pub(crate) const COMM_LEN: usize = 16;

/// Number of quantize buckets (one per possible `log2` result of a 64-bit signed value).
pub const QUANTIZE_BUCKETS: usize = 64;

fn dest_reg(ast: &Ast, id: NodeId) -> Option<u8> {
    ast.dyn_(id).loc.reg()
}

fn transfer_reg_result(ctx: &mut EmitCtx, id: NodeId, reg: u8) -> Result<(), CompileError> {
    emit_xfer(ctx.prog, id, ctx.ast.dyn_(id).loc, XferSrc::Reg(reg))
}

/// `get_current_pid_tgid`/`get_current_uid_gid` pack two 32-bit values into one 64-bit return in
/// r0; `hi` selects the upper half (shift right 32), else the lower half (mask low 32 bits).
fn packed_helper_half(ctx: &mut EmitCtx, id: NodeId, helper: HelperId, hi: bool) -> Result<(), CompileError> {
    ctx.prog.emit(isa::call(helper.id()))?;
    if hi {
        ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Rsh, 0, 32))?;
    } else {
        ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::And, 0, i32::MAX))?;
    }
    transfer_reg_result(ctx, id, 0)
}

/// Branchless `log2(x)`: halves the search range each step using signed-greater-equal jumps,
/// leaving the result in `dst`. `src` is left unmodified.
pub fn emit_log2(ctx: &mut EmitCtx, dst: u8, src: u8) -> Result<(), CompileError> {
    let scratch = if src == 0 { 1 } else { 0 };
    ctx.prog.emit(isa::mov(scratch, src))?;
    ctx.prog.emit(isa::mov_imm(dst, 0))?;
    for shift in [32, 16, 8, 4, 2, 1] {
        // if scratch >= (1 << shift): dst += shift; scratch >>= shift
        ctx.prog
            .emit(isa::jmp_imm(isa::JmpOp::Jsge, scratch, 1i32 << shift, 1))?;
        ctx.prog.emit(isa::ja(2))?;
        ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, dst, shift))?;
        ctx.prog
            .emit(isa::alu_imm(ptir::node::AluOp::Rsh, scratch, shift))?;
    }
    Ok(())
}

fn emit_arg(ctx: &mut EmitCtx, arg: NodeId) -> Result<u8, CompileError> {
    super::emit::emit_node(ctx, arg)?;
    match ctx.ast.dyn_(arg).loc {
        Loc::Reg(r) => Ok(r),
        Loc::Stack(addr) => {
            emit_xfer(ctx.prog, arg, Loc::Reg(0), XferSrc::Stack(addr))?;
            Ok(0)
        }
        Loc::Nowhere | Loc::Virtual => Err(CompileError::SourceUnknown { node: arg }),
    }
}

fn compile_arg_reader(
    ctx: &mut EmitCtx,
    id: NodeId,
    offset: Option<i16>,
) -> Result<(), CompileError> {
    let off = offset.ok_or(CompileError::UnknownBuiltin {
        node: id,
        name: "arg/retval not available for this provider".into(),
    })?;
    ctx.prog.emit(isa::ldx(Width::Dw, 0, off, CTX_REG))?;
    transfer_reg_result(ctx, id, 0)
}

/// Serializes `fmt_id` and each remaining argument into consecutive stack slots, then invokes
/// `trace_printk(buf, len)`.
fn compile_printf(ctx: &mut EmitCtx, id: NodeId, call: &Call) -> Result<(), CompileError> {
    let fmt = match call.args.first().map(|a| ctx.ast.node(*a).kind.clone()) {
        Some(NodeKind::Str(s)) => s,
        _ => {
            return Err(CompileError::UnknownBuiltin {
                node: id,
                name: "printf requires a literal format string".into(),
            })
        }
    };
    let fmt_id = ctx.ast.script_data_mut().fmt_id(&fmt);

    let probe = ctx.probe;
    let base = ctx.ast.probe_stack_get(probe, 8 * (1 + call.args.len().saturating_sub(1)));
    ctx.prog.emit(isa::mov_imm(0, fmt_id as i32))?;
    ctx.prog
        .emit(isa::stx(Width::Dw, FRAME_POINTER, base as i16, 0))?;

    for (i, arg) in call.args.iter().skip(1).enumerate() {
        let reg = emit_arg(ctx, *arg)?;
        let off = base as i16 + 8 * (i as i16 + 1);
        ctx.prog.emit(isa::stx(Width::Dw, FRAME_POINTER, off, reg))?;
    }

    ctx.prog.emit(isa::mov(1, FRAME_POINTER))?;
    ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 1, base as i32))?;
    ctx.prog
        .emit(isa::mov_imm(2, 8 * (1 + call.args.len().saturating_sub(1)) as i32))?;
    ctx.prog.emit(isa::call(HelperId::TracePrintk.id()))?;
    Ok(())
}

fn compile_stackid(ctx: &mut EmitCtx, id: NodeId) -> Result<(), CompileError> {
    // Annotation (`layout.rs::size_and_type`) already registered "__stackmap" for every probe
    // that calls `stackid()`; map-setup creates its fd before compilation reaches this point.
    let stackmap = ctx
        .ast
        .maps
        .get("__stackmap")
        .and_then(|m| m.fd)
        .ok_or(CompileError::UnknownBuiltin {
            node: id,
            name: "stackid: stack-trace map has no fd (map-setup did not run)".into(),
        })?;
    let ld = isa::ld_mapfd(1, stackmap);
    ctx.prog.emit(ld[0])?;
    ctx.prog.emit(ld[1])?;
    ctx.prog.emit(isa::mov(0, CTX_REG))?;
    ctx.prog.emit(isa::mov_imm(2, 0))?;
    ctx.prog.emit(isa::call(HelperId::GetStackid.id()))?;
    transfer_reg_result(ctx, id, 0)
}

/// `count()`/`quantize(x)` used as a plain assignment's right-hand side (`@k = count()`)
/// synthesize a read-modify-write on the map being assigned, rather than computing an ordinary
/// value. [`crate::emit::assign`] special-cases these by name before falling back to the generic
/// mov/op-assign paths.
pub fn is_rmw_builtin(name: &str) -> bool {
    matches!(name, "count" | "quantize")
}

pub fn compile(
    provider: &dyn Provider,
    ctx: &mut EmitCtx,
    id: NodeId,
    call: &Call,
) -> Result<(), CompileError> {
    match call.func.as_str() {
        "pid" => packed_helper_half(ctx, id, HelperId::GetCurrentPidTgid, false),
        "tid" => packed_helper_half(ctx, id, HelperId::GetCurrentPidTgid, true),
        "uid" => packed_helper_half(ctx, id, HelperId::GetCurrentUidGid, false),
        "gid" => packed_helper_half(ctx, id, HelperId::GetCurrentUidGid, true),
        "nsec" => {
            ctx.prog.emit(isa::call(HelperId::KtimeGetNs.id()))?;
            transfer_reg_result(ctx, id, 0)
        }
        "comm" => {
            let addr = ctx
                .ast
                .dyn_(id)
                .loc
                .addr()
                .ok_or(CompileError::DestinationUnknown { node: id })?;
            ctx.prog.emit(isa::mov(1, FRAME_POINTER))?;
            ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 1, addr as i32))?;
            ctx.prog.emit(isa::mov_imm(2, COMM_LEN as i32))?;
            ctx.prog.emit(isa::call(HelperId::GetCurrentComm.id()))?;
            Ok(())
        }
        "stackid" => compile_stackid(ctx, id),
        "printf" => compile_printf(ctx, id, call),
        "log2" => {
            let src = emit_arg(ctx, *call.args.first().ok_or(CompileError::UnknownBuiltin {
                node: id,
                name: "log2 requires one argument".into(),
            })?)?;
            let dst = dest_reg(ctx.ast, id).unwrap_or(if src == 0 { 1 } else { 0 });
            emit_log2(ctx, dst, src)?;
            transfer_reg_result(ctx, id, dst)
        }
        "count" | "quantize" => Err(CompileError::UnknownBuiltin {
            node: id,
            name: format!("{} is only valid as a map-assignment's right-hand side", call.func),
        }),
        other if other.starts_with("arg") && other[3..].parse::<u32>().is_ok() => {
            let n: u32 = other[3..].parse().unwrap();
            compile_arg_reader(ctx, id, provider.context_arg_offset(n))
        }
        "retval" => compile_arg_reader(ctx, id, provider.context_retval_offset()),
        other => Err(CompileError::UnknownBuiltin {
            node: id,
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;

    #[test]
    fn log2_of_one_is_zero_steps_conceptually() {
        // Structural check: emits the fixed 1 + 6*4 instruction shape (mov scratch, mov dst=0,
        // then 6 shift steps of 4 instructions each).
        let mut prog = Program::new(false);
        let mut ast = ptir::Ast::new();
        let probe = ast.script();
        let provider = crate::provider::KprobeProvider;
        let mut ctx = EmitCtx {
            ast: &mut ast,
            prog: &mut prog,
            provider: &provider,
            probe,
        };
        emit_log2(&mut ctx, 2, 3).unwrap();
        assert_eq!(prog.len(), 2 + 6 * 4);
    }

    #[test]
    fn log2_step_jumps_land_on_the_add_not_past_it() {
        // Each step is `Jsge scratch, thresh, +N; ja +2; add dst,shift; rsh scratch,shift`. The
        // conditional jump must land on the `add` (offset 1, skipping only the `ja`) so the true
        // case runs both `add` and `rsh`; landing past it (offset 2) would skip the `add` and
        // silently halve every log2 result that takes this branch.
        let mut prog = Program::new(false);
        let mut ast = ptir::Ast::new();
        let probe = ast.script();
        let provider = crate::provider::KprobeProvider;
        let mut ctx = EmitCtx {
            ast: &mut ast,
            prog: &mut prog,
            provider: &provider,
            probe,
        };
        emit_log2(&mut ctx, 2, 3).unwrap();
        let insns = prog.insns();
        // First step starts at index 2 (after the two setup instructions).
        let step0 = &insns[2];
        assert_eq!(step0.off, 1, "conditional jump must skip only the `ja`");
        let add = &insns[2 + 1 + step0.off as usize];
        assert_eq!(add.op(), 0, "jump target must be the `add`, not the `rsh` past it");
    }
}
