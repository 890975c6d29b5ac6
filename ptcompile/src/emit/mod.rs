//! Node emitters and the post-order walker that drives them.
//!
//! `compile_probe` is *prologue → predicate → foreach statement → epilogue*, strictly post
//! order: a node is emitted only after every child, so a parent's emitter can always trust that
//! its children's values are already resident at the locations their `dyn` records.

pub mod binop;

use crate::builtin;
use crate::error::CompileError;
use crate::isa::{self, HelperId, Width};
use crate::layout;
use crate::program::Program;
use crate::provider::{Provider, ARG_REG, CTX_REG};
use crate::xfer::{emit_xfer, XferSrc};
use ptir::descriptor::FRAME_POINTER;
use ptir::node::{Assign, Call, MapRef, Method, NodeKind};
use ptir::{Ast, Loc, MapDyn, NodeId};

/// Everything a node emitter needs: the arena (mutated for statement-local register reuse), the
/// instruction buffer being filled, the provider answering builtin/context questions, and which
/// probe we're compiling (for fresh stack allocations made during emission, e.g. printf staging).
pub struct EmitCtx<'a> {
    pub ast: &'a mut Ast,
    pub prog: &'a mut Program,
    pub provider: &'a dyn Provider,
    pub probe: NodeId,
}

/// Annotates and emits one probe end to end, returning its finished program.
pub fn compile_probe(ast: &mut Ast, provider: &dyn Provider, probe: NodeId, debug: bool) -> Result<Program, CompileError> {
    layout::annotate_probe(ast, probe)?;

    let mut prog = Program::new(debug);
    prog.emit(isa::mov(CTX_REG, ARG_REG))?;

    let mut ctx = EmitCtx {
        ast,
        prog: &mut prog,
        provider,
        probe,
    };

    if let Some(pred) = ctx.ast.probe_data(probe).pred {
        emit_node(&mut ctx, pred)?;
        // A bare map read used as a predicate (e.g. `/@seen/`) is stack-resident, not
        // register-resident — reload it the same way a binop operand would be materialized.
        let r = match ctx.ast.dyn_(pred).loc {
            Loc::Reg(r) => r,
            Loc::Stack(addr) => {
                emit_xfer(ctx.prog, pred, Loc::Reg(0), XferSrc::Stack(addr))?;
                0
            }
            Loc::Nowhere | Loc::Virtual => {
                return Err(CompileError::PredicateNotInRegister { node: pred })
            }
        };
        ctx.prog.emit(isa::jmp_imm(isa::JmpOp::Jne, r, 0, 2))?;
        ctx.prog.emit(isa::mov_imm(0, 0))?;
        ctx.prog.emit(isa::exit())?;
    }

    let stmts = ctx.ast.probe_data(probe).stmts.clone();
    let mut last_was_return = false;
    for stmt in &stmts {
        emit_node(&mut ctx, *stmt)?;
        last_was_return = matches!(ctx.ast.node(*stmt).kind, NodeKind::Return(_));
    }

    if !last_was_return {
        ctx.prog.emit(isa::mov_imm(0, 0))?;
        ctx.prog.emit(isa::exit())?;
    }

    Ok(prog)
}

pub fn emit_node(ctx: &mut EmitCtx, id: NodeId) -> Result<(), CompileError> {
    match ctx.ast.node(id).kind.clone() {
        NodeKind::Script(_) => Err(CompileError::UnlowerableNode { node: id, variant: "script" }),
        NodeKind::Probe(_) => Err(CompileError::UnlowerableNode { node: id, variant: "probe" }),
        NodeKind::Int(v) => emit_literal_int(ctx, id, v),
        NodeKind::Str(s) => emit_literal_bytes(ctx, id, s.as_bytes()),
        NodeKind::Rec(rec) => {
            for field in &rec.fields {
                emit_node(ctx, *field)?;
            }
            Ok(())
        }
        NodeKind::Map(map_ref) => emit_map_load(ctx, id, &map_ref),
        NodeKind::Not(operand) => binop::emit_not(ctx, id, operand),
        NodeKind::BinOp(b) => binop::emit(ctx, id, &b),
        NodeKind::Call(call) => {
            let provider = ctx.provider;
            provider.compile_call(ctx, id, &call)
        }
        NodeKind::Assign(a) => emit_assign(ctx, id, &a),
        NodeKind::Method(m) => emit_method(ctx, id, &m),
        NodeKind::Return(expr) => emit_return(ctx, expr),
    }
}

fn emit_literal_int(ctx: &mut EmitCtx, id: NodeId, v: i64) -> Result<(), CompileError> {
    match ctx.ast.dyn_(id).loc {
        Loc::Nowhere | Loc::Virtual => Ok(()), // parent fetches the literal directly
        loc => emit_xfer(ctx.prog, id, loc, XferSrc::Int(v)),
    }
}

fn emit_literal_bytes(ctx: &mut EmitCtx, id: NodeId, bytes: &[u8]) -> Result<(), CompileError> {
    match ctx.ast.dyn_(id).loc {
        Loc::Nowhere | Loc::Virtual => Ok(()),
        loc => emit_xfer(ctx.prog, id, loc, XferSrc::Bytes(bytes)),
    }
}

fn map_fd(ast: &Ast, node: NodeId, map_ref: &MapRef) -> Result<i32, CompileError> {
    let name = map_ref.name.clone().unwrap_or_default();
    ast.maps
        .get(&name)
        .and_then(|m: &MapDyn| m.fd)
        .ok_or(CompileError::UnknownBuiltin {
            node,
            name: format!("map {name:?} has no fd (map-setup did not run)"),
        })
}

/// Build the map key on the stack, starting at a reserved frame slot, returning its address.
/// Each key field has already been emitted (its own `dyn` placed it on the stack by the
/// annotator's `Rec`-like contiguous layout convention — key fields reuse the same allocator).
fn emit_key(ctx: &mut EmitCtx, probe: NodeId, key_fields: &[NodeId]) -> Result<i64, CompileError> {
    let total: usize = key_fields.iter().map(|f| ctx.ast.dyn_(*f).size).sum();
    let base = ctx.ast.probe_stack_get(probe, total.max(8));
    let mut off = base;
    for field in key_fields {
        emit_node(ctx, *field)?;
        let size = ctx.ast.dyn_(*field).size;
        let reg = match ctx.ast.dyn_(*field).loc {
            Loc::Reg(r) => r,
            Loc::Stack(addr) => {
                emit_xfer(ctx.prog, *field, Loc::Reg(0), XferSrc::Stack(addr))?;
                0
            }
            Loc::Nowhere | Loc::Virtual => return Err(CompileError::SourceUnknown { node: *field }),
        };
        ctx.prog.emit(isa::stx(Width::Dw, FRAME_POINTER, off as i16, reg))?;
        off += size as i64;
    }
    Ok(base)
}

/// `r1 = map_fd; r2 = &key; call map_lookup_elem`. Leaves the result pointer (or null) in r0.
fn emit_map_lookup(ctx: &mut EmitCtx, id: NodeId, map_ref: &MapRef, key_addr: i64) -> Result<(), CompileError> {
    let fd = map_fd(ctx.ast, id, map_ref)?;
    let ld = isa::ld_mapfd(1, fd);
    ctx.prog.emit(ld[0])?;
    ctx.prog.emit(ld[1])?;
    ctx.prog.emit(isa::mov(2, FRAME_POINTER))?;
    ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 2, key_addr as i32))?;
    ctx.prog.emit(isa::call(HelperId::MapLookupElem.id()))?;
    Ok(())
}

/// The map-load sequence (§4.5 "Map load"): zero the value area, look the key up, and on a hit
/// copy the kernel's value into our stack-resident value slot.
fn emit_map_load(ctx: &mut EmitCtx, id: NodeId, map_ref: &MapRef) -> Result<(), CompileError> {
    if ptir::ast::parent_is_mov_assign_lval(ctx.ast, id) {
        return Ok(());
    }
    let value_size = ctx.ast.dyn_(id).size;
    let value_addr = match ctx.ast.dyn_(id).loc {
        Loc::Stack(addr) => addr,
        _ => return Err(CompileError::DestinationUnknown { node: id }),
    };

    for i in (0..value_size).step_by(4) {
        ctx.prog.emit(isa::st_imm(FRAME_POINTER, value_addr as i16 + i as i16, 0))?;
    }

    let key_addr = emit_key(ctx, ctx.probe, &map_ref.key)?;
    emit_map_lookup(ctx, id, map_ref, key_addr)?;

    let skip = ctx.prog.cursor();
    ctx.prog.emit(isa::jmp_imm(isa::JmpOp::Jeq, 0, 0, 0))?; // patched below
    ctx.prog.emit(isa::mov(1, 0))?;
    ctx.prog.emit(isa::mov(2, FRAME_POINTER))?;
    ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 2, value_addr as i32))?;
    ctx.prog.emit(isa::mov_imm(3, value_size as i32))?;
    ctx.prog.emit(isa::call(HelperId::ProbeRead.id()))?;
    let after = ctx.prog.cursor();
    ctx.prog.patch_offset(skip, (after - skip - 1) as i16);
    Ok(())
}

/// One statement's read-modify-write through the assignment path: load, apply `op` against
/// `rhs_reg_or_imm`, write back. Shared by op-assign statements and the `count`/`quantize`
/// synthesized forms.
fn emit_rmw_store(
    ctx: &mut EmitCtx,
    map_ref: &MapRef,
    value_size: usize,
    value_addr: i64,
    op: ptir::node::AluOp,
    delta_imm: Option<i32>,
    delta_reg: Option<u8>,
) -> Result<(), CompileError> {
    for i in (0..value_size).step_by(4) {
        ctx.prog.emit(isa::st_imm(FRAME_POINTER, value_addr as i16 + i as i16, 0))?;
    }
    let key_addr = emit_key(ctx, ctx.probe, &map_ref.key)?;
    emit_map_lookup(ctx, ctx.ast.script(), map_ref, key_addr)?;

    let skip = ctx.prog.cursor();
    ctx.prog.emit(isa::jmp_imm(isa::JmpOp::Jeq, 0, 0, 0))?;
    ctx.prog.emit(isa::mov(1, 0))?;
    ctx.prog.emit(isa::mov(2, FRAME_POINTER))?;
    ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 2, value_addr as i32))?;
    ctx.prog.emit(isa::mov_imm(3, value_size as i32))?;
    ctx.prog.emit(isa::call(HelperId::ProbeRead.id()))?;
    let after = ctx.prog.cursor();
    ctx.prog.patch_offset(skip, (after - skip - 1) as i16);

    ctx.prog.emit(isa::ldx(Width::Dw, 0, value_addr as i16, FRAME_POINTER))?;
    match (delta_imm, delta_reg) {
        (Some(imm), _) => {
            ctx.prog.emit(isa::alu_imm(op, 0, imm))?;
        }
        (None, Some(reg)) => {
            ctx.prog.emit(isa::alu(op, 0, reg))?;
        }
        (None, None) => unreachable!("rmw store requires an operand"),
    }
    ctx.prog.emit(isa::stx(Width::Dw, FRAME_POINTER, value_addr as i16, 0))?;

    let fd = map_fd(ctx.ast, ctx.ast.script(), map_ref)?;
    let ld = isa::ld_mapfd(1, fd);
    ctx.prog.emit(ld[0])?;
    ctx.prog.emit(ld[1])?;
    ctx.prog.emit(isa::mov(2, FRAME_POINTER))?;
    ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 2, key_addr as i32))?;
    ctx.prog.emit(isa::mov(3, FRAME_POINTER))?;
    ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 3, value_addr as i32))?;
    ctx.prog.emit(isa::mov_imm(4, 0))?;
    ctx.prog.emit(isa::call(HelperId::MapUpdateElem.id()))?;
    Ok(())
}

fn as_map_ref(ast: &Ast, id: NodeId) -> Result<MapRef, CompileError> {
    match &ast.node(id).kind {
        NodeKind::Map(m) => Ok(m.clone()),
        _ => Err(CompileError::UnlowerableNode { node: id, variant: "non-map lvalue" }),
    }
}

fn emit_assign(ctx: &mut EmitCtx, id: NodeId, a: &Assign) -> Result<(), CompileError> {
    let map_ref = as_map_ref(ctx.ast, a.lval)?;

    // Delete form.
    if a.op.is_none() {
        let key_addr = emit_key(ctx, ctx.probe, &map_ref.key)?;
        let fd = map_fd(ctx.ast, id, &map_ref)?;
        let ld = isa::ld_mapfd(1, fd);
        ctx.prog.emit(ld[0])?;
        ctx.prog.emit(ld[1])?;
        ctx.prog.emit(isa::mov(2, FRAME_POINTER))?;
        ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 2, key_addr as i32))?;
        ctx.prog.emit(isa::call(HelperId::MapDeleteElem.id()))?;
        return Ok(());
    }

    let op = a.op.unwrap();
    let expr = a.expr.expect("non-delete assign always carries an expression");

    // `@k = count()` / `@k = quantize(x)`: synthesized read-modify-write regardless of the
    // written-out `=`.
    if matches!(op, ptir::node::AluOp::Mov) {
        if let NodeKind::Call(call) = ctx.ast.node(expr).kind.clone() {
            if builtin::is_rmw_builtin(&call.func) {
                return emit_rmw_builtin_assign(ctx, &map_ref, &call);
            }
        }
    }

    let value_size = ctx.ast.dyn_(a.lval).size;
    let value_addr = match ctx.ast.dyn_(a.lval).loc {
        Loc::Stack(addr) => addr,
        Loc::Virtual => ctx.ast.probe_stack_get(ctx.probe, value_size),
        _ => return Err(CompileError::DestinationUnknown { node: a.lval }),
    };

    if matches!(op, ptir::node::AluOp::Mov) {
        emit_node(ctx, expr)?;
        let key_addr = emit_key(ctx, ctx.probe, &map_ref.key)?;
        match ctx.ast.dyn_(expr).loc {
            Loc::Reg(r) => emit_xfer(ctx.prog, expr, Loc::Stack(value_addr), XferSrc::Reg(r))?,
            Loc::Stack(addr) if addr != value_addr => {
                emit_xfer(ctx.prog, expr, Loc::Reg(0), XferSrc::Stack(addr))?;
                emit_xfer(ctx.prog, expr, Loc::Stack(value_addr), XferSrc::Reg(0))?;
            }
            Loc::Stack(_) => {}
            Loc::Nowhere | Loc::Virtual => return Err(CompileError::SourceUnknown { node: expr }),
        }
        let fd = map_fd(ctx.ast, id, &map_ref)?;
        let ld = isa::ld_mapfd(1, fd);
        ctx.prog.emit(ld[0])?;
        ctx.prog.emit(ld[1])?;
        ctx.prog.emit(isa::mov(2, FRAME_POINTER))?;
        ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 2, key_addr as i32))?;
        ctx.prog.emit(isa::mov(3, FRAME_POINTER))?;
        ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 3, value_addr as i32))?;
        ctx.prog.emit(isa::mov_imm(4, 0))?;
        ctx.prog.emit(isa::call(HelperId::MapUpdateElem.id()))?;
        return Ok(());
    }

    // Read-modify-write op-assign.
    emit_node(ctx, expr)?;
    let (delta_imm, delta_reg) = match ctx.ast.node(expr).kind {
        NodeKind::Int(v) if v >= i32::MIN as i64 && v <= i32::MAX as i64 => (Some(v as i32), None),
        _ => {
            let reg = match ctx.ast.dyn_(expr).loc {
                Loc::Reg(r) => r,
                Loc::Stack(addr) => {
                    emit_xfer(ctx.prog, expr, Loc::Reg(1), XferSrc::Stack(addr))?;
                    1
                }
                Loc::Nowhere | Loc::Virtual => return Err(CompileError::SourceUnknown { node: expr }),
            };
            (None, Some(reg))
        }
    };
    emit_rmw_store(ctx, &map_ref, value_size, value_addr, op, delta_imm, delta_reg)
}

fn emit_rmw_builtin_assign(ctx: &mut EmitCtx, map_ref: &MapRef, call: &Call) -> Result<(), CompileError> {
    match call.func.as_str() {
        "count" => {
            let value_size = 8usize;
            let addr = ctx.ast.probe_stack_get(ctx.probe, value_size);
            emit_rmw_store(ctx, map_ref, value_size, addr, ptir::node::AluOp::Add, Some(1), None)
        }
        "quantize" => {
            let arg = *call.args.first().ok_or(CompileError::UnknownBuiltin {
                node: ctx.ast.script(),
                name: "quantize requires one argument".into(),
            })?;
            emit_node(ctx, arg)?;
            let src = match ctx.ast.dyn_(arg).loc {
                Loc::Reg(r) => r,
                Loc::Stack(addr) => {
                    emit_xfer(ctx.prog, arg, Loc::Reg(1), XferSrc::Stack(addr))?;
                    1
                }
                Loc::Nowhere | Loc::Virtual => return Err(CompileError::SourceUnknown { node: arg }),
            };
            let log2_dst = if src == 0 { 1 } else { 0 };
            // EmitCtx can't be reborrowed across the free-standing helper without a second
            // mutable borrow, so `emit_log2` is called directly (it only needs `ctx.prog`).
            crate::builtin::emit_log2(ctx, log2_dst, src)?;
            ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Mul, log2_dst, 8))?;

            // `emit_quantize_bucket_rmw` below calls `map_lookup_elem` (and possibly
            // `probe_read`), both of which clobber r0..=r5 — the same registers `log2_dst` lives
            // in. Spill it to the stack now and let the RMW helper reload it once those calls are
            // behind it, instead of carrying a helper-clobbered register across the calls.
            let bucket_offset_addr = ctx.ast.probe_stack_get(ctx.probe, 8);
            ctx.prog
                .emit(isa::stx(Width::Dw, FRAME_POINTER, bucket_offset_addr as i16, log2_dst))?;

            let bucket_array =
                ctx.ast
                    .probe_stack_get(ctx.probe, 8 * crate::builtin::QUANTIZE_BUCKETS);
            // value_addr for the RMW store is computed dynamically (base + bucket*8); since
            // `emit_rmw_store` expects a static offset, inline the dynamic-offset variant here.
            emit_quantize_bucket_rmw(ctx, map_ref, bucket_array, bucket_offset_addr)
        }
        other => Err(CompileError::UnknownBuiltin {
            node: ctx.ast.script(),
            name: other.to_string(),
        }),
    }
}

/// `quantize`'s bucket increment needs a dynamically computed value address (`base +
/// bucket_reg*8`), unlike every other map write which targets a fixed compile-time offset.
fn emit_quantize_bucket_rmw(
    ctx: &mut EmitCtx,
    map_ref: &MapRef,
    bucket_array_base: i64,
    bucket_offset_addr: i64,
) -> Result<(), CompileError> {
    let key_addr = emit_key(ctx, ctx.probe, &map_ref.key)?;
    emit_map_lookup(ctx, ctx.ast.script(), map_ref, key_addr)?;

    let skip = ctx.prog.cursor();
    ctx.prog.emit(isa::jmp_imm(isa::JmpOp::Jeq, 0, 0, 0))?;
    ctx.prog.emit(isa::mov(1, 0))?;
    ctx.prog.emit(isa::mov(2, FRAME_POINTER))?;
    ctx.prog
        .emit(isa::alu_imm(ptir::node::AluOp::Add, 2, bucket_array_base as i32))?;
    ctx.prog
        .emit(isa::mov_imm(3, 8 * crate::builtin::QUANTIZE_BUCKETS as i32))?;
    ctx.prog.emit(isa::call(HelperId::ProbeRead.id()))?;
    let after = ctx.prog.cursor();
    ctx.prog.patch_offset(skip, (after - skip - 1) as i16);

    // Both calls above clobber r0..=r5, so the bucket offset computed before them was spilled to
    // the stack; reload it now that no more helper calls stand between here and its use.
    let addr_reg = 5;
    let bucket_offset_reg = 4;
    ctx.prog
        .emit(isa::ldx(Width::Dw, bucket_offset_reg, bucket_offset_addr as i16, FRAME_POINTER))?;
    ctx.prog.emit(isa::mov(addr_reg, FRAME_POINTER))?;
    ctx.prog
        .emit(isa::alu_imm(ptir::node::AluOp::Add, addr_reg, bucket_array_base as i32))?;
    ctx.prog
        .emit(isa::alu(ptir::node::AluOp::Add, addr_reg, bucket_offset_reg))?;
    ctx.prog.emit(isa::ldx(Width::Dw, 0, 0, addr_reg))?;
    ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 0, 1))?;
    ctx.prog.emit(isa::stx(Width::Dw, addr_reg, 0, 0))?;

    let fd = map_fd(ctx.ast, ctx.ast.script(), map_ref)?;
    let ld = isa::ld_mapfd(1, fd);
    ctx.prog.emit(ld[0])?;
    ctx.prog.emit(ld[1])?;
    ctx.prog.emit(isa::mov(2, FRAME_POINTER))?;
    ctx.prog.emit(isa::alu_imm(ptir::node::AluOp::Add, 2, key_addr as i32))?;
    ctx.prog.emit(isa::mov(3, FRAME_POINTER))?;
    ctx.prog
        .emit(isa::alu_imm(ptir::node::AluOp::Add, 3, bucket_array_base as i32))?;
    ctx.prog.emit(isa::mov_imm(4, 0))?;
    ctx.prog.emit(isa::call(HelperId::MapUpdateElem.id()))?;
    Ok(())
}

/// `m.method(args)`: the method's own builtin code-gen writes into the map's stack-resident
/// value slot; this just follows with `map_update_elem`.
fn emit_method(ctx: &mut EmitCtx, id: NodeId, m: &Method) -> Result<(), CompileError> {
    let map_ref = as_map_ref(ctx.ast, m.map)?;
    let call = match ctx.ast.node(m.call).kind.clone() {
        NodeKind::Call(c) => c,
        _ => return Err(CompileError::UnlowerableNode { node: id, variant: "method without call" }),
    };
    emit_rmw_builtin_assign(ctx, &map_ref, &call)
}

fn emit_return(ctx: &mut EmitCtx, expr: Option<NodeId>) -> Result<(), CompileError> {
    match expr {
        Some(e) => {
            emit_node(ctx, e)?;
            match ctx.ast.dyn_(e).loc {
                Loc::Reg(r) if r != 0 => {
                    ctx.prog.emit(isa::mov(0, r))?;
                }
                Loc::Stack(addr) => {
                    ctx.prog.emit(isa::ldx(Width::Dw, 0, addr as i16, FRAME_POINTER))?;
                }
                Loc::Reg(_) => {}
                Loc::Nowhere | Loc::Virtual => return Err(CompileError::SourceUnknown { node: e }),
            }
        }
        None => {
            ctx.prog.emit(isa::mov_imm(0, 0))?;
        }
    }
    ctx.prog.emit(isa::exit())?;
    Ok(())
}
