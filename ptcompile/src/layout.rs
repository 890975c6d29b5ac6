//! The annotator: post-order size/type propagation followed by location assignment.
//!
//! Runs once per probe, before any emission. A fresh [`RegAlloc`] is scoped to each top-level
//! statement (and to the predicate, if present) per the "free_regs drawn from the parent
//! statement" rule.
//!
//! Map-load results are always given a stack location (the mechanism probe_read writes into
//! is a stack region regardless), and consumers reload into a register themselves via the
//! transfer primitives when they need one — this is simpler than, and behaviourally equivalent
//! to, skipping that reload for values that happen to end up immediately register-consumed.

use crate::error::CompileError;
use crate::regalloc::RegAlloc;
use ptir::descriptor::{align8, Dyn, Loc, ValueType};
use ptir::mapdyn::MapDyn;
use ptir::node::NodeKind;
use ptir::{Ast, NodeId};

pub fn annotate_probe(ast: &mut Ast, probe_id: NodeId) -> Result<(), CompileError> {
    // Re-entrant: the driver may annotate a probe once to discover its maps and again (via
    // `compile_probe`) to actually emit it. Reset the stack cursor each time so the second pass
    // starts from the same frame layout as the first, instead of stacking a second frame's worth
    // of slots on top of the first's.
    ast.probe_data_mut(probe_id).sp = 0;

    let pred = ast.probe_data(probe_id).pred;
    let stmts = ast.probe_data(probe_id).stmts.clone();

    if let Some(pred) = pred {
        let mut regs = RegAlloc::fresh();
        size_and_type(ast, pred)?;
        loc_assign(ast, probe_id, pred, &mut regs)?;
    }

    for stmt in stmts {
        let mut regs = RegAlloc::fresh();
        size_and_type(ast, stmt)?;
        loc_assign(ast, probe_id, stmt, &mut regs)?;
    }
    Ok(())
}

/// Post-order: compute every descendant's `(ty, size)` before `id`'s own.
fn size_and_type(ast: &mut Ast, id: NodeId) -> Result<(), CompileError> {
    for child in ast.children(id) {
        size_and_type(ast, child)?;
    }
    let (ty, size) = match &ast.node(id).kind {
        NodeKind::Int(_) => (ValueType::Int, 8),
        NodeKind::Str(s) => (ValueType::Str, align8(s.len() + 1)),
        NodeKind::Rec(rec) => {
            let total = rec.fields.iter().map(|f| align8(ast.dyn_(*f).size)).sum();
            (ValueType::Rec, total)
        }
        NodeKind::Map(map_ref) => {
            let name = map_ref.name.clone().unwrap_or_default();
            let existing = ast.maps.get(&name).map(|m| (m.val_ty, m.val_size));
            let (ty, size) = existing.unwrap_or((ValueType::Int, 8));
            let key_sizes: Vec<usize> = map_ref.key.iter().map(|f| ast.dyn_(*f).size).collect();
            let entry = ast
                .maps
                .entry(name.clone())
                .or_insert_with(|| MapDyn::new(name, ty, size));
            if entry.key.field_sizes.is_empty() && !key_sizes.is_empty() {
                entry.key.field_sizes = key_sizes;
            }
            (ty, size)
        }
        NodeKind::BinOp(b) => {
            let size = ast.dyn_(b.left).size.max(ast.dyn_(b.right).size).max(8);
            (ValueType::Int, size)
        }
        NodeKind::Not(_) => (ValueType::Int, 8),
        // `comm()` fills a fixed `TASK_COMM_LEN`-sized buffer in place; every other builtin
        // returns a single 64-bit scalar.
        NodeKind::Call(call) if call.func == "comm" => (ValueType::Str, crate::builtin::COMM_LEN),
        NodeKind::Call(call) if call.func == "stackid" => {
            // Registered here, not only when `stackid()` is actually emitted, so the driver's
            // map-discovery pass sees it and creates its kernel map before emission needs the fd.
            ast.maps
                .entry("__stackmap".to_string())
                .or_insert_with(|| MapDyn::new("__stackmap", ValueType::Int, 8));
            (ValueType::Int, 8)
        }
        NodeKind::Call(_) => (ValueType::Int, 8),
        NodeKind::Script(_)
        | NodeKind::Probe(_)
        | NodeKind::Assign(_)
        | NodeKind::Method(_)
        | NodeKind::Return(_) => (ValueType::Int, 0),
    };
    let d = ast.dyn_(id).clone();
    ast.set_dyn(id, Dyn { ty, size, ..d });
    Ok(())
}

fn is_bare_stmt(ast: &Ast, probe_id: NodeId, id: NodeId) -> bool {
    ast.probe_data(probe_id).stmts.contains(&id)
}

fn loc_assign(
    ast: &mut Ast,
    probe_id: NodeId,
    id: NodeId,
    regs: &mut RegAlloc,
) -> Result<(), CompileError> {
    for child in ast.children(id) {
        loc_assign(ast, probe_id, child, regs)?;
    }

    let kind_is_virtual_container = matches!(
        ast.node(id).kind,
        NodeKind::Script(_)
            | NodeKind::Probe(_)
            | NodeKind::Assign(_)
            | NodeKind::Method(_)
            | NodeKind::Return(_)
    );

    if kind_is_virtual_container {
        mark_virtual(ast, id);
        return Ok(());
    }

    if let NodeKind::Map(_) = &ast.node(id).kind {
        if ptir::ast::parent_is_mov_assign_lval(ast, id) {
            mark_virtual(ast, id);
            return Ok(());
        }
        let size = ast.dyn_(id).size;
        let addr = ast.probe_stack_get(probe_id, size);
        set_loc(ast, id, Loc::Stack(addr));
        return Ok(());
    }

    if let NodeKind::Rec(rec) = ast.node(id).kind.clone() {
        let total = ast.dyn_(id).size;
        let base = ast.probe_stack_get(probe_id, total);
        let mut offset = base;
        for field in &rec.fields {
            let fsize = ast.dyn_(*field).size;
            set_loc(ast, *field, Loc::Stack(offset));
            offset += align8(fsize) as i64;
        }
        set_loc(ast, id, Loc::Stack(base));
        return Ok(());
    }

    if let NodeKind::Str(_) = &ast.node(id).kind {
        let size = ast.dyn_(id).size;
        let addr = ast.probe_stack_get(probe_id, size);
        set_loc(ast, id, Loc::Stack(addr));
        return Ok(());
    }

    if matches!(ast.node(id).kind, NodeKind::Call(_)) && is_bare_stmt(ast, probe_id, id) {
        mark_virtual(ast, id);
        return Ok(());
    }

    if let NodeKind::Call(call) = &ast.node(id).kind {
        if call.func == "comm" {
            let size = ast.dyn_(id).size;
            let addr = ast.probe_stack_get(probe_id, size);
            set_loc(ast, id, Loc::Stack(addr));
            return Ok(());
        }
    }

    // Scalar int-valued node (Int literal, BinOp, Not, non-bare Call): register if one is
    // free, else a stack slot. A binop's operands are free to land on the stack here too (e.g. a
    // map read) — `emit/binop.rs`'s `materialize` reloads whichever operand needs a register at
    // emission time, rather than annotation forcing a location this pass can't always honor
    // (a map/string/record child is pinned to `Loc::Stack` above and must stay there).
    match regs.acquire() {
        Some(r) => set_loc(ast, id, Loc::Reg(r)),
        None => {
            let addr = ast.probe_stack_get(probe_id, 8);
            set_loc(ast, id, Loc::Stack(addr));
        }
    }

    Ok(())
}

fn mark_virtual(ast: &mut Ast, id: NodeId) {
    let d = ast.dyn_(id).clone();
    ast.set_dyn(id, Dyn { loc: Loc::Virtual, ..d });
}

fn set_loc(ast: &mut Ast, id: NodeId, loc: Loc) {
    let d = ast.dyn_(id).clone();
    ast.set_dyn(id, Dyn { loc, ..d });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptir::parse;

    #[test]
    fn every_non_virtual_node_gets_resolved_loc() {
        let mut ast = parse("kprobe:f /pid == 1/ { @x[pid] = count(); }").unwrap();
        let probe = ast.script_data().probes[0];
        annotate_probe(&mut ast, probe).unwrap();
        for i in 0..ast.len() {
            let id = NodeId::from(i);
            let d = ast.dyn_(id);
            if !matches!(d.loc, Loc::Virtual | Loc::Nowhere) {
                assert!(d.size > 0, "node {id} has resolved loc but zero size");
            }
        }
    }

    #[test]
    fn binop_operand_that_is_a_map_read_stays_on_the_stack() {
        // `@y`/`@z` are map reads: annotation must leave them at `Loc::Stack`, not promote them
        // to a register the way a plain scalar operand would be — only `emit/binop.rs`'s
        // `materialize` reloads a stack-resident operand, and only at emission time.
        let mut ast = parse("kprobe:f { @x = @y + @z; }").unwrap();
        let probe = ast.script_data().probes[0];
        annotate_probe(&mut ast, probe).unwrap();
        for i in 0..ast.len() {
            let id = NodeId::from(i);
            if let NodeKind::BinOp(b) = ast.node(id).kind.clone() {
                assert!(matches!(ast.dyn_(b.left).loc, Loc::Stack(_)));
                assert!(matches!(ast.dyn_(b.right).loc, Loc::Stack(_)));
            }
        }
    }

    #[test]
    fn reannotating_a_probe_does_not_grow_its_stack_frame() {
        let mut ast = parse("kprobe:f { @x[pid] = count(); }").unwrap();
        let probe = ast.script_data().probes[0];
        annotate_probe(&mut ast, probe).unwrap();
        let sp_after_first = ast.probe_data(probe).sp;
        annotate_probe(&mut ast, probe).unwrap();
        assert_eq!(ast.probe_data(probe).sp, sp_after_first);
    }
}
