//! The probe DSL's front end: lexer, parser, and the AST/descriptor types the compiler backend
//! (`ptcompile`) annotates and walks.

pub mod ast;
pub mod descriptor;
pub mod error;
pub mod lexer;
pub mod mapdyn;
pub mod node;
pub mod parser;

pub use ast::Ast;
pub use descriptor::{Dyn, Loc, ValueType};
pub use error::ParseError;
pub use mapdyn::MapDyn;
pub use node::{Node, NodeId, NodeKind};
pub use parser::parse;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_probe() {
        let ast = parse("kprobe:vfs_read { printf(\"hit\\n\"); }").unwrap();
        let script = ast.script_data();
        assert_eq!(script.probes.len(), 1);
        let probe = ast.probe_data(script.probes[0]);
        assert_eq!(probe.provider, "kprobe");
        assert_eq!(probe.target, "vfs_read");
        assert!(probe.pred.is_none());
        assert_eq!(probe.stmts.len(), 1);
    }

    #[test]
    fn parses_predicate_and_glob_target() {
        let ast = parse("kprobe:sys_* /pid == 1234/ { @count = @count + 1; }").unwrap();
        let probe = ast.probe_data(ast.script_data().probes[0]);
        assert_eq!(probe.target, "sys_*");
        assert!(probe.pred.is_some());
        assert_eq!(probe.stmts.len(), 1);
    }

    #[test]
    fn parses_map_with_key_and_method_call() {
        let ast = parse("kprobe:vfs_read { @bytes[comm()].quantize(retval()); }").unwrap();
        let probe = ast.probe_data(ast.script_data().probes[0]);
        assert_eq!(probe.stmts.len(), 1);
        match &ast.node(probe.stmts[0]).kind {
            NodeKind::Method(m) => match &ast.node(m.map).kind {
                NodeKind::Map(map) => {
                    assert_eq!(map.name.as_deref(), Some("bytes"));
                    assert_eq!(map.key.len(), 1);
                }
                other => panic!("expected map, got {other:?}"),
            },
            other => panic!("expected method, got {other:?}"),
        }
    }

    #[test]
    fn delete_forms_are_equivalent() {
        let a = parse("kprobe:f { @x[1] = nil; }").unwrap();
        let b = parse("kprobe:f { @x[1] = []; }").unwrap();
        for ast in [a, b] {
            let probe = ast.probe_data(ast.script_data().probes[0]);
            match &ast.node(probe.stmts[0]).kind {
                NodeKind::Assign(asg) => {
                    assert!(asg.op.is_none());
                    assert!(asg.expr.is_none());
                }
                other => panic!("expected assign, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = parse("kprobe:f { printf(\"oops; }").unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedString { .. }));
    }

    #[test]
    fn logical_or_lowers_to_double_not_binop() {
        let ast = parse("kprobe:f /pid == 1 || pid == 2/ { return; }").unwrap();
        let pred = ast.probe_data(ast.script_data().probes[0]).pred.unwrap();
        match &ast.node(pred).kind {
            NodeKind::BinOp(b) => {
                assert!(matches!(b.kind, crate::node::BinOpKind::Alu(crate::node::AluOp::Or)));
                assert!(matches!(ast.node(b.left).kind, NodeKind::Not(_)));
            }
            other => panic!("expected binop, got {other:?}"),
        }
    }
}
