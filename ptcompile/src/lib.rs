//! Compiles a parsed script ([`ptir::Ast`]) into one in-kernel VM program per probe.
//!
//! The pipeline is `annotate_probe` (types/sizes/locations) then `emit::compile_probe`
//! (instructions), guarded by `wellformed` checks on the way out. `dump` renders the result for
//! humans; `provider` is the only point where probe-type-specific knowledge enters.

pub mod builtin;
pub mod dump;
pub mod emit;
pub mod error;
pub mod isa;
pub mod layout;
pub mod program;
pub mod provider;
pub mod regalloc;
pub mod wellformed;
pub mod xfer;

pub use emit::{compile_probe, EmitCtx};
pub use error::CompileError;
pub use program::Program;
pub use provider::{resolve as resolve_provider, Provider};

use ptir::{Ast, NodeId};

/// One finished, checked program plus the node it came from (for diagnostics).
pub struct CompiledProbe {
    pub probe: NodeId,
    pub program: Program,
}

/// Annotates every probe without emitting anything, populating `ast.maps` (names, key shapes,
/// value types/sizes) so a driver can create kernel maps before compilation resolves their fds.
/// Safe to call again later: `compile_script` re-annotates each probe itself, and annotation is a
/// pure recomputation from the AST that leaves already-registered map descriptors' `fd` alone.
pub fn discover_maps(ast: &mut Ast) -> Result<(), CompileError> {
    let probes = ast.script_data().probes.clone();
    for probe in probes {
        layout::annotate_probe(ast, probe)?;
    }
    Ok(())
}

/// Compile every probe in a script, resolving each one's provider by its namespace prefix.
pub fn compile_script(ast: &mut Ast, debug: bool) -> Result<Vec<CompiledProbe>, CompileError> {
    let probes = ast.script_data().probes.clone();
    let mut out = Vec::with_capacity(probes.len());
    for probe in probes {
        let namespace = ast.probe_data(probe).provider.clone();
        let provider = provider::resolve(&namespace).ok_or(CompileError::UnlowerableNode {
            node: probe,
            variant: "unknown provider namespace",
        })?;
        let program = compile_probe(ast, provider.as_ref(), probe, debug)?;
        wellformed::check_ast_resolved(ast)?;
        wellformed::check_program(&program)?;
        out.push(CompiledProbe { probe, program });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_minimal_probe_to_a_well_formed_program() {
        let mut ast = ptir::parse("kprobe:do_sys_open { printf(\"hit\\n\"); }").unwrap();
        let compiled = compile_script(&mut ast, false).unwrap();
        assert_eq!(compiled.len(), 1);
        assert!(!compiled[0].program.is_empty());
    }

    #[test]
    fn unknown_provider_namespace_is_rejected() {
        let mut ast = ptir::parse("usdt:foo { printf(\"x\\n\"); }").unwrap();
        assert!(compile_script(&mut ast, false).is_err());
    }

    #[test]
    fn quantize_compiles_to_a_well_formed_program() {
        let mut ast = ptir::parse("kprobe:do_sys_open { @h.quantize(arg0); }").unwrap();
        let compiled = compile_script(&mut ast, false).unwrap();
        assert_eq!(compiled.len(), 1);
    }

    #[test]
    fn map_operand_inside_a_binop_compiles() {
        let mut ast =
            ptir::parse("kprobe:do_sys_open { @a[pid] = count(); @b = @a + 1; }").unwrap();
        assert!(compile_script(&mut ast, false).is_ok());
    }
}
