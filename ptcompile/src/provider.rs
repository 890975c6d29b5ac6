//! Provider dispatch: the only open polymorphism in the back end.
//!
//! A provider is keyed by the probe specification's namespace prefix. This crate implements
//! `kprobe`/`kretprobe`'s compile-time half — `loc_assign`'s context-field knowledge and
//! `compile`'s builtin lowering. The attachment half (`setup`/`teardown`, which needs kernel
//! syscalls) lives in the driver crate's own `Attachment` trait instead, so this crate never
//! links `libc`.

use crate::emit::EmitCtx;
use crate::error::CompileError;
use ptir::node::Call;
use ptir::NodeId;

/// The VM register holding the saved probe context pointer across the probe body.
pub const CTX_REG: u8 = 9;
/// The VM's calling-convention argument register, holding the raw context pointer at entry.
pub const ARG_REG: u8 = 1;

pub trait Provider {
    fn name(&self) -> &'static str;

    /// Byte offset of `argN` within the probe's context structure, or `None` if this provider (or
    /// probe type) has no such argument — e.g. a `kretprobe`, which only exposes `retval`.
    fn context_arg_offset(&self, index: u32) -> Option<i16>;

    /// Byte offset of the return value within the context structure, if this provider exposes
    /// one.
    fn context_retval_offset(&self) -> Option<i16>;

    /// Lower a builtin call. Shared logic lives in [`crate::builtin`]; providers just supply
    /// their context-field knowledge through the two methods above.
    fn compile_call(&self, ctx: &mut EmitCtx, id: NodeId, call: &Call) -> Result<(), CompileError> {
        crate::builtin::compile(self, ctx, id, call)
    }
}

/// `kprobe:SYM` — entry probes. Exposes `arg0..argN`, no `retval`.
pub struct KprobeProvider;

impl Provider for KprobeProvider {
    fn name(&self) -> &'static str {
        "kprobe"
    }

    fn context_arg_offset(&self, index: u32) -> Option<i16> {
        // `struct pt_regs`-shaped context: each argument is one 8-byte register slot.
        Some((index as i16).checked_mul(8)?)
    }

    fn context_retval_offset(&self) -> Option<i16> {
        None
    }
}

/// `kretprobe:SYM` — return probes. Exposes `retval`, no arguments.
pub struct KretprobeProvider;

impl Provider for KretprobeProvider {
    fn name(&self) -> &'static str {
        "kretprobe"
    }

    fn context_arg_offset(&self, _index: u32) -> Option<i16> {
        None
    }

    fn context_retval_offset(&self) -> Option<i16> {
        Some(0)
    }
}

/// Resolve a probe specification's namespace prefix to its provider. `None` is the
/// `unknown-provider` ambient error condition (reported by the driver, not this crate).
pub fn resolve(namespace: &str) -> Option<Box<dyn Provider>> {
    match namespace {
        "kprobe" => Some(Box::new(KprobeProvider)),
        "kretprobe" => Some(Box::new(KretprobeProvider)),
        _ => None,
    }
}
