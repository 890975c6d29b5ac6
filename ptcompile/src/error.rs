use ptir::NodeId;
use thiserror::Error;

/// A compilation failure. Fatal to the probe currently being compiled; never retried. Reported
/// through a single diagnostic line (kind + node context), never a stack trace.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("node {node}: transfer destination is unresolved (nowhere/virtual)")]
    DestinationUnknown { node: NodeId },

    #[error("node {node}: transfer source is unresolved (nowhere/virtual)")]
    SourceUnknown { node: NodeId },

    #[error("node {node}: stack-to-stack transfer is not supported")]
    UnsupportedTransfer { node: NodeId },

    #[error("node {node}: unknown builtin {name:?}")]
    UnknownBuiltin { node: NodeId, name: String },

    #[error("node {node}: predicate result was not placed in a register")]
    PredicateNotInRegister { node: NodeId },

    #[error("instruction buffer exhausted at capacity {capacity}")]
    ProgramTooLarge { capacity: usize },

    #[error("node {node}: variant {variant} reached a non-emitting context")]
    UnlowerableNode { node: NodeId, variant: &'static str },
}
