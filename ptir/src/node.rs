//! The AST: a closed sum type of node kinds, stored in a flat arena and addressed by typed
//! index rather than pointer.
//!
//! Dispatch is on `node.kind` (see [`NodeKind`]) rather than virtual methods; the only open
//! polymorphism in the whole system is the provider callback table, which lives in `ptcompile`.

use crate::descriptor::Dyn;
use indexmap::IndexSet;
use std::fmt;

/// Index into an [`crate::ast::Ast`]'s node arena. Not an ownership edge: the arena owns every
/// node, an id is just data and is always valid as long as the arena that produced it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl From<usize> for NodeId {
    fn from(x: usize) -> Self {
        NodeId(x)
    }
}

impl From<NodeId> for usize {
    fn from(x: NodeId) -> Self {
        x.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// The arithmetic/bitwise ALU operations the VM supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Or,
    And,
    Xor,
    Lsh,
    Rsh,
    Neg,
    Mov,
}

/// Comparison operators. The DSL's `int` type is always 64-bit signed, so every ordered
/// comparison lowers to the VM's *signed* jump op; only equality/inequality have no sign variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Whether a [`NodeKind::BinOp`] lowers through the ALU or through a comparison jump sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    Alu(AluOp),
    Cmp(CmpOp),
}

/// `@name` or `@name[k1, k2, ...]`. `name` is `None` for the anonymous `@` accumulator.
#[derive(Debug, Clone)]
pub struct MapRef {
    pub name: Option<String>,
    /// Key fields, in declaration order. Empty for a scalar (un-indexed) map.
    pub key: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Rec {
    pub fields: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub func: String,
    pub args: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Assign {
    pub lval: NodeId,
    /// `None` signals the "delete" form: `@map[k] = nil;`.
    pub op: Option<AluOp>,
    pub expr: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub map: NodeId,
    pub call: NodeId,
}

#[derive(Debug, Clone)]
pub struct BinOp {
    pub kind: BinOpKind,
    pub left: NodeId,
    pub right: NodeId,
}

/// Per-probe state carried by the annotator: which provider owns it, and the running stack
/// cursor used by [`crate::ast::Ast::probe_stack_get`].
#[derive(Debug, Clone)]
pub struct Probe {
    /// `provider:target` split at the first `:`.
    pub provider: String,
    pub target: String,
    pub pred: Option<NodeId>,
    pub stmts: Vec<NodeId>,
    /// Negative-growing stack cursor; 0 means "no slots allocated yet".
    pub sp: i64,
}

/// Per-script state: the probe list, the map descriptor table (insertion-ordered, deduplicated
/// by name), and the printf format-string table (insertion-ordered, deduplicated by text).
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub probes: Vec<NodeId>,
    pub map_names: IndexSet<String>,
    pub printf_fmts: IndexSet<String>,
}

impl Script {
    /// Returns the `fmt_id` for `fmt`, allocating a new one on first occurrence.
    pub fn fmt_id(&mut self, fmt: &str) -> usize {
        self.printf_fmts.insert_full(fmt.to_string()).0
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Script(Script),
    Probe(Probe),
    Call(Call),
    Assign(Assign),
    Method(Method),
    Return(Option<NodeId>),
    BinOp(BinOp),
    Not(NodeId),
    Map(MapRef),
    Rec(Rec),
    Int(i64),
    Str(String),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Script(_) => "script",
            NodeKind::Probe(_) => "probe",
            NodeKind::Call(_) => "call",
            NodeKind::Assign(_) => "assign",
            NodeKind::Method(_) => "method",
            NodeKind::Return(_) => "return",
            NodeKind::BinOp(_) => "binop",
            NodeKind::Not(_) => "not",
            NodeKind::Map(_) => "map",
            NodeKind::Rec(_) => "rec",
            NodeKind::Int(_) => "int",
            NodeKind::Str(_) => "str",
        }
    }
}

/// One AST node: a kind-tagged payload, an optional textual name (e.g. the `pid` in a probe's
/// builtin call, or a map's name), a non-owning parent link, and the `dyn` descriptor filled in
/// by annotation.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub name: Option<String>,
    pub parent: Option<NodeId>,
    pub dyn_: Dyn,
}

impl Node {
    pub fn new(kind: NodeKind, name: Option<String>, parent: Option<NodeId>) -> Self {
        Node {
            kind,
            name,
            parent,
            dyn_: Dyn::unresolved(),
        }
    }

    /// A short label for diagnostics: the node's name if any, else `<kind>`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("<{}>", self.kind.name()),
        }
    }
}
