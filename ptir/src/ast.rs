//! The arena that owns an entire parsed script.
//!
//! Nodes are pushed once by the parser and never removed; the annotator and emitter mutate
//! `dyn_` (and, for statement-local register reuse, nothing else) in place through `&mut Ast`.
//! Freeing the script frees the whole graph in one `Vec` drop.

use crate::descriptor::{align8, Dyn, Loc};
use crate::mapdyn::MapDyn;
use crate::node::{Node, NodeId, NodeKind, Probe, Script};
use indexmap::IndexMap;
use typed_index_collections::TiVec;

pub struct Ast {
    nodes: TiVec<NodeId, Node>,
    script: NodeId,
    /// Map descriptors, keyed by name, in first-reference order. Lives alongside the arena
    /// rather than inside the script node's payload so `ptcompile` can hand out `&mut MapDyn`
    /// without fighting the borrow checker over `&mut Ast`.
    pub maps: IndexMap<String, MapDyn>,
}

impl Ast {
    /// Create a fresh arena containing only its root `script` node.
    pub fn new() -> Self {
        let mut nodes: TiVec<NodeId, Node> = TiVec::new();
        let script = NodeId::from(nodes.len());
        nodes.push(Node::new(NodeKind::Script(Script::default()), None, None));
        Ast {
            nodes,
            script,
            maps: IndexMap::new(),
        }
    }

    pub fn script(&self) -> NodeId {
        self.script
    }

    pub fn push(&mut self, kind: NodeKind, name: Option<String>, parent: NodeId) -> NodeId {
        let id = NodeId::from(self.nodes.len());
        self.nodes.push(Node::new(kind, name, Some(parent)));
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn dyn_(&self, id: NodeId) -> &Dyn {
        &self.nodes[id].dyn_
    }

    pub fn set_dyn(&mut self, id: NodeId, d: Dyn) {
        self.nodes[id].dyn_ = d;
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// Walk parent links up to the owning probe. Panics if `id` is not inside a probe (a bug in
    /// the caller, not a user error: every statement/expression node is parsed under a probe).
    pub fn node_get_probe(&self, mut id: NodeId) -> NodeId {
        loop {
            if matches!(self.nodes[id].kind, NodeKind::Probe(_)) {
                return id;
            }
            id = self.parent(id).expect("node has no enclosing probe");
        }
    }

    pub fn node_get_script(&self, mut id: NodeId) -> NodeId {
        loop {
            if matches!(self.nodes[id].kind, NodeKind::Script(_)) {
                return id;
            }
            id = self.parent(id).expect("node has no enclosing script");
        }
    }

    pub fn script_data(&self) -> &Script {
        match &self.nodes[self.script].kind {
            NodeKind::Script(s) => s,
            _ => unreachable!(),
        }
    }

    pub fn script_data_mut(&mut self) -> &mut Script {
        match &mut self.nodes[self.script].kind {
            NodeKind::Script(s) => s,
            _ => unreachable!(),
        }
    }

    pub fn probe_data(&self, id: NodeId) -> &Probe {
        match &self.nodes[id].kind {
            NodeKind::Probe(p) => p,
            _ => panic!("node {id} is not a probe"),
        }
    }

    pub fn probe_data_mut(&mut self, id: NodeId) -> &mut Probe {
        match &mut self.nodes[id].kind {
            NodeKind::Probe(p) => p,
            _ => panic!("node {id} is not a probe"),
        }
    }

    /// Allocate `size` bytes (aligned to 8) at the bottom of `probe`'s stack frame, returning the
    /// new (negative) offset. Mirrors the original tool's `node_probe_stack_get`.
    pub fn probe_stack_get(&mut self, probe: NodeId, size: usize) -> i64 {
        let aligned = align8(size) as i64;
        let p = self.probe_data_mut(probe);
        p.sp -= aligned;
        p.sp
    }

    /// Iterate a node's direct children, in emission order, for the post-order walker.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        match &self.nodes[id].kind {
            NodeKind::Script(s) => s.probes.clone(),
            NodeKind::Probe(p) => {
                let mut v = vec![];
                if let Some(pred) = p.pred {
                    v.push(pred);
                }
                v.extend(p.stmts.iter().copied());
                v
            }
            NodeKind::Call(c) => c.args.clone(),
            NodeKind::Assign(a) => {
                let mut v = vec![a.lval];
                if let Some(e) = a.expr {
                    v.push(e);
                }
                v
            }
            NodeKind::Method(m) => vec![m.map, m.call],
            NodeKind::Return(e) => e.iter().copied().collect(),
            NodeKind::BinOp(b) => vec![b.left, b.right],
            NodeKind::Not(e) => vec![*e],
            NodeKind::Map(m) => m.key.clone(),
            NodeKind::Rec(r) => r.fields.clone(),
            NodeKind::Int(_) | NodeKind::Str(_) => vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

/// True if `id`'s parent is an `Assign` whose operator is the plain `mov` replacement form (as
/// opposed to a read-modify-write or a delete).
pub fn parent_is_mov_assign_lval(ast: &Ast, id: NodeId) -> bool {
    match ast.parent(id).map(|p| &ast.node(p).kind) {
        Some(NodeKind::Assign(a)) => {
            a.lval == id && matches!(a.op, Some(crate::node::AluOp::Mov))
        }
        _ => false,
    }
}

/// Convenience used by a handful of emitters that need to know "is this node virtual" without
/// importing [`Loc`] directly.
pub fn is_virtual(ast: &Ast, id: NodeId) -> bool {
    matches!(ast.dyn_(id).loc, Loc::Virtual)
}
