//! Dataflow graph representation.
//!
//! A [`Graph`] is an ordered collection of [`Node`]s connected by data edges
//! (a node input names an output port of an earlier node) and control edges
//! (a node lists whole predecessor nodes that must run first). Node order is
//! insertion order and is preserved by serialization, so two builds of the
//! same program produce byte-identical saved modules.
//!
//! Values are addressed by [`ValueRef`], which carries the id of the graph
//! that owns the producing node. Cross-graph references are never stored in
//! a finished graph; detecting them during construction is what drives the
//! capture machinery in the engine crate.

use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::errors::IrError;
use crate::types::{Literal, TypeSig};

static NEXT_GRAPH_ID: AtomicU32 = AtomicU32::new(1);

/// A unique identifier for a graph within one process.
///
/// Ids are allocated from a process-wide counter so that values from two
/// different graphs can never be confused for one another.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphId(pub u32);

impl GraphId {
    fn fresh() -> GraphId {
        GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Advances the id counter past `id`. Called when loading serialized
    /// graphs so freshly built graphs never collide with loaded ones.
    pub fn ensure_above(id: GraphId) {
        NEXT_GRAPH_ID.fetch_max(id.0 + 1, Ordering::Relaxed);
    }
}

/// A unique identifier for a node within one graph.
///
/// NodeId implements Ord/PartialOrd for stable, deterministic iteration.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

/// One output port of one node: the unit of dataflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueRef {
    /// Graph that owns the producing node.
    pub graph: GraphId,
    /// The producing node.
    pub node: NodeId,
    /// Output port index on the producing node.
    pub index: u32,
}

/// How a conditional construct is to be executed.
///
/// This is a tagged attribute inspected by downstream passes, not behavior
/// baked into the node itself: the same construct can be consumed either way
/// depending on the compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExecMode {
    /// Execute the construct directly: once the predicate is known, the
    /// chosen branch body is dispatched as one schedulable unit.
    Functional,
    /// Rewrite the construct into primitive `Switch`/`Merge` routing before
    /// execution, restoring node-level non-strict scheduling.
    Lowered,
    /// The construct is claimed by an external compilation bridge and must
    /// be left in functional form; the lowering pass skips it.
    Bridge,
}

/// The instruction set.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Op {
    /// An explicit function input, bound at dispatch time.
    Placeholder,
    /// A typed scalar constant.
    Const(Literal),
    /// A named stateful slot with an initial value. Always created in the
    /// outermost graph; branch bodies reach it through capture.
    Var(Literal),
    Add,
    Sub,
    Mul,
    Neg,
    Exp,
    Square,
    /// Elementwise comparison producing a Bool.
    Greater,
    /// Control anchor: consumes one value, produces nothing. Used to give a
    /// node inside a branch body a control edge that is equivalent to an
    /// external control dependency without crossing the body boundary.
    NoOp,
    /// Minimal-cost placeholder generator: materializes a zero value of the
    /// declared type/shape. Used for mirror outputs and unconnected
    /// gradients.
    Zeros,
    /// Primitive router: inputs `[data, pred]`, outputs
    /// `[false_out, true_out]`. Exactly one output is live at runtime.
    Switch,
    /// Primitive join: one input per branch, output is the first live input.
    Merge,
    /// Functional conditional: inputs `[pred, externals..]`, branch bodies
    /// referenced by name in the function library.
    If {
        then_branch: String,
        else_branch: String,
        mode: ExecMode,
    },
}

impl Op {
    pub fn is_if(&self) -> bool {
        matches!(self, Op::If { .. })
    }
}

/// A node in a dataflow graph.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    pub id: NodeId,
    /// Unique within the owning graph.
    pub name: String,
    pub op: Op,
    /// Data inputs in positional order.
    pub inputs: SmallVec<[ValueRef; 2]>,
    /// Control predecessors: nodes that must run before this one.
    pub ctrl_inputs: SmallVec<[NodeId; 2]>,
    /// Declared output types, one per output port.
    pub out_types: SmallVec<[TypeSig; 2]>,
}

impl Node {
    pub fn out_arity(&self) -> usize {
        self.out_types.len()
    }
}

/// An ordered dataflow graph.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Graph {
    id: GraphId,
    next_node: u32,
    /// Nodes in insertion order.
    nodes: Vec<Node>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pos: FxHashMap<NodeId, usize>,
    #[cfg_attr(feature = "serde", serde(skip))]
    name_index: FxHashMap<String, NodeId>,
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            id: GraphId::fresh(),
            next_node: 0,
            nodes: Vec::new(),
            pos: FxHashMap::default(),
            name_index: FxHashMap::default(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.pos.get(&id).map(|&i| &self.nodes[i])
    }

    /// Like [`node`](Self::node) but with an error for propagation.
    pub fn require(&self, id: NodeId) -> Result<&Node, IrError> {
        self.node(id).ok_or(IrError::UnknownNode(id.0))
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.name_index.get(name).copied()
    }

    /// A reference to output port `index` of `node`.
    pub fn value(&self, node: NodeId, index: u32) -> ValueRef {
        ValueRef { graph: self.id, node, index }
    }

    /// Declared type of a value, if the value belongs to this graph.
    pub fn value_type(&self, v: ValueRef) -> Option<&TypeSig> {
        if v.graph != self.id {
            return None;
        }
        self.node(v.node).and_then(|n| n.out_types.get(v.index as usize))
    }

    /// A name not yet used by any node: `stem`, then `stem_1`, `stem_2`, ...
    pub fn unique_name(&self, stem: &str) -> String {
        if !self.name_index.contains_key(stem) {
            return stem.to_string();
        }
        let mut i = 1u32;
        loop {
            let candidate = format!("{stem}_{i}");
            if !self.name_index.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    /// Appends a node. Inputs must reference existing nodes of this graph.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: Op,
        inputs: &[ValueRef],
        ctrl_inputs: &[NodeId],
        out_types: &[TypeSig],
    ) -> Result<NodeId, IrError> {
        let name = name.into();
        if self.name_index.contains_key(&name) {
            return Err(IrError::DuplicateName(name));
        }
        for (i, v) in inputs.iter().enumerate() {
            if v.graph != self.id {
                return Err(IrError::ForeignInput { node: name.clone(), input: i });
            }
            let producer = self.require(v.node)?;
            if v.index as usize >= producer.out_arity() {
                return Err(IrError::PortOutOfRange {
                    node: producer.name.clone(),
                    port: v.index,
                });
            }
        }
        for c in ctrl_inputs {
            self.require(*c)?;
        }
        let id = NodeId(self.next_node);
        self.next_node += 1;
        let node = Node {
            id,
            name: name.clone(),
            op,
            inputs: SmallVec::from_slice(inputs),
            ctrl_inputs: SmallVec::from_slice(ctrl_inputs),
            out_types: SmallVec::from(out_types),
        };
        self.pos.insert(id, self.nodes.len());
        self.name_index.insert(name, id);
        self.nodes.push(node);
        Ok(id)
    }

    /// Data consumers of a value: `(consumer, input position)` pairs in
    /// insertion order.
    pub fn consumers(&self, v: ValueRef) -> Vec<(NodeId, usize)> {
        let mut out = Vec::new();
        for n in &self.nodes {
            for (i, input) in n.inputs.iter().enumerate() {
                if *input == v {
                    out.push((n.id, i));
                }
            }
        }
        out
    }

    /// Nodes holding a control edge on `id`, in insertion order.
    pub fn ctrl_consumers(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.ctrl_inputs.contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Rewires every data consumer of `old` to `new`. Returns the number of
    /// rewired input slots.
    pub fn replace_uses(&mut self, old: ValueRef, new: ValueRef) -> usize {
        let mut count = 0;
        for n in &mut self.nodes {
            for input in &mut n.inputs {
                if *input == old {
                    *input = new;
                    count += 1;
                }
            }
        }
        count
    }

    /// Rewires every control edge on `old` to `new`. Returns the number of
    /// rewired edges.
    pub fn replace_ctrl_uses(&mut self, old: NodeId, new: NodeId) -> usize {
        let mut count = 0;
        for n in &mut self.nodes {
            for c in &mut n.ctrl_inputs {
                if *c == old {
                    *c = new;
                    count += 1;
                }
            }
        }
        count
    }

    /// Removes a node that has no remaining data or control consumers.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, IrError> {
        let i = *self.pos.get(&id).ok_or(IrError::UnknownNode(id.0))?;
        let name = self.nodes[i].name.clone();
        let consumed = self.nodes.iter().any(|n| {
            n.inputs.iter().any(|v| v.node == id) || n.ctrl_inputs.contains(&id)
        });
        if consumed {
            return Err(IrError::NodeInUse(name));
        }
        let node = self.nodes.remove(i);
        self.pos.remove(&id);
        self.name_index.remove(&name);
        for (j, n) in self.nodes.iter().enumerate().skip(i) {
            self.pos.insert(n.id, j);
        }
        Ok(node)
    }

    /// Topological order, stable with respect to insertion order.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, IrError> {
        let mut placed: FxHashMap<NodeId, bool> =
            self.nodes.iter().map(|n| (n.id, false)).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while order.len() < self.nodes.len() {
            let mut advanced = false;
            for n in &self.nodes {
                if placed[&n.id] {
                    continue;
                }
                let ready = n
                    .inputs
                    .iter()
                    .map(|v| v.node)
                    .chain(n.ctrl_inputs.iter().copied())
                    .all(|dep| placed.get(&dep).copied().unwrap_or(true));
                if ready {
                    placed.insert(n.id, true);
                    order.push(n.id);
                    advanced = true;
                }
            }
            if !advanced {
                let stuck = self
                    .nodes
                    .iter()
                    .find(|n| !placed[&n.id])
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                return Err(IrError::Cycle(stuck));
            }
        }
        Ok(order)
    }

    /// Structural validation: input ports exist, no foreign references, no
    /// cycles.
    pub fn validate(&self) -> Result<(), IrError> {
        for n in &self.nodes {
            for (i, v) in n.inputs.iter().enumerate() {
                if v.graph != self.id {
                    return Err(IrError::ForeignInput { node: n.name.clone(), input: i });
                }
                let producer = self.require(v.node)?;
                if v.index as usize >= producer.out_arity() {
                    return Err(IrError::PortOutOfRange {
                        node: producer.name.clone(),
                        port: v.index,
                    });
                }
            }
            for c in &n.ctrl_inputs {
                self.require(*c)?;
            }
        }
        self.topo_order().map(|_| ())
    }

    /// A deep copy under a fresh graph id. Node ids and order are preserved;
    /// internal value references are retargeted to the new id.
    pub fn fork(&self) -> Graph {
        let old = self.id;
        let id = GraphId::fresh();
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                let mut n = n.clone();
                for v in &mut n.inputs {
                    if v.graph == old {
                        v.graph = id;
                    }
                }
                n
            })
            .collect();
        Graph {
            id,
            next_node: self.next_node,
            nodes,
            pos: self.pos.clone(),
            name_index: self.name_index.clone(),
        }
    }

    /// Rebuilds the lookup indexes after deserialization.
    pub(crate) fn rebuild_indexes(&mut self) {
        self.pos = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, i))
            .collect();
        self.name_index = self.nodes.iter().map(|n| (n.name.clone(), n.id)).collect();
    }
}
