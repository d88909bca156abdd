//! Graph construction context and scope stack.
//!
//! A [`GraphCtx`] owns a stack of frames, each holding a graph under
//! construction. Frame 0 is the root graph; every frame above it is an
//! isolated branch body being captured. All op helpers build into the top
//! frame, and any input value owned by an enclosing frame is captured
//! transitively: a placeholder is appended to each intervening frame in
//! first-use order, deduplicated by value identity.
//!
//! Ambient state is explicit here rather than thread-local: control
//! dependency scopes live on the frame they were opened in and never leak
//! out when the frame is popped. A branch frame starts with its own empty
//! scope stack; dependencies active when a conditional construct is built
//! attach to the construct as a whole, and a scope opened *inside* a branch
//! on an external value is realized as an internal no-op anchor, keeping
//! the body boundary data-only.
//!
//! Writing to shared mutable collections from inside a branch procedure is
//! deliberately unsupported: the context exposes no such primitive. The only
//! sanctioned way to touch the enclosing graph from a branch body is
//! [`GraphCtx::escape_to_root`], which exists for stateful resource creation
//! (the two branches never coexist at one invocation, so state must live
//! outside both).

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use ramify_ir::{
    DType, FuncLibrary, Graph, Literal, NodeId, Op, TypeSig, ValueRef,
};

use crate::engine::errors::BuildError;

/// One captured external value of a frame.
#[derive(Debug, Clone)]
pub(crate) struct Capture {
    /// The value in the enclosing frame.
    pub outer: ValueRef,
    /// The placeholder standing in for it inside this frame's graph.
    pub placeholder: NodeId,
    pub sig: TypeSig,
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub graph: Graph,
    /// Captured externals in first-use order.
    pub captures: Vec<Capture>,
    capture_index: FxHashMap<ValueRef, NodeId>,
    /// Active control-dependency scopes, innermost last.
    ctrl_scopes: Vec<Vec<NodeId>>,
    /// No-op anchors realizing control deps on external values.
    ctrl_anchors: FxHashMap<ValueRef, NodeId>,
}

impl Frame {
    fn new() -> Frame {
        Frame::with_graph(Graph::new())
    }

    fn with_graph(graph: Graph) -> Frame {
        Frame {
            graph,
            captures: Vec::new(),
            capture_index: FxHashMap::default(),
            ctrl_scopes: Vec::new(),
            ctrl_anchors: FxHashMap::default(),
        }
    }

    /// Union of active control scopes, order-preserving and deduplicated.
    fn active_ctrl(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for scope in &self.ctrl_scopes {
            for id in scope {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
        }
        out
    }
}

/// Graph construction context: the scope-stack collaborator consumed by the
/// branch capturer and the conditional builder.
#[derive(Debug)]
pub struct GraphCtx {
    frames: Vec<Frame>,
    library: FuncLibrary,
}

impl Default for GraphCtx {
    fn default() -> Self {
        GraphCtx::new()
    }
}

impl GraphCtx {
    pub fn new() -> GraphCtx {
        GraphCtx {
            frames: vec![Frame::new()],
            library: FuncLibrary::new(),
        }
    }

    /// Resumes construction over an existing root graph and library, e.g.
    /// one loaded from a saved module.
    pub fn from_parts(graph: Graph, library: FuncLibrary) -> GraphCtx {
        GraphCtx { frames: vec![Frame::with_graph(graph)], library }
    }

    /// The graph currently being built (the top frame's).
    pub fn graph(&self) -> &Graph {
        &self.frames[self.frames.len() - 1].graph
    }

    pub fn library(&self) -> &FuncLibrary {
        &self.library
    }

    pub fn library_mut(&mut self) -> &mut FuncLibrary {
        &mut self.library
    }

    /// True while a branch body is being captured.
    pub fn in_branch(&self) -> bool {
        self.frames.len() > 1
    }

    /// Consumes the context, returning the root graph and the library.
    pub fn finish(mut self) -> (Graph, FuncLibrary) {
        debug_assert!(
            self.frames.len() == 1,
            "finish() called with a branch capture still open"
        );
        let root = self.frames.remove(0);
        (root.graph, self.library)
    }

    /// Declared type of a value owned by any frame on the stack.
    pub fn value_type(&self, v: ValueRef) -> Option<TypeSig> {
        self.frames
            .iter()
            .find_map(|f| f.graph.value_type(v))
            .cloned()
    }

    fn top(&mut self) -> &mut Frame {
        let i = self.frames.len() - 1;
        &mut self.frames[i]
    }

    pub(crate) fn top_graph_and_library_mut(&mut self) -> (&mut Graph, &mut FuncLibrary) {
        let i = self.frames.len() - 1;
        (&mut self.frames[i].graph, &mut self.library)
    }

    pub(crate) fn push_frame(&mut self) {
        self.frames.push(Frame::new());
    }

    pub(crate) fn pop_frame(&mut self) -> Frame {
        debug_assert!(self.frames.len() > 1, "cannot pop the root frame");
        self.frames.pop().expect("frame stack is never empty")
    }

    /// Resolves `v` for use in the top frame, capturing through every
    /// intervening frame if it belongs to an enclosing one.
    pub(crate) fn import(&mut self, v: ValueRef) -> Result<ValueRef, BuildError> {
        let top = self.frames.len() - 1;
        if v.graph == self.frames[top].graph.id() {
            return Ok(v);
        }
        let owner = self
            .frames
            .iter()
            .position(|f| f.graph.id() == v.graph)
            .ok_or_else(|| {
                BuildError::Internal(
                    "value references a graph outside the active scope stack".into(),
                )
            })?;
        let mut cur = v;
        for fi in owner + 1..=top {
            cur = self.capture_into(fi, cur)?;
        }
        Ok(cur)
    }

    fn capture_into(&mut self, fi: usize, outer: ValueRef) -> Result<ValueRef, BuildError> {
        if let Some(&ph) = self.frames[fi].capture_index.get(&outer) {
            return Ok(self.frames[fi].graph.value(ph, 0));
        }
        let sig = self.frames[fi - 1]
            .graph
            .value_type(outer)
            .cloned()
            .ok_or_else(|| {
                BuildError::Internal("captured value missing from enclosing graph".into())
            })?;
        let stem = self.frames[fi - 1]
            .graph
            .node(outer.node)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| "capture".into());
        let frame = &mut self.frames[fi];
        let name = frame.graph.unique_name(&stem);
        let ph = frame
            .graph
            .add_node(name, Op::Placeholder, &[], &[], std::slice::from_ref(&sig))?;
        frame.captures.push(Capture { outer, placeholder: ph, sig });
        frame.capture_index.insert(outer, ph);
        Ok(frame.graph.value(ph, 0))
    }

    /// Adds a node to the top frame, importing inputs and attaching the
    /// active control scopes.
    pub(crate) fn add_op(
        &mut self,
        stem: &str,
        op: Op,
        inputs: &[ValueRef],
        out_types: &[TypeSig],
    ) -> Result<NodeId, BuildError> {
        let mut resolved = SmallVec::<[ValueRef; 4]>::new();
        for v in inputs {
            resolved.push(self.import(*v)?);
        }
        let frame = self.top();
        let ctrl = frame.active_ctrl();
        let name = frame.graph.unique_name(stem);
        let id = frame
            .graph
            .add_node(name, op, &resolved, &ctrl, out_types)?;
        Ok(id)
    }

    fn top_value(&self, node: NodeId) -> ValueRef {
        self.graph().value(node, 0)
    }

    // ---- op helpers -----------------------------------------------------

    pub fn constant(&mut self, lit: Literal) -> Result<ValueRef, BuildError> {
        let sig = lit.type_sig();
        let id = self.add_op("const", Op::Const(lit), &[], std::slice::from_ref(&sig))?;
        Ok(self.top_value(id))
    }

    /// An explicit graph input, bound by feed at execution time. Only valid
    /// in the root graph: branch inputs are created by capture, never by
    /// hand.
    pub fn placeholder(&mut self, name: &str, sig: TypeSig) -> Result<ValueRef, BuildError> {
        if self.in_branch() {
            return Err(BuildError::Internal(
                "placeholders belong to the root graph; branch inputs are created by capture"
                    .into(),
            ));
        }
        let id = self.add_op(name, Op::Placeholder, &[], std::slice::from_ref(&sig))?;
        Ok(self.top_value(id))
    }

    /// A named stateful slot. Created in the root graph regardless of the
    /// current frame, then imported back into it.
    pub fn var(&mut self, name: &str, init: Literal) -> Result<ValueRef, BuildError> {
        let sig = init.type_sig();
        let name = name.to_string();
        self.escape_to_root(move |g| {
            let uname = g.unique_name(&name);
            let id = g.add_node(uname, Op::Var(init), &[], &[], std::slice::from_ref(&sig))?;
            Ok(g.value(id, 0))
        })
    }

    /// Runs `f` against the root graph and imports the value it produces
    /// into the current frame. The break-out-of-isolation primitive for
    /// stateful creation triggered inside a branch procedure.
    pub fn escape_to_root<F>(&mut self, f: F) -> Result<ValueRef, BuildError>
    where
        F: FnOnce(&mut Graph) -> Result<ValueRef, BuildError>,
    {
        let v = f(&mut self.frames[0].graph)?;
        self.import(v)
    }

    /// A zero value of the given signature, materialized at minimal cost.
    pub fn zeros(&mut self, sig: TypeSig) -> Result<ValueRef, BuildError> {
        let id = self.add_op("zeros", Op::Zeros, &[], std::slice::from_ref(&sig))?;
        Ok(self.top_value(id))
    }

    fn binary(
        &mut self,
        stem: &str,
        op: Op,
        a: ValueRef,
        b: ValueRef,
    ) -> Result<ValueRef, BuildError> {
        let sa = self.operand_type(stem, a)?;
        let sb = self.operand_type(stem, b)?;
        if sa != sb {
            return Err(BuildError::TypeMismatch(format!(
                "`{stem}` operands disagree: {sa} vs {sb}"
            )));
        }
        if sa.dtype == DType::Bool {
            return Err(BuildError::TypeMismatch(format!(
                "`{stem}` is not defined on bool"
            )));
        }
        let out = if matches!(op, Op::Greater) {
            TypeSig { dtype: DType::Bool, shape: sa.shape }
        } else {
            sa
        };
        let id = self.add_op(stem, op, &[a, b], std::slice::from_ref(&out))?;
        Ok(self.top_value(id))
    }

    fn unary(&mut self, stem: &str, op: Op, a: ValueRef) -> Result<ValueRef, BuildError> {
        let sig = self.operand_type(stem, a)?;
        if sig.dtype == DType::Bool {
            return Err(BuildError::TypeMismatch(format!(
                "`{stem}` is not defined on bool"
            )));
        }
        if matches!(op, Op::Exp) && sig.dtype != DType::F64 {
            return Err(BuildError::TypeMismatch("`exp` requires f64".into()));
        }
        let id = self.add_op(stem, op, &[a], std::slice::from_ref(&sig))?;
        Ok(self.top_value(id))
    }

    fn operand_type(&self, stem: &str, v: ValueRef) -> Result<TypeSig, BuildError> {
        self.value_type(v).ok_or_else(|| {
            BuildError::TypeMismatch(format!("`{stem}` operand from unknown graph"))
        })
    }

    pub fn add(&mut self, a: ValueRef, b: ValueRef) -> Result<ValueRef, BuildError> {
        self.binary("add", Op::Add, a, b)
    }

    pub fn sub(&mut self, a: ValueRef, b: ValueRef) -> Result<ValueRef, BuildError> {
        self.binary("sub", Op::Sub, a, b)
    }

    pub fn mul(&mut self, a: ValueRef, b: ValueRef) -> Result<ValueRef, BuildError> {
        self.binary("mul", Op::Mul, a, b)
    }

    pub fn greater(&mut self, a: ValueRef, b: ValueRef) -> Result<ValueRef, BuildError> {
        self.binary("greater", Op::Greater, a, b)
    }

    pub fn neg(&mut self, a: ValueRef) -> Result<ValueRef, BuildError> {
        self.unary("neg", Op::Neg, a)
    }

    pub fn exp(&mut self, a: ValueRef) -> Result<ValueRef, BuildError> {
        self.unary("exp", Op::Exp, a)
    }

    pub fn square(&mut self, a: ValueRef) -> Result<ValueRef, BuildError> {
        self.unary("square", Op::Square, a)
    }

    // ---- control dependencies -------------------------------------------

    /// Opens a control-dependency scope around `f`: every node created
    /// inside gets the dependencies as control predecessors. A dependency
    /// on a value from an enclosing frame is realized as an internal no-op
    /// wired to the captured value, since branch bodies carry only data
    /// edges across their boundary.
    pub fn with_control_dependencies<R, F>(
        &mut self,
        deps: &[ValueRef],
        f: F,
    ) -> Result<R, BuildError>
    where
        F: FnOnce(&mut GraphCtx) -> Result<R, BuildError>,
    {
        let mut anchors = Vec::with_capacity(deps.len());
        for d in deps {
            anchors.push(self.ctrl_anchor(*d)?);
        }
        self.top().ctrl_scopes.push(anchors);
        let result = f(self);
        self.top().ctrl_scopes.pop();
        result
    }

    fn ctrl_anchor(&mut self, dep: ValueRef) -> Result<NodeId, BuildError> {
        let top = self.frames.len() - 1;
        if dep.graph == self.frames[top].graph.id() {
            return Ok(dep.node);
        }
        if let Some(&a) = self.frames[top].ctrl_anchors.get(&dep) {
            return Ok(a);
        }
        let captured = self.import(dep)?;
        let frame = self.top();
        let name = frame.graph.unique_name("ctrl_anchor");
        let id = frame.graph.add_node(name, Op::NoOp, &[captured], &[], &[])?;
        frame.ctrl_anchors.insert(dep, id);
        Ok(id)
    }
}
