//! Reference interpreter and subroutine-dispatch runtime.
//!
//! Execution is a deterministic sequential schedule with dataflow
//! semantics: the graph is pruned to the requested outputs, then each node
//! fires once its own predecessors have resolved; there is never a
//! whole-branch barrier. Primitive routing uses dead tokens: `Switch`
//! forwards its value on exactly one port and a dead token on the other,
//! dead tokens flow through ordinary nodes without executing them, and
//! `Merge` takes its first live input. A functional `If` is the one
//! suspension point: its predicate is evaluated, then the chosen branch
//! body is dispatched through the [`Runtime`] as a single unit and runs to
//! completion with no mid-branch cancellation.
//!
//! Executed-node counts are recorded per run; dead-token propagation and
//! pruned work do not count.

use rustc_hash::{FxHashMap, FxHashSet};

use ramify_ir::{DType, FuncLibrary, Graph, Literal, NodeId, Op, Shape, TypeSig, ValueRef};

use crate::engine::errors::ExecError;
use crate::engine::prune::prune;
use crate::engine::validate::{mirror_indexes, verify_mirror_isolation};

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I64(i64),
    F64(f64),
    TensorF64 { shape: Shape, data: Vec<f64> },
}

impl Value {
    pub fn dtype(&self) -> DType {
        match self {
            Value::Bool(_) => DType::Bool,
            Value::I64(_) => DType::I64,
            Value::F64(_) | Value::TensorF64 { .. } => DType::F64,
        }
    }

    pub fn type_sig(&self) -> TypeSig {
        match self {
            Value::TensorF64 { shape, .. } => TypeSig::new(DType::F64, shape.clone()),
            v => TypeSig::scalar(v.dtype()),
        }
    }

    /// The minimal-cost value of a signature.
    pub fn zeros(sig: &TypeSig) -> Result<Value, ExecError> {
        if sig.shape.is_scalar() {
            return Ok(match sig.dtype {
                DType::Bool => Value::Bool(false),
                DType::I64 => Value::I64(0),
                DType::F64 => Value::F64(0.0),
            });
        }
        match sig.dtype {
            DType::F64 => Ok(Value::TensorF64 {
                shape: sig.shape.clone(),
                data: vec![0.0; sig.shape.num_elements()],
            }),
            other => Err(ExecError::UnsupportedOp(format!(
                "non-scalar {other} values are not implemented"
            ))),
        }
    }

    fn from_literal(lit: &Literal) -> Value {
        match lit {
            Literal::Bool(b) => Value::Bool(*b),
            Literal::I64(v) => Value::I64(*v),
            Literal::F64(v) => Value::F64(*v),
        }
    }

    fn as_bool(&self) -> Result<bool, ExecError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ExecError::UnsupportedOp(format!(
                "expected a bool predicate, got {}",
                other.type_sig()
            ))),
        }
    }
}

fn numeric_binary(
    name: &str,
    a: &Value,
    b: &Value,
    f: fn(f64, f64) -> f64,
    g: fn(i64, i64) -> i64,
) -> Result<Value, ExecError> {
    match (a, b) {
        (Value::F64(x), Value::F64(y)) => Ok(Value::F64(f(*x, *y))),
        (Value::I64(x), Value::I64(y)) => Ok(Value::I64(g(*x, *y))),
        (
            Value::TensorF64 { shape: s1, data: d1 },
            Value::TensorF64 { shape: s2, data: d2 },
        ) if s1 == s2 => Ok(Value::TensorF64 {
            shape: s1.clone(),
            data: d1.iter().zip(d2).map(|(x, y)| f(*x, *y)).collect(),
        }),
        _ => Err(ExecError::UnsupportedOp(format!(
            "{name} on {} and {}",
            a.type_sig(),
            b.type_sig()
        ))),
    }
}

fn numeric_unary(
    name: &str,
    a: &Value,
    f: fn(f64) -> f64,
    g: fn(i64) -> i64,
) -> Result<Value, ExecError> {
    match a {
        Value::F64(x) => Ok(Value::F64(f(*x))),
        Value::I64(x) => Ok(Value::I64(g(*x))),
        Value::TensorF64 { shape, data } => Ok(Value::TensorF64 {
            shape: shape.clone(),
            data: data.iter().map(|x| f(*x)).collect(),
        }),
        Value::Bool(_) => Err(ExecError::UnsupportedOp(format!("{name} on bool"))),
    }
}

#[derive(Debug, Clone)]
enum Token {
    Live(Value),
    Dead,
}

/// Per-run execution statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecStats {
    /// Nodes that actually computed a live result, branch bodies included.
    pub nodes_executed: usize,
}

/// The result of one run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub values: Vec<Value>,
    pub stats: ExecStats,
}

/// Interpreter options.
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    /// Verify, before functional dispatch, that no mirror output has real
    /// consumers. Best effort, on by default; detection is fatal.
    pub deny_mirror_reads: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        ExecOptions { deny_mirror_reads: true }
    }
}

/// The execution engine: owns the function library and dispatches
/// subroutine bodies by name.
#[derive(Debug)]
pub struct Runtime {
    library: FuncLibrary,
}

impl Runtime {
    pub fn new(library: FuncLibrary) -> Runtime {
        Runtime { library }
    }

    pub fn library(&self) -> &FuncLibrary {
        &self.library
    }

    pub fn into_library(self) -> FuncLibrary {
        self.library
    }

    /// The subroutine-dispatch interface: binds `inputs` to the named
    /// definition's placeholders and executes its body for all outputs.
    pub fn dispatch(&mut self, name: &str, inputs: &[Value]) -> Result<Vec<Value>, ExecError> {
        let mut stats = ExecStats::default();
        self.dispatch_counted(name, inputs, &ExecOptions::default(), &mut stats)
    }

    /// Runs `graph`, feeding placeholders and vars by name, and returns the
    /// requested values.
    pub fn run(
        &mut self,
        graph: &Graph,
        feeds: &[(&str, Value)],
        requested: &[ValueRef],
        opts: &ExecOptions,
    ) -> Result<RunResult, ExecError> {
        let feeds: FxHashMap<String, Value> =
            feeds.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        if opts.deny_mirror_reads {
            // a caller asking for a mirror output directly is a real read;
            // definitions forwarding mirror values outward are not
            self.check_requested_mirrors(graph, requested)?;
        }
        let mut stats = ExecStats::default();
        let values = self.exec_graph(
            graph,
            &FxHashMap::default(),
            &feeds,
            requested,
            opts,
            &mut stats,
        )?;
        Ok(RunResult { values, stats })
    }

    fn dispatch_counted(
        &mut self,
        name: &str,
        inputs: &[Value],
        opts: &ExecOptions,
        stats: &mut ExecStats,
    ) -> Result<Vec<Value>, ExecError> {
        let def = self.library.editable(name)?;
        if inputs.len() != def.inputs.len() {
            return Err(ExecError::Internal(format!(
                "function `{name}` expects {} inputs, got {}",
                def.inputs.len(),
                inputs.len()
            )));
        }
        let binds: FxHashMap<NodeId, Value> = def
            .inputs
            .iter()
            .zip(inputs)
            .map(|(i, v)| (i.placeholder, v.clone()))
            .collect();
        // the whole unit runs: every output is produced, mirrors included
        let requested: Vec<ValueRef> = def.outputs.clone();
        self.exec_graph(
            &def.body,
            &binds,
            &FxHashMap::default(),
            &requested,
            opts,
            stats,
        )
    }

    fn exec_graph(
        &mut self,
        graph: &Graph,
        binds: &FxHashMap<NodeId, Value>,
        feeds: &FxHashMap<String, Value>,
        requested: &[ValueRef],
        opts: &ExecOptions,
        stats: &mut ExecStats,
    ) -> Result<Vec<Value>, ExecError> {
        let mut work = graph.clone();
        prune(&mut work, requested).map_err(ExecError::Build)?;
        if opts.deny_mirror_reads {
            verify_mirror_isolation(&work, &self.library).map_err(ExecError::Build)?;
        }

        let mut tokens: FxHashMap<ValueRef, Token> = FxHashMap::default();
        let mut dead_nodes: FxHashSet<NodeId> = FxHashSet::default();
        let order = work.topo_order().map_err(ExecError::from)?;
        for id in order {
            let node = work.require(id).map_err(ExecError::from)?;
            let ctrl_dead = node.ctrl_inputs.iter().any(|c| dead_nodes.contains(c));

            // the join fires on its first live input, ignoring dead ones
            if matches!(node.op, Op::Merge) && !ctrl_dead {
                let first_live = node.inputs.iter().find_map(|v| match tokens.get(v) {
                    Some(Token::Live(val)) => Some(val.clone()),
                    _ => None,
                });
                let out = work.value(id, 0);
                match first_live {
                    Some(v) => {
                        stats.nodes_executed += 1;
                        tokens.insert(out, Token::Live(v));
                    }
                    None => {
                        dead_nodes.insert(id);
                        tokens.insert(out, Token::Dead);
                    }
                }
                continue;
            }

            let mut vals = Vec::with_capacity(node.inputs.len());
            let mut dead = ctrl_dead;
            for v in &node.inputs {
                match tokens.get(v) {
                    Some(Token::Live(val)) => vals.push(val.clone()),
                    Some(Token::Dead) => {
                        dead = true;
                        break;
                    }
                    None => {
                        return Err(ExecError::Internal(
                            "input token missing during execution".into(),
                        ))
                    }
                }
            }
            if dead {
                // dead tokens propagate without executing the node
                dead_nodes.insert(id);
                for i in 0..node.out_arity() {
                    tokens.insert(work.value(id, i as u32), Token::Dead);
                }
                continue;
            }

            let node_name = node.name.clone();
            let outputs: Vec<Value> = match &node.op {
                Op::Placeholder => {
                    let v = binds
                        .get(&id)
                        .or_else(|| feeds.get(&node_name))
                        .cloned()
                        .ok_or_else(|| ExecError::MissingFeed(node_name.clone()))?;
                    vec![v]
                }
                Op::Const(lit) => vec![Value::from_literal(lit)],
                Op::Var(init) => {
                    let v = feeds
                        .get(&node_name)
                        .cloned()
                        .unwrap_or_else(|| Value::from_literal(init));
                    vec![v]
                }
                Op::Zeros => vec![Value::zeros(&node.out_types[0])?],
                Op::Add => vec![numeric_binary("add", &vals[0], &vals[1], |x, y| x + y, |x, y| x + y)?],
                Op::Sub => vec![numeric_binary("sub", &vals[0], &vals[1], |x, y| x - y, |x, y| x - y)?],
                Op::Mul => vec![numeric_binary("mul", &vals[0], &vals[1], |x, y| x * y, |x, y| x * y)?],
                Op::Neg => vec![numeric_unary("neg", &vals[0], |x| -x, |x| -x)?],
                Op::Exp => match &vals[0] {
                    Value::F64(x) => vec![Value::F64(x.exp())],
                    Value::TensorF64 { shape, data } => vec![Value::TensorF64 {
                        shape: shape.clone(),
                        data: data.iter().map(|x| x.exp()).collect(),
                    }],
                    other => {
                        return Err(ExecError::UnsupportedOp(format!(
                            "exp on {}",
                            other.type_sig()
                        )))
                    }
                },
                Op::Square => vec![numeric_unary("square", &vals[0], |x| x * x, |x| x * x)?],
                Op::Greater => match (&vals[0], &vals[1]) {
                    (Value::F64(x), Value::F64(y)) => vec![Value::Bool(x > y)],
                    (Value::I64(x), Value::I64(y)) => vec![Value::Bool(x > y)],
                    _ => {
                        return Err(ExecError::UnsupportedOp(
                            "greater on non-scalar operands".into(),
                        ))
                    }
                },
                Op::NoOp => vec![],
                // joins are resolved before the dead-token check
                Op::Merge => {
                    return Err(ExecError::Internal(
                        "merge fell through the scheduler".into(),
                    ))
                }
                Op::Switch => {
                    let taken = vals[1].as_bool()?;
                    stats.nodes_executed += 1;
                    let out_f = work.value(id, 0);
                    let out_t = work.value(id, 1);
                    if taken {
                        tokens.insert(out_f, Token::Dead);
                        tokens.insert(out_t, Token::Live(vals[0].clone()));
                    } else {
                        tokens.insert(out_f, Token::Live(vals[0].clone()));
                        tokens.insert(out_t, Token::Dead);
                    }
                    continue;
                }
                Op::If { then_branch, else_branch, .. } => {
                    // suspension point: predicate first, then the chosen
                    // branch as one schedulable unit
                    let taken = vals[0].as_bool()?;
                    let branch = if taken { then_branch } else { else_branch };
                    let branch = branch.clone();
                    let outs = self.dispatch_counted(&branch, &vals[1..], opts, stats)?;
                    if outs.len() != node.out_arity() {
                        return Err(ExecError::Internal(format!(
                            "function `{branch}` returned {} outputs, construct declares {}",
                            outs.len(),
                            node.out_arity()
                        )));
                    }
                    outs
                }
            };
            stats.nodes_executed += 1;
            for (i, v) in outputs.into_iter().enumerate() {
                tokens.insert(work.value(id, i as u32), Token::Live(v));
            }
        }

        requested
            .iter()
            .map(|v| match tokens.get(v) {
                Some(Token::Live(val)) => Ok(val.clone()),
                Some(Token::Dead) => Err(ExecError::DeadValue(
                    work.node(v.node)
                        .map(|n| n.name.clone())
                        .unwrap_or_default(),
                )),
                None => Err(ExecError::Internal("requested value never resolved".into())),
            })
            .collect()
    }

    /// Requesting a mirror output directly is a read of the placeholder.
    fn check_requested_mirrors(
        &self,
        graph: &Graph,
        requested: &[ValueRef],
    ) -> Result<(), ExecError> {
        let request_set: FxHashSet<&ValueRef> = requested.iter().collect();
        for node in graph.nodes() {
            if !node.op.is_if() {
                continue;
            }
            for (m, function) in mirror_indexes(&self.library, node)? {
                let v = graph.value(node.id, m as u32);
                if request_set.contains(&v) {
                    return Err(ExecError::Build(
                        crate::engine::errors::BuildError::MirrorOutputConsumed {
                            function,
                            output: m,
                        },
                    ));
                }
            }
        }
        Ok(())
    }
}
