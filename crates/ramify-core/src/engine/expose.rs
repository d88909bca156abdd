//! The intermediate exposure pass.
//!
//! Gradient construction reads values computed inside branch bodies. This
//! pass makes those values reachable from outside: each needed internal
//! value becomes a new output of its branch's definition, and the sibling
//! definition grows a same-typed mirror output so the matching-arity
//! invariant holds. Mirrors are materialized by a minimal-cost placeholder
//! generator, never by the real computation.
//!
//! Because registered definitions and already-built constructs may back
//! executions in flight, nothing is mutated in place: the pass registers
//! brand-new definitions, emits a brand-new `If` node, rewires every
//! consumer of the old construct's outputs, and removes the old node.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use ramify_ir::{
    ExecMode, FuncDef, FuncLibrary, Graph, IrError, NodeId, Op, TypeSig, ValueRef,
};

use crate::engine::errors::BuildError;

/// How mirror outputs materialize their placeholder value, and whether
/// reads of them are rejected before execution. A policy value rather than
/// a fixed algorithm: the cost contract of the placeholder is a tuning
/// decision, not a semantic one.
#[derive(Debug, Clone, Copy)]
pub struct MirrorPolicy {
    pub source: MirrorSource,
    /// Reject functional dispatch when a mirror output has real consumers.
    pub deny_reads: bool,
}

impl Default for MirrorPolicy {
    fn default() -> Self {
        MirrorPolicy { source: MirrorSource::Zeros, deny_reads: true }
    }
}

/// Generator for mirror placeholder values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorSource {
    /// A zero value of the declared type/shape.
    Zeros,
}

impl MirrorSource {
    fn emit(&self, body: &mut Graph, sig: &TypeSig) -> Result<ValueRef, BuildError> {
        match self {
            MirrorSource::Zeros => {
                let name = body.unique_name("mirror");
                let id = body.add_node(name, Op::Zeros, &[], &[], std::slice::from_ref(sig))?;
                Ok(body.value(id, 0))
            }
        }
    }
}

/// The rebuilt construct produced by exposure.
#[derive(Debug)]
pub struct ExposedCond {
    /// The new `If` node in the enclosing graph.
    pub node: NodeId,
    /// All outputs of the new construct, originals first.
    pub outputs: Vec<ValueRef>,
    pub then_def: Arc<FuncDef>,
    pub else_def: Arc<FuncDef>,
    /// Requested then-branch values, keyed exactly as passed in, mapped to
    /// output positions of the new construct.
    pub exposed_then: FxHashMap<ValueRef, usize>,
    pub exposed_else: FxHashMap<ValueRef, usize>,
}

/// Reads the branch names and mode off an `If` node.
pub(crate) fn if_parts(
    graph: &Graph,
    id: NodeId,
) -> Result<(String, String, ExecMode), BuildError> {
    let node = graph.require(id)?;
    match &node.op {
        Op::If { then_branch, else_branch, mode } => {
            Ok((then_branch.clone(), else_branch.clone(), *mode))
        }
        _ => Err(BuildError::Internal(format!(
            "node `{}` is not a conditional construct",
            node.name
        ))),
    }
}

/// Resolves a branch name to an editable definition, translating the
/// no-reconstruction-path case into the differentiation error.
pub(crate) fn editable_branch(
    library: &mut FuncLibrary,
    name: &str,
) -> Result<Arc<FuncDef>, BuildError> {
    library.editable(name).map_err(|e| match e {
        IrError::OpaqueFunction(n) => BuildError::UngradableBranch { name: n },
        other => BuildError::Ir(other),
    })
}

/// Exposes intermediates of the construct at `if_node`, forking its current
/// branch definitions. Convenience wrapper over [`expose_with`].
pub fn expose_cond(
    graph: &mut Graph,
    library: &mut FuncLibrary,
    if_node: NodeId,
    needed_then: &[ValueRef],
    needed_else: &[ValueRef],
) -> Result<ExposedCond, BuildError> {
    let (then_name, else_name, _) = if_parts(graph, if_node)?;
    let then_def = editable_branch(library, &then_name)?;
    let else_def = editable_branch(library, &else_name)?;
    let then_draft = then_def.fork(library.unique_name(&then_name));
    let else_draft = else_def.fork(library.unique_name(&else_name));
    expose_with(
        graph,
        library,
        if_node,
        then_draft,
        else_draft,
        needed_then,
        needed_else,
        &MirrorPolicy::default(),
    )
}

/// Exposes intermediates using caller-supplied definition drafts.
///
/// The drafts must be unregistered working copies of the construct's branch
/// definitions with node ids intact; requested values are addressed by node
/// and port, so references into any same-shaped copy of the bodies work.
#[allow(clippy::too_many_arguments)]
pub fn expose_with(
    graph: &mut Graph,
    library: &mut FuncLibrary,
    if_node: NodeId,
    then_draft: FuncDef,
    else_draft: FuncDef,
    needed_then: &[ValueRef],
    needed_else: &[ValueRef],
    policy: &MirrorPolicy,
) -> Result<ExposedCond, BuildError> {
    let (old_name, inputs, ctrl_inputs, mode) = {
        let node = graph.require(if_node)?;
        let mode = match &node.op {
            Op::If { mode, .. } => *mode,
            _ => {
                return Err(BuildError::Internal(format!(
                    "node `{}` is not a conditional construct",
                    node.name
                )))
            }
        };
        (node.name.clone(), node.inputs.clone(), node.ctrl_inputs.clone(), mode)
    };

    let mut then_d = then_draft;
    let mut else_d = else_draft;
    let n_orig = then_d.outputs.len();
    if n_orig != else_d.outputs.len() {
        return Err(BuildError::ArityInvariant {
            construct: old_name,
            then_arity: n_orig,
            else_arity: else_d.outputs.len(),
        });
    }

    let mut exposed_then = FxHashMap::default();
    expose_side(&mut then_d, &mut else_d, needed_then, &mut exposed_then, policy)?;
    let mut exposed_else = FxHashMap::default();
    expose_side(&mut else_d, &mut then_d, needed_else, &mut exposed_else, policy)?;

    let then_types = then_d.output_types();
    let else_types = else_d.output_types();
    if then_types.len() != else_types.len() {
        return Err(BuildError::ArityInvariant {
            construct: old_name,
            then_arity: then_types.len(),
            else_arity: else_types.len(),
        });
    }
    if then_types != else_types {
        return Err(BuildError::Internal(
            "exposure produced mismatched sibling output types".into(),
        ));
    }

    let then_def = library.register(then_d)?;
    let else_def = library.register(else_d)?;

    let new_name = graph.unique_name(&old_name);
    let op = Op::If {
        then_branch: then_def.name.clone(),
        else_branch: else_def.name.clone(),
        mode,
    };
    let new_id = graph.add_node(new_name, op, &inputs, &ctrl_inputs, &then_types)?;

    // redirect every existing consumer to the new construct, then discard
    // the old one; pre-exposure references must keep working without the
    // old node ever being mutated
    for i in 0..n_orig {
        let old_v = graph.value(if_node, i as u32);
        let new_v = graph.value(new_id, i as u32);
        graph.replace_uses(old_v, new_v);
    }
    graph.replace_ctrl_uses(if_node, new_id);
    graph.remove_node(if_node)?;

    let outputs = (0..then_types.len())
        .map(|i| graph.value(new_id, i as u32))
        .collect();
    Ok(ExposedCond {
        node: new_id,
        outputs,
        then_def,
        else_def,
        exposed_then,
        exposed_else,
    })
}

/// Adds each needed value as an output of `real`, with a mirror appended to
/// `sibling` for every genuinely new output.
fn expose_side(
    real: &mut FuncDef,
    sibling: &mut FuncDef,
    needed: &[ValueRef],
    map: &mut FxHashMap<ValueRef, usize>,
    policy: &MirrorPolicy,
) -> Result<(), BuildError> {
    for v in needed {
        if map.contains_key(v) {
            continue;
        }
        let dv = real.body.value(v.node, v.index);
        let sig = real.body.value_type(dv).cloned().ok_or_else(|| {
            BuildError::Internal("requested intermediate missing from branch body".into())
        })?;
        if let Some(i) = real.outputs.iter().position(|o| *o == dv) {
            map.insert(*v, i);
            continue;
        }
        let idx = real.outputs.len();
        real.outputs.push(dv);
        map.insert(*v, idx);

        let mirror = policy.source.emit(&mut sibling.body, &sig)?;
        sibling.outputs.push(mirror);
        sibling.mirror_outputs.push(idx);
    }
    Ok(())
}
