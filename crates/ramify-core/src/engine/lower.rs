//! Lowering functional conditionals to primitive routing.
//!
//! A construct whose execution mode requests lowering is rewritten into the
//! primitive `Switch`/`Merge` encoding: one router per external input, both
//! branch bodies inlined into the enclosing graph behind the routers, and
//! one join per output. The functional node disappears; consumers are
//! rewired to the joins. This restores node-level non-strict scheduling (a
//! node may start once its own predecessors are satisfied, with no
//! whole-branch barrier) and lets pruning drop untaken or unused work,
//! mirror outputs included.
//!
//! Constructs in `Functional` mode and constructs claimed by a compilation
//! bridge are left untouched.

use rustc_hash::FxHashMap;

use ramify_ir::{ExecMode, FuncDef, FuncLibrary, Graph, NodeId, Op, ValueRef};

use crate::engine::errors::BuildError;
use crate::engine::expose::if_parts;

/// Lowers every `Lowered`-mode construct in the graph, including constructs
/// revealed by inlining branch bodies. Returns how many were rewritten.
pub fn lower_graph(graph: &mut Graph, library: &mut FuncLibrary) -> Result<usize, BuildError> {
    let mut lowered = 0;
    loop {
        let target = graph.nodes().find_map(|n| match &n.op {
            Op::If { mode: ExecMode::Lowered, .. } => Some(n.id),
            _ => None,
        });
        let Some(id) = target else { break };
        lower_one(graph, library, id)?;
        lowered += 1;
    }
    Ok(lowered)
}

fn lower_one(
    graph: &mut Graph,
    library: &mut FuncLibrary,
    if_node: NodeId,
) -> Result<(), BuildError> {
    let (then_name, else_name, _) = if_parts(graph, if_node)?;
    let then_def = library.editable(&then_name)?;
    let else_def = library.editable(&else_name)?;

    let (node_name, pred, ext, ctrl, n_out) = {
        let node = graph.require(if_node)?;
        (
            node.name.clone(),
            node.inputs[0],
            node.inputs[1..].to_vec(),
            node.ctrl_inputs.to_vec(),
            node.out_arity(),
        )
    };

    // predicate router: each branch gets a pivot that is live only when
    // that branch is taken, so body nodes with no data inputs still stay
    // quiet on the untaken side
    let pred_sig = graph.value_type(pred).cloned().ok_or_else(|| {
        BuildError::Internal("predicate missing from enclosing graph".into())
    })?;
    let ps_name = graph.unique_name(&format!("{node_name}_switch_pred"));
    let pred_switch = graph.add_node(
        ps_name,
        Op::Switch,
        &[pred, pred],
        &ctrl,
        &[pred_sig.clone(), pred_sig],
    )?;
    let pivot_t_name = graph.unique_name(&format!("{node_name}_pivot_t"));
    let pivot_t =
        graph.add_node(pivot_t_name, Op::NoOp, &[graph.value(pred_switch, 1)], &[], &[])?;
    let pivot_f_name = graph.unique_name(&format!("{node_name}_pivot_f"));
    let pivot_f =
        graph.add_node(pivot_f_name, Op::NoOp, &[graph.value(pred_switch, 0)], &[], &[])?;

    // one router per external input; construct-level control deps transfer
    // to the routers
    let mut switches = Vec::with_capacity(ext.len());
    for v in &ext {
        let sig = graph.value_type(*v).cloned().ok_or_else(|| {
            BuildError::Internal("construct input missing from enclosing graph".into())
        })?;
        let name = graph.unique_name(&format!("{node_name}_switch"));
        let id = graph.add_node(name, Op::Switch, &[*v, pred], &ctrl, &[sig.clone(), sig])?;
        switches.push(id);
    }

    let then_map = inline_body(graph, &then_def, &switches, 1, pivot_t, &node_name)?;
    let else_map = inline_body(graph, &else_def, &switches, 0, pivot_f, &node_name)?;

    // one join per output
    let mut merges = Vec::with_capacity(n_out);
    for j in 0..n_out {
        let tv = mapped_output(&then_def, j, &then_map)?;
        let ev = mapped_output(&else_def, j, &else_map)?;
        let sig = graph.value_type(tv).cloned().ok_or_else(|| {
            BuildError::Internal("inlined output missing from enclosing graph".into())
        })?;
        let name = graph.unique_name(&format!("{node_name}_merge"));
        let id = graph.add_node(name, Op::Merge, &[tv, ev], &[], std::slice::from_ref(&sig))?;
        merges.push(id);
    }

    for (j, merge) in merges.iter().enumerate() {
        let old = graph.value(if_node, j as u32);
        let new = graph.value(*merge, 0);
        graph.replace_uses(old, new);
    }

    // control consumers of the construct now wait on every join
    if !graph.ctrl_consumers(if_node).is_empty() {
        let name = graph.unique_name(&format!("{node_name}_done"));
        let done = graph.add_node(name, Op::NoOp, &[], &merges, &[])?;
        graph.replace_ctrl_uses(if_node, done);
    }
    graph.remove_node(if_node)?;
    Ok(())
}

/// Copies a branch body into the enclosing graph, remapping placeholders to
/// the given switch port. Returns the body-value to host-value map.
fn inline_body(
    graph: &mut Graph,
    def: &FuncDef,
    switches: &[NodeId],
    port: u32,
    pivot: NodeId,
    stem: &str,
) -> Result<FxHashMap<ValueRef, ValueRef>, BuildError> {
    let mut value_map: FxHashMap<ValueRef, ValueRef> = FxHashMap::default();
    let mut node_map: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    for (k, input) in def.inputs.iter().enumerate() {
        value_map.insert(def.body.value(input.placeholder, 0), graph.value(switches[k], port));
        node_map.insert(input.placeholder, switches[k]);
    }
    for id in def.body.topo_order()? {
        let node = def.body.require(id)?;
        if matches!(node.op, Op::Placeholder) {
            continue;
        }
        let inputs: Vec<ValueRef> = node
            .inputs
            .iter()
            .map(|v| {
                value_map.get(v).copied().ok_or_else(|| {
                    BuildError::Internal("dangling value while inlining branch body".into())
                })
            })
            .collect::<Result<_, _>>()?;
        let mut nctrl: Vec<NodeId> = node
            .ctrl_inputs
            .iter()
            .map(|c| {
                node_map.get(c).copied().ok_or_else(|| {
                    BuildError::Internal("dangling control edge while inlining".into())
                })
            })
            .collect::<Result<_, _>>()?;
        // body nodes with no data inputs hang off the branch pivot; without
        // it they would fire on the untaken side too
        if node.inputs.is_empty() && node.ctrl_inputs.is_empty() {
            nctrl.push(pivot);
        }
        let name = graph.unique_name(&format!("{stem}/{}", node.name));
        let new_id = graph.add_node(name, node.op.clone(), &inputs, &nctrl, &node.out_types)?;
        node_map.insert(id, new_id);
        for i in 0..node.out_arity() {
            value_map.insert(def.body.value(id, i as u32), graph.value(new_id, i as u32));
        }
    }
    Ok(value_map)
}

fn mapped_output(
    def: &FuncDef,
    j: usize,
    value_map: &FxHashMap<ValueRef, ValueRef>,
) -> Result<ValueRef, BuildError> {
    value_map.get(&def.outputs[j]).copied().ok_or_else(|| {
        BuildError::Internal("branch output not materialized during inlining".into())
    })
}
