//! Structural validation of conditional constructs.
//!
//! These checks guard internal invariants: they run after transformation
//! passes and before functional dispatch. A failure here is a defect in a
//! pass, not a user error.

use ramify_ir::{DType, FuncLibrary, Graph, Node, Op, TypeSig};

use crate::engine::errors::BuildError;

/// Mirror output positions of the construct at `node`, with the branch that
/// declares each. Empty for non-conditional nodes.
pub(crate) fn mirror_indexes(
    library: &FuncLibrary,
    node: &Node,
) -> Result<Vec<(usize, String)>, BuildError> {
    let Op::If { then_branch, else_branch, .. } = &node.op else {
        return Ok(Vec::new());
    };
    let mut out: Vec<(usize, String)> = Vec::new();
    for name in [then_branch, else_branch] {
        let entry = library
            .get(name)
            .ok_or_else(|| BuildError::UnknownFunction(name.clone()))?;
        for &m in entry.mirror_outputs() {
            if !out.iter().any(|(i, _)| *i == m) {
                out.push((m, name.clone()));
            }
        }
    }
    out.sort_by_key(|(i, _)| *i);
    Ok(out)
}

/// Checks every conditional construct in the graph: both definitions exist,
/// their output type lists are element-wise identical, and the node's
/// declared signature matches the definitions'.
pub fn verify_cond_invariants(graph: &Graph, library: &FuncLibrary) -> Result<(), BuildError> {
    for node in graph.nodes() {
        let Op::If { then_branch, else_branch, .. } = &node.op else {
            continue;
        };
        let t = library
            .get(then_branch)
            .ok_or_else(|| BuildError::UnknownFunction(then_branch.clone()))?;
        let e = library
            .get(else_branch)
            .ok_or_else(|| BuildError::UnknownFunction(else_branch.clone()))?;

        let tt = t.output_types();
        let et = e.output_types();
        if tt.len() != et.len() {
            return Err(BuildError::ArityInvariant {
                construct: node.name.clone(),
                then_arity: tt.len(),
                else_arity: et.len(),
            });
        }
        if tt != et {
            return Err(BuildError::TypeMismatch(format!(
                "conditional `{}` branch output types disagree",
                node.name
            )));
        }
        if node.out_types.as_slice() != tt.as_slice() {
            return Err(BuildError::TypeMismatch(format!(
                "conditional `{}` declares outputs that disagree with its branches",
                node.name
            )));
        }

        let ti = t.input_types();
        let ei = e.input_types();
        if ti != ei {
            return Err(BuildError::TypeMismatch(format!(
                "conditional `{}` branch input types disagree",
                node.name
            )));
        }
        if node.inputs.len() != ti.len() + 1 {
            return Err(BuildError::TypeMismatch(format!(
                "conditional `{}` binds {} inputs, branches expect {}",
                node.name,
                node.inputs.len().saturating_sub(1),
                ti.len()
            )));
        }
        let pred_sig = graph.value_type(node.inputs[0]).cloned();
        if pred_sig != Some(TypeSig::scalar(DType::Bool)) {
            return Err(BuildError::TypeMismatch(format!(
                "conditional `{}` predicate is not a bool scalar",
                node.name
            )));
        }
        for (k, v) in node.inputs.iter().skip(1).enumerate() {
            if graph.value_type(*v) != Some(&ti[k]) {
                return Err(BuildError::TypeMismatch(format!(
                    "conditional `{}` input {k} has the wrong type",
                    node.name
                )));
            }
        }
    }
    Ok(())
}

/// Scans every consumer edge of every mirror output. The edge set must be
/// empty or point only at placeholder sinks: inputs of sibling constructs
/// that one branch never reads.
pub fn verify_mirror_isolation(graph: &Graph, library: &FuncLibrary) -> Result<(), BuildError> {
    for node in graph.nodes() {
        for (m, function) in mirror_indexes(library, node)? {
            let v = graph.value(node.id, m as u32);
            for (consumer, pos) in graph.consumers(v) {
                if !mirror_read_is_benign(graph, library, consumer, pos)? {
                    return Err(BuildError::MirrorOutputConsumed {
                        function: function.clone(),
                        output: m,
                    });
                }
            }
        }
    }
    Ok(())
}

/// A mirror value may flow into another conditional construct as long as at
/// least one branch ignores the bound input entirely; the pair built by the
/// gradient constructor reads such an input only on the side where the
/// value is real. Anything else is a real read of the placeholder.
fn mirror_read_is_benign(
    graph: &Graph,
    library: &FuncLibrary,
    consumer: ramify_ir::NodeId,
    pos: usize,
) -> Result<bool, BuildError> {
    let cnode = graph.require(consumer)?;
    let Op::If { then_branch, else_branch, .. } = &cnode.op else {
        return Ok(false);
    };
    if pos == 0 {
        // used as a predicate
        return Ok(false);
    }
    let k = pos - 1;
    for name in [then_branch, else_branch] {
        let entry = library
            .get(name)
            .ok_or_else(|| BuildError::UnknownFunction(name.clone()))?;
        if let ramify_ir::FuncEntry::Editable(def) = entry {
            if let Some(input) = def.inputs.get(k) {
                let ph = def.body.value(input.placeholder, 0);
                if def.body.consumers(ph).is_empty() {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cond::cond;
    use crate::engine::expose::{expose_cond, if_parts};
    use crate::engine::scope::GraphCtx;
    use ramify_ir::{Literal, NodeId, ValueRef};

    fn fixture() -> (Graph, FuncLibrary, NodeId) {
        let mut ctx = GraphCtx::new();
        let x = ctx.constant(Literal::F64(2.0)).unwrap();
        let p = ctx.constant(Literal::Bool(true)).unwrap();
        let outs = cond(
            &mut ctx,
            p,
            |c| {
                let sq = c.mul(x, x)?;
                Ok(vec![c.add(sq, x)?])
            },
            |c| Ok(vec![c.constant(Literal::F64(0.0))?]),
        )
        .unwrap();
        let (graph, library) = ctx.finish();
        (graph, library, outs[0].node)
    }

    #[test]
    fn well_formed_construct_passes() {
        let (graph, library, _) = fixture();
        verify_cond_invariants(&graph, &library).unwrap();
        verify_mirror_isolation(&graph, &library).unwrap();
    }

    #[test]
    fn exposure_result_still_satisfies_invariants() {
        let (mut graph, mut library, if_node) = fixture();
        let (then_name, _, _) = if_parts(&graph, if_node).unwrap();
        let def = library.editable(&then_name).unwrap();
        let mul = def.body.get("mul").unwrap();
        let v = def.body.value(mul, 0);
        expose_cond(&mut graph, &mut library, if_node, &[v], &[]).unwrap();
        verify_cond_invariants(&graph, &library).unwrap();
        verify_mirror_isolation(&graph, &library).unwrap();
    }

    #[test]
    fn arity_violation_is_detected() {
        let (mut graph, mut library, if_node) = fixture();
        // register a same-name-shaped pair with mismatched arity and point
        // a fresh construct at it
        let (then_name, _, _) = if_parts(&graph, if_node).unwrap();
        let def = library.editable(&then_name).unwrap();
        let mut broken = (*def).fork("broken".into());
        let extra = broken.outputs[0];
        broken.outputs.push(extra);
        library.register(broken).unwrap();

        let pred = graph
            .nodes()
            .find(|n| matches!(n.op, Op::Const(Literal::Bool(_))))
            .map(|n| graph.value(n.id, 0))
            .unwrap();
        let (_, else_name, mode) = if_parts(&graph, if_node).unwrap();
        let x = graph.get("const").map(|id| graph.value(id, 0)).unwrap();
        let sig = graph.value_type(graph.value(if_node, 0)).cloned().unwrap();
        graph
            .add_node(
                "bad_cond",
                Op::If { then_branch: "broken".into(), else_branch: else_name, mode },
                &[pred, x],
                &[],
                std::slice::from_ref(&sig),
            )
            .unwrap();
        let err = verify_cond_invariants(&graph, &library);
        assert!(matches!(err, Err(BuildError::ArityInvariant { .. })));
    }

    #[test]
    fn consumed_mirror_is_detected() {
        let (mut graph, mut library, if_node) = fixture();
        let (then_name, _, _) = if_parts(&graph, if_node).unwrap();
        let def = library.editable(&then_name).unwrap();
        let mul = def.body.get("mul").unwrap();
        let v = def.body.value(mul, 0);
        let exposed = expose_cond(&mut graph, &mut library, if_node, &[v], &[]).unwrap();
        // wire real computation to the mirror position
        let mirror_v: ValueRef = exposed.outputs[1];
        let sig = graph.value_type(mirror_v).cloned().unwrap();
        graph
            .add_node("illegal", Op::Neg, &[mirror_v], &[], std::slice::from_ref(&sig))
            .unwrap();
        let err = verify_mirror_isolation(&graph, &library);
        assert!(matches!(
            err,
            Err(BuildError::MirrorOutputConsumed { output: 1, .. })
        ));
    }

    #[test]
    fn non_conditional_nodes_have_no_mirror_indexes() {
        let (graph, library, _) = fixture();
        let n = graph.nodes().find(|n| !n.op.is_if()).unwrap();
        assert!(mirror_indexes(&library, n).unwrap().is_empty());
    }
}
