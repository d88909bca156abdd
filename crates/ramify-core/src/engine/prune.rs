//! Dead-code pruning.
//!
//! Keeps only the subgraph reachable backwards (through data and control
//! edges) from a requested set of values. After lowering, this is what
//! erases unused mirror outputs and any work feeding only unrequested
//! outputs.

use rustc_hash::FxHashSet;

use ramify_ir::{Graph, NodeId, ValueRef};

use crate::engine::errors::BuildError;

/// Removes every node not needed to produce `keep`. Returns the number of
/// removed nodes.
pub fn prune(graph: &mut Graph, keep: &[ValueRef]) -> Result<usize, BuildError> {
    for v in keep {
        if v.graph != graph.id() {
            return Err(BuildError::Internal(
                "requested value does not belong to this graph".into(),
            ));
        }
    }
    let mut needed: FxHashSet<NodeId> = FxHashSet::default();
    let mut stack: Vec<NodeId> = keep.iter().map(|v| v.node).collect();
    while let Some(id) = stack.pop() {
        if !needed.insert(id) {
            continue;
        }
        let node = graph.require(id)?;
        for v in &node.inputs {
            stack.push(v.node);
        }
        for c in &node.ctrl_inputs {
            stack.push(*c);
        }
    }
    let order = graph.topo_order()?;
    let mut removed = 0;
    // reverse topological order: consumers go before their producers, so
    // every removal is of a node nothing still references
    for id in order.into_iter().rev() {
        if !needed.contains(&id) {
            graph.remove_node(id)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scope::GraphCtx;
    use ramify_ir::Literal;

    #[test]
    fn unreachable_chain_is_removed() {
        let mut ctx = GraphCtx::new();
        let a = ctx.constant(Literal::F64(1.0)).unwrap();
        let b = ctx.constant(Literal::F64(2.0)).unwrap();
        let kept = ctx.add(a, a).unwrap();
        let dead = ctx.mul(b, b).unwrap();
        let _dead2 = ctx.neg(dead).unwrap();
        let (mut graph, _) = ctx.finish();
        let removed = prune(&mut graph, &[kept]).unwrap();
        assert_eq!(removed, 3);
        assert!(graph.node(kept.node).is_some());
        assert!(graph.node(dead.node).is_none());
        graph.validate().unwrap();
    }

    #[test]
    fn control_predecessors_are_kept() {
        let mut ctx = GraphCtx::new();
        let gate = ctx.constant(Literal::F64(0.0)).unwrap();
        let kept = ctx
            .with_control_dependencies(&[gate], |c| c.constant(Literal::F64(1.0)))
            .unwrap();
        let (mut graph, _) = ctx.finish();
        let removed = prune(&mut graph, &[kept]).unwrap();
        assert_eq!(removed, 0);
        assert!(graph.node(gate.node).is_some());
    }

    #[test]
    fn foreign_request_is_rejected() {
        let mut ctx = GraphCtx::new();
        let v = ctx.constant(Literal::F64(1.0)).unwrap();
        let mut other = ramify_ir::Graph::new();
        let err = prune(&mut other, &[v]);
        assert!(matches!(err, Err(BuildError::Internal(_))));
        let (mut graph, _) = ctx.finish();
        assert!(prune(&mut graph, &[v]).is_ok());
    }
}
