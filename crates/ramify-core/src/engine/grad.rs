//! The gradient constructor.
//!
//! The gradient of a conditional construct is another conditional construct
//! over the same predicate, whose branch definitions are the gradients of
//! the corresponding forward branches. Construction proceeds in three
//! steps:
//!
//! 1. both forward branch definitions are resolved to editable form,
//!    reconstructing serialized-only bodies where a path exists and failing
//!    with [`BuildError::UngradableBranch`] where none does;
//! 2. a VJP analysis over each body determines which internal forward
//!    values the backward replay will read, and the intermediate exposure
//!    pass rebuilds the forward construct so those values surface as
//!    outputs (nested conditionals inside a body are prepared recursively
//!    on the under-construction working copy, which is permitted because
//!    that copy has never been registered or executed);
//! 3. the gradient construct is built through the ordinary conditional
//!    builder: each gradient branch procedure replays the forward body's
//!    VJPs in reverse topological order, reading exposed intermediates and
//!    incoming output-gradients as plain external references, so capture
//!    aligns the two gradient signatures automatically.
//!
//! Each gradient branch returns one gradient per forward external input;
//! inputs with no gradient path yield zeros. Because the result is an
//! ordinary construct built from differentiable ops, gradients of gradients
//! need no extra machinery.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use ramify_ir::{FuncDef, FuncLibrary, Graph, NodeId, Op, TypeSig, ValueRef};

use crate::engine::cond::{cond_with, CondOptions};
use crate::engine::errors::BuildError;
use crate::engine::expose::{editable_branch, expose_with, if_parts, ExposedCond, MirrorPolicy};
use crate::engine::scope::GraphCtx;

/// The result of differentiating a conditional construct.
#[derive(Debug)]
pub struct CondGrad {
    /// One gradient per external input of the forward construct, aligned
    /// with its non-predicate inputs.
    pub input_grads: Vec<ValueRef>,
    /// The rebuilt forward construct. Exposure replaces the original node,
    /// so callers holding values of the old node must re-derive them here.
    pub forward_node: NodeId,
    pub forward_outputs: Vec<ValueRef>,
}

/// Everything needed to replay one definition's VJPs.
#[derive(Debug)]
struct GradSpec {
    def: Arc<FuncDef>,
    /// Forward body values, keyed as collected by analysis, mapped to
    /// output positions of the rebuilt construct.
    exposed: FxHashMap<ValueRef, usize>,
    /// Nested conditional constructs in the body, keyed by node id.
    nested: FxHashMap<NodeId, NestedGradSpec>,
}

#[derive(Debug)]
struct NestedGradSpec {
    then_spec: GradSpec,
    else_spec: GradSpec,
}

/// A branch definition prepared for differentiation.
struct PreparedBranch {
    /// Working copy; nested conditionals inside have been exposed.
    draft: FuncDef,
    /// Body values the backward replay reads, in body order.
    needed: Vec<ValueRef>,
    nested: FxHashMap<NodeId, NestedGradSpec>,
}

/// Values visible to a gradient branch, bound per forward construct: the
/// construct's external inputs and (where exposed) its outputs.
struct EnvBind {
    ext: Vec<ValueRef>,
    outs: Vec<Option<ValueRef>>,
}

/// Builds the gradient of the conditional construct at `if_node` in the
/// current frame. `out_grads` supplies one optional gradient per construct
/// output.
pub fn grad_cond(
    ctx: &mut GraphCtx,
    if_node: NodeId,
    out_grads: &[Option<ValueRef>],
) -> Result<CondGrad, BuildError> {
    let (then_name, else_name, mode) = if_parts(ctx.graph(), if_node)?;
    let n_old = ctx.graph().require(if_node)?.out_arity();
    if out_grads.len() != n_old {
        return Err(BuildError::Internal(format!(
            "expected {n_old} output gradients, got {}",
            out_grads.len()
        )));
    }
    reject_mirror_grads(ctx.library(), &then_name, out_grads)?;
    reject_mirror_grads(ctx.library(), &else_name, out_grads)?;

    let then_editable = editable_branch(ctx.library_mut(), &then_name)?;
    let else_editable = editable_branch(ctx.library_mut(), &else_name)?;
    let p_then = prepare_branch(ctx.library_mut(), &then_editable)?;
    let p_else = prepare_branch(ctx.library_mut(), &else_editable)?;

    let PreparedBranch { draft: t_draft, needed: t_needed, nested: t_nested } = p_then;
    let PreparedBranch { draft: e_draft, needed: e_needed, nested: e_nested } = p_else;

    let exposed = {
        let (graph, library) = ctx.top_graph_and_library_mut();
        expose_with(
            graph,
            library,
            if_node,
            t_draft,
            e_draft,
            &t_needed,
            &e_needed,
            &MirrorPolicy::default(),
        )?
    };
    let ExposedCond {
        node: forward_node,
        outputs: forward_outputs,
        then_def,
        else_def,
        exposed_then,
        exposed_else,
    } = exposed;

    let then_spec = GradSpec { def: then_def, exposed: exposed_then, nested: t_nested };
    let else_spec = GradSpec { def: else_def, exposed: exposed_else, nested: e_nested };

    let fwd_inputs: Vec<ValueRef> =
        ctx.graph().require(forward_node)?.inputs.iter().copied().collect();
    let pred = fwd_inputs[0];
    let bind = EnvBind {
        ext: fwd_inputs[1..].to_vec(),
        outs: forward_outputs.iter().copied().map(Some).collect(),
    };
    let mut seed: Vec<Option<ValueRef>> = out_grads.to_vec();
    seed.resize(forward_outputs.len(), None);
    let in_sigs = then_spec.def.input_types();

    let input_grads = cond_with(
        ctx,
        CondOptions { mode },
        pred,
        |c| {
            let gs = emit_backward(c, &then_spec, &bind, &seed)?;
            fill_unconnected(c, gs, &in_sigs)
        },
        |c| {
            let gs = emit_backward(c, &else_spec, &bind, &seed)?;
            fill_unconnected(c, gs, &in_sigs)
        },
    )?;

    Ok(CondGrad { input_grads, forward_node, forward_outputs })
}

/// A gradient aimed at a mirror output means something is consuming the
/// placeholder value; fail loudly rather than differentiate it.
fn reject_mirror_grads(
    library: &FuncLibrary,
    branch: &str,
    out_grads: &[Option<ValueRef>],
) -> Result<(), BuildError> {
    let entry = library
        .get(branch)
        .ok_or_else(|| BuildError::UnknownFunction(branch.to_string()))?;
    for &m in entry.mirror_outputs() {
        if out_grads.get(m).map_or(false, |g| g.is_some()) {
            return Err(BuildError::MirrorOutputConsumed {
                function: branch.to_string(),
                output: m,
            });
        }
    }
    Ok(())
}

/// Forks `def` and prepares it for differentiation: nested conditionals are
/// recursively exposed inside the fork, then the fork is analyzed for the
/// forward values its backward replay will read.
fn prepare_branch(
    library: &mut FuncLibrary,
    def: &FuncDef,
) -> Result<PreparedBranch, BuildError> {
    let mut draft = def.fork(library.unique_name(&def.name));
    let mut nested = FxHashMap::default();

    let if_nodes: Vec<NodeId> = draft
        .body
        .nodes()
        .filter(|n| n.op.is_if())
        .map(|n| n.id)
        .collect();
    for id in if_nodes {
        let (tn, en, _) = if_parts(&draft.body, id)?;
        let t_def = editable_branch(library, &tn)?;
        let e_def = editable_branch(library, &en)?;
        let p_t = prepare_branch(library, &t_def)?;
        let p_e = prepare_branch(library, &e_def)?;
        let exposed = expose_with(
            &mut draft.body,
            library,
            id,
            p_t.draft,
            p_e.draft,
            &p_t.needed,
            &p_e.needed,
            &MirrorPolicy::default(),
        )?;
        // the draft's own outputs may point at the replaced node
        for out in &mut draft.outputs {
            if out.node == id {
                out.node = exposed.node;
            }
        }
        nested.insert(
            exposed.node,
            NestedGradSpec {
                then_spec: GradSpec {
                    def: exposed.then_def,
                    exposed: exposed.exposed_then,
                    nested: p_t.nested,
                },
                else_spec: GradSpec {
                    def: exposed.else_def,
                    exposed: exposed.exposed_else,
                    nested: p_e.nested,
                },
            },
        );
    }

    let needed = analyze_needed(&draft, &nested)?;
    Ok(PreparedBranch { draft, needed, nested })
}

/// Collects the forward body values the VJP replay reads, in deterministic
/// body order. Values bound to inputs are excluded: the gradient branch
/// reaches them through the construct's own input bindings.
fn analyze_needed(
    draft: &FuncDef,
    nested: &FxHashMap<NodeId, NestedGradSpec>,
) -> Result<Vec<ValueRef>, BuildError> {
    let body = &draft.body;
    let mut on_path: FxHashSet<NodeId> = FxHashSet::default();
    let mut stack: Vec<NodeId> = draft
        .outputs
        .iter()
        .enumerate()
        .filter(|(i, _)| !draft.is_mirror(*i))
        .map(|(_, v)| v.node)
        .collect();
    while let Some(id) = stack.pop() {
        if !on_path.insert(id) {
            continue;
        }
        let node = body.require(id)?;
        match &node.op {
            Op::Const(_) | Op::Var(_) | Op::Placeholder | Op::Zeros | Op::Greater
            | Op::NoOp => {}
            // gradients flow into the externals, never through the predicate
            Op::If { .. } => {
                for v in node.inputs.iter().skip(1) {
                    stack.push(v.node);
                }
            }
            _ => {
                for v in &node.inputs {
                    stack.push(v.node);
                }
            }
        }
    }

    fn push(
        body: &Graph,
        v: ValueRef,
        needed: &mut Vec<ValueRef>,
        seen: &mut FxHashSet<ValueRef>,
    ) {
        if let Some(n) = body.node(v.node) {
            if matches!(n.op, Op::Placeholder) {
                return;
            }
        }
        if seen.insert(v) {
            needed.push(v);
        }
    }

    let mut needed = Vec::new();
    let mut seen = FxHashSet::default();
    for node in body.nodes() {
        if !on_path.contains(&node.id) {
            continue;
        }
        match &node.op {
            Op::Mul => {
                push(body, node.inputs[0], &mut needed, &mut seen);
                push(body, node.inputs[1], &mut needed, &mut seen);
            }
            Op::Square => push(body, node.inputs[0], &mut needed, &mut seen),
            // exp's derivative is its own forward output
            Op::Exp => push(body, body.value(node.id, 0), &mut needed, &mut seen),
            Op::If { .. } => {
                let spec = nested.get(&node.id).ok_or_else(|| {
                    BuildError::Internal("nested conditional not prepared".into())
                })?;
                push(body, node.inputs[0], &mut needed, &mut seen);
                for v in node.inputs.iter().skip(1) {
                    push(body, *v, &mut needed, &mut seen);
                }
                let mut idxs: Vec<usize> = spec
                    .then_spec
                    .exposed
                    .values()
                    .chain(spec.else_spec.exposed.values())
                    .copied()
                    .collect();
                idxs.sort_unstable();
                idxs.dedup();
                for i in idxs {
                    push(body, body.value(node.id, i as u32), &mut needed, &mut seen);
                }
            }
            _ => {}
        }
    }
    Ok(needed)
}

/// Looks a forward body value up in the gradient frame's environment.
fn env_lookup(spec: &GradSpec, bind: &EnvBind, v: ValueRef) -> Option<ValueRef> {
    if let Some(node) = spec.def.body.node(v.node) {
        if matches!(node.op, Op::Placeholder) && v.index == 0 {
            if let Some(i) = spec.def.input_index_of(v.node) {
                return bind.ext.get(i).copied();
            }
        }
    }
    if let Some(&idx) = spec.exposed.get(&v) {
        return bind.outs.get(idx).and_then(|o| *o);
    }
    if let Some(i) = spec.def.outputs.iter().position(|o| *o == v) {
        return bind.outs.get(i).and_then(|o| *o);
    }
    None
}

fn env_required(
    spec: &GradSpec,
    bind: &EnvBind,
    v: ValueRef,
) -> Result<ValueRef, BuildError> {
    env_lookup(spec, bind, v).ok_or_else(|| {
        BuildError::Internal("forward value not exposed to gradient computation".into())
    })
}

fn accumulate(
    ctx: &mut GraphCtx,
    map: &mut FxHashMap<ValueRef, ValueRef>,
    key: ValueRef,
    g: ValueRef,
) -> Result<(), BuildError> {
    match map.get(&key).copied() {
        Some(prev) => {
            let sum = ctx.add(prev, g)?;
            map.insert(key, sum);
        }
        None => {
            map.insert(key, g);
        }
    }
    Ok(())
}

fn fill_unconnected(
    ctx: &mut GraphCtx,
    gs: Vec<Option<ValueRef>>,
    sigs: &[TypeSig],
) -> Result<Vec<ValueRef>, BuildError> {
    gs.into_iter()
        .zip(sigs)
        .map(|(g, sig)| match g {
            Some(v) => Ok(v),
            None => ctx.zeros(sig.clone()),
        })
        .collect()
}

/// Replays `spec`'s body VJPs in reverse topological order, emitting ops
/// into the current (gradient branch) frame. Returns one optional gradient
/// per definition input.
fn emit_backward(
    ctx: &mut GraphCtx,
    spec: &GradSpec,
    bind: &EnvBind,
    out_grads: &[Option<ValueRef>],
) -> Result<Vec<Option<ValueRef>>, BuildError> {
    let body = &spec.def.body;
    let mut grad_map: FxHashMap<ValueRef, ValueRef> = FxHashMap::default();
    for (i, og) in out_grads.iter().enumerate() {
        if let Some(g) = og {
            if spec.def.is_mirror(i) {
                return Err(BuildError::MirrorOutputConsumed {
                    function: spec.def.name.clone(),
                    output: i,
                });
            }
            accumulate(ctx, &mut grad_map, spec.def.outputs[i], *g)?;
        }
    }

    let order = body.topo_order()?;
    for id in order.into_iter().rev() {
        let node = body.require(id)?;
        let gs: Vec<Option<ValueRef>> = (0..node.out_arity())
            .map(|i| grad_map.get(&body.value(id, i as u32)).copied())
            .collect();
        if gs.iter().all(|g| g.is_none()) {
            continue;
        }
        match &node.op {
            Op::Add => {
                let g = single_grad(&gs)?;
                accumulate(ctx, &mut grad_map, node.inputs[0], g)?;
                accumulate(ctx, &mut grad_map, node.inputs[1], g)?;
            }
            Op::Sub => {
                let g = single_grad(&gs)?;
                accumulate(ctx, &mut grad_map, node.inputs[0], g)?;
                let ng = ctx.neg(g)?;
                accumulate(ctx, &mut grad_map, node.inputs[1], ng)?;
            }
            Op::Neg => {
                let g = single_grad(&gs)?;
                let ng = ctx.neg(g)?;
                accumulate(ctx, &mut grad_map, node.inputs[0], ng)?;
            }
            Op::Mul => {
                let g = single_grad(&gs)?;
                let x = env_required(spec, bind, node.inputs[0])?;
                let y = env_required(spec, bind, node.inputs[1])?;
                let gx = ctx.mul(g, y)?;
                accumulate(ctx, &mut grad_map, node.inputs[0], gx)?;
                let gy = ctx.mul(g, x)?;
                accumulate(ctx, &mut grad_map, node.inputs[1], gy)?;
            }
            Op::Square => {
                let g = single_grad(&gs)?;
                let x = env_required(spec, bind, node.inputs[0])?;
                // d(x^2) = g * (x + x), shape-correct without a constant
                let xx = ctx.add(x, x)?;
                let gx = ctx.mul(g, xx)?;
                accumulate(ctx, &mut grad_map, node.inputs[0], gx)?;
            }
            Op::Exp => {
                let g = single_grad(&gs)?;
                let y = env_required(spec, bind, body.value(id, 0))?;
                let gx = ctx.mul(g, y)?;
                accumulate(ctx, &mut grad_map, node.inputs[0], gx)?;
            }
            Op::Const(_) | Op::Var(_) | Op::Placeholder | Op::Zeros | Op::Greater
            | Op::NoOp => {}
            Op::Switch | Op::Merge => {
                return Err(BuildError::Internal(
                    "cannot differentiate primitive routing nodes; \
                     take gradients before lowering"
                        .into(),
                ))
            }
            Op::If { mode, .. } => {
                let nspec = spec.nested.get(&id).ok_or_else(|| {
                    BuildError::Internal("nested conditional not prepared".into())
                })?;
                let pred = env_required(spec, bind, node.inputs[0])?;
                let next: Vec<ValueRef> = node
                    .inputs
                    .iter()
                    .skip(1)
                    .map(|v| env_required(spec, bind, *v))
                    .collect::<Result<_, _>>()?;
                let nouts: Vec<Option<ValueRef>> = (0..node.out_arity())
                    .map(|j| env_lookup(spec, bind, body.value(id, j as u32)))
                    .collect();
                let nbind = EnvBind { ext: next, outs: nouts };
                let in_sigs = nspec.then_spec.def.input_types();
                let gouts = cond_with(
                    ctx,
                    CondOptions { mode: *mode },
                    pred,
                    |c| {
                        let inner = emit_backward(c, &nspec.then_spec, &nbind, &gs)?;
                        fill_unconnected(c, inner, &in_sigs)
                    },
                    |c| {
                        let inner = emit_backward(c, &nspec.else_spec, &nbind, &gs)?;
                        fill_unconnected(c, inner, &in_sigs)
                    },
                )?;
                for (k, gv) in gouts.iter().enumerate() {
                    accumulate(ctx, &mut grad_map, node.inputs[1 + k], *gv)?;
                }
            }
        }
    }

    Ok(spec
        .def
        .inputs
        .iter()
        .map(|i| grad_map.get(&body.value(i.placeholder, 0)).copied())
        .collect())
}

fn single_grad(gs: &[Option<ValueRef>]) -> Result<ValueRef, BuildError> {
    gs.first()
        .copied()
        .flatten()
        .ok_or_else(|| BuildError::Internal("missing output gradient".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cond::cond;
    use ramify_ir::{DType, ExecMode, Literal, OpaqueFunc, TypeSig};

    /// cond(p, x*x + 1, 0.0)
    fn square_fixture(ctx: &mut GraphCtx) -> (ValueRef, Vec<ValueRef>) {
        let x = ctx.constant(Literal::F64(3.0)).unwrap();
        let p = ctx.constant(Literal::Bool(true)).unwrap();
        let outs = cond(
            ctx,
            p,
            |c| {
                let sq = c.mul(x, x)?;
                let one = c.constant(Literal::F64(1.0))?;
                Ok(vec![c.add(sq, one)?])
            },
            |c| Ok(vec![c.constant(Literal::F64(0.0))?]),
        )
        .unwrap();
        (x, outs)
    }

    #[test]
    fn gradient_is_a_conditional_over_the_same_predicate() {
        let mut ctx = GraphCtx::new();
        let (_, outs) = square_fixture(&mut ctx);
        let g = ctx.constant(Literal::F64(1.0)).unwrap();
        let result = grad_cond(&mut ctx, outs[0].node, &[Some(g)]).unwrap();
        assert_eq!(result.input_grads.len(), 1);

        let (graph, library) = ctx.finish();
        let gnode = graph.node(result.input_grads[0].node).unwrap();
        let Op::If { then_branch, else_branch, .. } = &gnode.op else {
            panic!("gradient is not a conditional construct");
        };
        let fnode = graph.node(result.forward_node).unwrap();
        // same predicate as the (rebuilt) forward construct
        assert_eq!(gnode.inputs[0], fnode.inputs[0]);
        // matching-arity invariant holds for the gradient pair
        assert_eq!(
            library.get(then_branch).unwrap().output_types(),
            library.get(else_branch).unwrap().output_types()
        );
        graph.validate().unwrap();
    }

    #[test]
    fn forward_construct_is_rebuilt_not_mutated() {
        let mut ctx = GraphCtx::new();
        let (_, outs) = square_fixture(&mut ctx);
        let old_node = outs[0].node;
        let g = ctx.constant(Literal::F64(1.0)).unwrap();
        let result = grad_cond(&mut ctx, old_node, &[Some(g)]).unwrap();
        assert_ne!(result.forward_node, old_node);
        assert!(ctx.graph().node(old_node).is_none());
    }

    #[test]
    fn mirror_outputs_feed_only_placeholder_sinks() {
        let mut ctx = GraphCtx::new();
        // (x+1)*(x-1): the product's operands are internal, so exposure
        // must add outputs and mirrors
        let x = ctx.constant(Literal::F64(3.0)).unwrap();
        let p = ctx.constant(Literal::Bool(true)).unwrap();
        let outs = cond(
            &mut ctx,
            p,
            |c| {
                let one = c.constant(Literal::F64(1.0))?;
                let a = c.add(x, one)?;
                let b = c.sub(x, one)?;
                Ok(vec![c.mul(a, b)?])
            },
            |c| Ok(vec![c.constant(Literal::F64(0.0))?]),
        )
        .unwrap();
        let g = ctx.constant(Literal::F64(1.0)).unwrap();
        let result = grad_cond(&mut ctx, outs[0].node, &[Some(g)]).unwrap();
        let (graph, library) = ctx.finish();

        let node = graph.node(result.forward_node).unwrap();
        let Op::If { else_branch, .. } = &node.op else { panic!() };
        let mirrors = library.get(else_branch).unwrap().mirror_outputs().to_vec();
        assert!(!mirrors.is_empty(), "exposure should have added mirrors");
        // every consumer the gradient constructor added is another
        // conditional construct that ignores the value on the mirror side
        crate::engine::validate::verify_mirror_isolation(&graph, &library).unwrap();
        for &m in &mirrors {
            let mv = graph.value(result.forward_node, m as u32);
            for (consumer, _) in graph.consumers(mv) {
                assert!(graph.node(consumer).unwrap().op.is_if());
            }
        }
    }

    #[test]
    fn gradient_of_gradient_succeeds() {
        let mut ctx = GraphCtx::new();
        let (_, outs) = square_fixture(&mut ctx);
        let g = ctx.constant(Literal::F64(1.0)).unwrap();
        let first = grad_cond(&mut ctx, outs[0].node, &[Some(g)]).unwrap();
        let gg = ctx.constant(Literal::F64(1.0)).unwrap();
        let second =
            grad_cond(&mut ctx, first.input_grads[0].node, &[Some(gg)]).unwrap();
        // the first gradient construct reads the seed gradient and x, so the
        // second gradient yields one value per such input
        assert_eq!(second.input_grads.len(), 2);

        let (graph, library) = ctx.finish();
        let gnode = graph.node(second.input_grads[0].node).unwrap();
        let Op::If { then_branch, else_branch, .. } = &gnode.op else {
            panic!("second gradient is not a conditional construct");
        };
        assert_eq!(
            library.get(then_branch).unwrap().output_types(),
            library.get(else_branch).unwrap().output_types()
        );
        graph.validate().unwrap();
    }

    #[test]
    fn opaque_branch_without_body_is_ungradable() {
        let mut ctx = GraphCtx::new();
        let sig = TypeSig::scalar(DType::F64);
        for name in ["mystery_true", "mystery_false"] {
            ctx.library_mut()
                .register_opaque(OpaqueFunc {
                    name: name.into(),
                    input_types: vec![],
                    output_types: vec![sig.clone()],
                    mirror_outputs: vec![],
                    body_json: None,
                })
                .unwrap();
        }
        let p = ctx.constant(Literal::Bool(true)).unwrap();
        let id = ctx
            .add_op(
                "cond",
                Op::If {
                    then_branch: "mystery_true".into(),
                    else_branch: "mystery_false".into(),
                    mode: ExecMode::Functional,
                },
                &[p],
                std::slice::from_ref(&sig),
            )
            .unwrap();
        let g = ctx.constant(Literal::F64(1.0)).unwrap();
        let err = grad_cond(&mut ctx, id, &[Some(g)]);
        assert!(matches!(err, Err(BuildError::UngradableBranch { .. })));
    }

    #[test]
    fn wrong_grad_arity_is_rejected() {
        let mut ctx = GraphCtx::new();
        let (_, outs) = square_fixture(&mut ctx);
        let err = grad_cond(&mut ctx, outs[0].node, &[]);
        assert!(matches!(err, Err(BuildError::Internal(_))));
    }
}
