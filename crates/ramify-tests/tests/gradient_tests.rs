//! Gradient construction scenarios: numeric correctness, intermediate
//! exposure, mirrors, and gradients of gradients.

use ramify_core::{
    cond, grad_cond, BuildError, ExecOptions, GraphCtx, Runtime, Value,
    verify_cond_invariants, verify_mirror_isolation,
};
use ramify_ir::{DType, Literal, Op, TypeSig};

/// cond(x > 0, x*x + 1, -x), differentiated with a unit seed.
fn build_square_grad() -> (ramify_ir::Graph, ramify_ir::FuncLibrary, ramify_ir::ValueRef) {
    let mut ctx = GraphCtx::new();
    let x = ctx.placeholder("x", TypeSig::scalar(DType::F64)).unwrap();
    let zero = ctx.constant(Literal::F64(0.0)).unwrap();
    let p = ctx.greater(x, zero).unwrap();
    let outs = cond(
        &mut ctx,
        p,
        |c| {
            let sq = c.mul(x, x)?;
            let one = c.constant(Literal::F64(1.0))?;
            Ok(vec![c.add(sq, one)?])
        },
        |c| Ok(vec![c.neg(x)?]),
    )
    .unwrap();
    let seed = ctx.constant(Literal::F64(1.0)).unwrap();
    let result = grad_cond(&mut ctx, outs[0].node, &[Some(seed)]).unwrap();
    // gradient with respect to x: x is the first external of the construct
    let fwd = ctx.graph().node(result.forward_node).unwrap();
    let pos = fwd.inputs[1..].iter().position(|v| *v == x).unwrap();
    let gx = result.input_grads[pos];
    let (graph, library) = ctx.finish();
    (graph, library, gx)
}

#[test]
fn branch_gradients_are_numerically_correct() {
    let (graph, library, gx) = build_square_grad();
    let mut rt = Runtime::new(library);
    // d/dx (x^2 + 1) = 2x
    let r = rt
        .run(&graph, &[("x", Value::F64(3.0))], &[gx], &ExecOptions::default())
        .unwrap();
    assert_eq!(r.values, vec![Value::F64(6.0)]);
    // d/dx (-x) = -1
    let r = rt
        .run(&graph, &[("x", Value::F64(-3.0))], &[gx], &ExecOptions::default())
        .unwrap();
    assert_eq!(r.values, vec![Value::F64(-1.0)]);
}

#[test]
fn exp_gradient_reuses_the_forward_output() {
    let mut ctx = GraphCtx::new();
    let x = ctx.placeholder("x", TypeSig::scalar(DType::F64)).unwrap();
    let zero = ctx.constant(Literal::F64(0.0)).unwrap();
    let p = ctx.greater(x, zero).unwrap();
    let outs = cond(
        &mut ctx,
        p,
        |c| Ok(vec![c.exp(x)?]),
        |c| Ok(vec![x]),
    )
    .unwrap();
    let seed = ctx.constant(Literal::F64(1.0)).unwrap();
    let result = grad_cond(&mut ctx, outs[0].node, &[Some(seed)]).unwrap();
    let fwd = ctx.graph().node(result.forward_node).unwrap();
    let pos = fwd.inputs[1..].iter().position(|v| *v == x).unwrap();
    let gx = result.input_grads[pos];
    let (graph, library) = ctx.finish();
    let mut rt = Runtime::new(library);
    let r = rt
        .run(&graph, &[("x", Value::F64(2.0))], &[gx], &ExecOptions::default())
        .unwrap();
    // d/dx exp(x) = exp(x), read back from the forward construct's output
    assert_eq!(r.values, vec![Value::F64((2.0f64).exp())]);
}

#[test]
fn exposure_rewires_existing_consumers_to_the_new_construct() {
    let mut ctx = GraphCtx::new();
    let x = ctx.placeholder("x", TypeSig::scalar(DType::F64)).unwrap();
    let zero = ctx.constant(Literal::F64(0.0)).unwrap();
    let p = ctx.greater(x, zero).unwrap();
    let outs = cond(
        &mut ctx,
        p,
        |c| {
            // v is internal and only the gradient will need it
            let v = c.mul(x, x)?;
            let one = c.constant(Literal::F64(1.0))?;
            Ok(vec![c.add(v, one)?])
        },
        |c| Ok(vec![c.neg(x)?]),
    )
    .unwrap();
    // a consumer that exists before differentiation
    let ten = ctx.constant(Literal::F64(10.0)).unwrap();
    let downstream = ctx.add(outs[0], ten).unwrap();
    let old_node = outs[0].node;

    let seed = ctx.constant(Literal::F64(1.0)).unwrap();
    let result = grad_cond(&mut ctx, old_node, &[Some(seed)]).unwrap();
    let (graph, library) = ctx.finish();

    // the old construct is gone and the consumer reads the new one
    assert!(graph.node(old_node).is_none());
    let dnode = graph.node(downstream.node).unwrap();
    assert_eq!(dnode.inputs[0], graph.value(result.forward_node, 0));

    // v surfaced as a then-output with a same-typed mirror in the else
    // definition
    let fnode = graph.node(result.forward_node).unwrap();
    let Op::If { then_branch, else_branch, .. } = &fnode.op else { panic!() };
    let t = library.get(then_branch).unwrap();
    let e = library.get(else_branch).unwrap();
    assert_eq!(t.output_types(), e.output_types());
    assert!(t.output_types().len() > 1);
    assert!(t.mirror_outputs().is_empty());
    assert!(!e.mirror_outputs().is_empty());

    // downstream still computes the same thing
    let mut rt = Runtime::new(library);
    let r = rt
        .run(
            &graph,
            &[("x", Value::F64(3.0))],
            &[downstream],
            &ExecOptions::default(),
        )
        .unwrap();
    assert_eq!(r.values, vec![Value::F64(20.0)]);
}

#[test]
fn mirror_outputs_have_no_consumers_after_gradient_construction() {
    let (graph, library, _) = build_square_grad();
    verify_cond_invariants(&graph, &library).unwrap();
    verify_mirror_isolation(&graph, &library).unwrap();
}

#[test]
fn gradient_of_gradient_is_numerically_correct() {
    let mut ctx = GraphCtx::new();
    let x = ctx.placeholder("x", TypeSig::scalar(DType::F64)).unwrap();
    let zero = ctx.constant(Literal::F64(0.0)).unwrap();
    let p = ctx.greater(x, zero).unwrap();
    let outs = cond(
        &mut ctx,
        p,
        |c| Ok(vec![c.square(x)?]),
        |c| Ok(vec![c.neg(x)?]),
    )
    .unwrap();
    let seed = ctx.constant(Literal::F64(1.0)).unwrap();
    let first = grad_cond(&mut ctx, outs[0].node, &[Some(seed)]).unwrap();

    let seed2 = ctx.constant(Literal::F64(1.0)).unwrap();
    let second =
        grad_cond(&mut ctx, first.input_grads[0].node, &[Some(seed2)]).unwrap();
    // locate the x slot among the rebuilt first-gradient construct's inputs
    let gnode = ctx.graph().node(second.forward_node).unwrap();
    let pos = gnode.inputs[1..].iter().position(|v| *v == x).unwrap();
    let gxx = second.input_grads[pos];

    let (graph, library) = ctx.finish();
    verify_cond_invariants(&graph, &library).unwrap();
    let mut rt = Runtime::new(library);
    // d²/dx² (x²) = 2
    let r = rt
        .run(&graph, &[("x", Value::F64(3.0))], &[gxx], &ExecOptions::default())
        .unwrap();
    assert_eq!(r.values, vec![Value::F64(2.0)]);
    // d²/dx² (-x) = 0
    let r = rt
        .run(&graph, &[("x", Value::F64(-3.0))], &[gxx], &ExecOptions::default())
        .unwrap();
    assert_eq!(r.values, vec![Value::F64(0.0)]);
}

#[test]
fn nested_conditional_gradients_flow_through_both_levels() {
    let mut ctx = GraphCtx::new();
    let x = ctx.placeholder("x", TypeSig::scalar(DType::F64)).unwrap();
    let zero = ctx.constant(Literal::F64(0.0)).unwrap();
    let ten = ctx.constant(Literal::F64(10.0)).unwrap();
    let p = ctx.greater(x, zero).unwrap();
    let q = ctx.greater(x, ten).unwrap();
    let outs = cond(
        &mut ctx,
        p,
        |c| {
            cond(
                c,
                q,
                |c2| Ok(vec![c2.square(x)?]),
                |c2| {
                    let one = c2.constant(Literal::F64(1.0))?;
                    Ok(vec![c2.mul(x, one)?])
                },
            )
        },
        |c| Ok(vec![c.neg(x)?]),
    )
    .unwrap();
    let seed = ctx.constant(Literal::F64(1.0)).unwrap();
    let result = grad_cond(&mut ctx, outs[0].node, &[Some(seed)]).unwrap();
    let fwd = ctx.graph().node(result.forward_node).unwrap();
    let pos = fwd.inputs[1..].iter().position(|v| *v == x).unwrap();
    let gx = result.input_grads[pos];
    let (graph, library) = ctx.finish();
    verify_cond_invariants(&graph, &library).unwrap();
    let mut rt = Runtime::new(library);
    // x = 20: outer then, inner then -> d/dx x^2 = 40
    let r = rt
        .run(&graph, &[("x", Value::F64(20.0))], &[gx], &ExecOptions::default())
        .unwrap();
    assert_eq!(r.values, vec![Value::F64(40.0)]);
    // x = 5: outer then, inner else -> d/dx (x * 1) = 1
    let r = rt
        .run(&graph, &[("x", Value::F64(5.0))], &[gx], &ExecOptions::default())
        .unwrap();
    assert_eq!(r.values, vec![Value::F64(1.0)]);
    // x = -5: outer else -> d/dx (-x) = -1
    let r = rt
        .run(&graph, &[("x", Value::F64(-5.0))], &[gx], &ExecOptions::default())
        .unwrap();
    assert_eq!(r.values, vec![Value::F64(-1.0)]);
}

#[test]
fn opaque_branch_without_reconstruction_path_is_ungradable() {
    // a graph as it would look straight after loading: a construct whose
    // branch definitions are known only by signature
    let sig = TypeSig::scalar(DType::F64);
    let mut library = ramify_ir::FuncLibrary::new();
    for name in ["loaded_true", "loaded_false"] {
        library
            .register_opaque(ramify_ir::OpaqueFunc {
                name: name.into(),
                input_types: vec![],
                output_types: vec![sig.clone()],
                mirror_outputs: vec![],
                body_json: None,
            })
            .unwrap();
    }
    let mut graph = ramify_ir::Graph::new();
    let p = graph
        .add_node(
            "pred",
            Op::Const(Literal::Bool(true)),
            &[],
            &[],
            &[TypeSig::scalar(DType::Bool)],
        )
        .unwrap();
    let pv = graph.value(p, 0);
    let id = graph
        .add_node(
            "loaded_cond",
            Op::If {
                then_branch: "loaded_true".into(),
                else_branch: "loaded_false".into(),
                mode: ramify_ir::ExecMode::Functional,
            },
            &[pv],
            &[],
            std::slice::from_ref(&sig),
        )
        .unwrap();

    let mut ctx = GraphCtx::from_parts(graph, library);
    let seed = ctx.constant(Literal::F64(1.0)).unwrap();
    let err = grad_cond(&mut ctx, id, &[Some(seed)]);
    assert!(matches!(err, Err(BuildError::UngradableBranch { .. })));
}
