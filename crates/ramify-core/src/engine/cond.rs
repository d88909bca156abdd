//! The conditional builder.
//!
//! Combines a predicate and two branch procedures into a single functional
//! `If` node. Both branches are captured, their output signatures must agree
//! exactly, and their external-input lists are merged into one ordered union
//! shared by both definitions: inputs one side never reads are padded in as
//! unused placeholders. Input and output order are first-use order, so two
//! builds of the same program produce identical constructs.

use ramify_ir::{DType, ExecMode, Op, TypeSig, ValueRef};

use crate::engine::capture::{capture_branch, CapturedBranch};
use crate::engine::errors::BuildError;
use crate::engine::scope::GraphCtx;

/// Options for building one conditional construct.
#[derive(Debug, Clone, Copy)]
pub struct CondOptions {
    /// Execution mode stamped on the construct. The default is `Lowered`:
    /// the primitive encoding remains the default consumer, and functional
    /// or bridge execution is opted into per construct.
    pub mode: ExecMode,
}

impl Default for CondOptions {
    fn default() -> Self {
        CondOptions { mode: ExecMode::Lowered }
    }
}

/// Builds a conditional construct with default options. Returns the
/// construct's output values in the current frame.
pub fn cond<T, E>(
    ctx: &mut GraphCtx,
    pred: ValueRef,
    then_f: T,
    else_f: E,
) -> Result<Vec<ValueRef>, BuildError>
where
    T: FnOnce(&mut GraphCtx) -> Result<Vec<ValueRef>, BuildError>,
    E: FnOnce(&mut GraphCtx) -> Result<Vec<ValueRef>, BuildError>,
{
    cond_with(ctx, CondOptions::default(), pred, then_f, else_f)
}

/// Builds a conditional construct.
///
/// Active control-dependency scopes become direct predecessors of the
/// construct as a whole; they are not threaded into the branch bodies.
pub fn cond_with<T, E>(
    ctx: &mut GraphCtx,
    opts: CondOptions,
    pred: ValueRef,
    then_f: T,
    else_f: E,
) -> Result<Vec<ValueRef>, BuildError>
where
    T: FnOnce(&mut GraphCtx) -> Result<Vec<ValueRef>, BuildError>,
    E: FnOnce(&mut GraphCtx) -> Result<Vec<ValueRef>, BuildError>,
{
    let psig = ctx
        .value_type(pred)
        .ok_or_else(|| BuildError::TypeMismatch("predicate from unknown graph".into()))?;
    if psig != TypeSig::scalar(DType::Bool) {
        return Err(BuildError::TypeMismatch(format!(
            "predicate must be a bool scalar, got {psig}"
        )));
    }

    let then_name = ctx.library().unique_name("cond_true");
    let mut then_b = capture_branch(ctx, then_name, then_f)?;
    let else_name = ctx.library().unique_name("cond_false");
    let mut else_b = capture_branch(ctx, else_name, else_f)?;

    if then_b.out_types != else_b.out_types {
        return Err(BuildError::Capture {
            then_arity: then_b.out_types.len(),
            else_arity: else_b.out_types.len(),
            then_types: join_types(&then_b.out_types),
            else_types: join_types(&else_b.out_types),
        });
    }

    // ordered union: then-branch first-use order, then else-only extras
    let mut union = then_b.ext_inputs.clone();
    for v in &else_b.ext_inputs {
        if !union.contains(v) {
            union.push(*v);
        }
    }
    let sigs = union_sigs(&union, &then_b, &else_b)?;
    pad_inputs(&mut then_b, &union, &sigs)?;
    pad_inputs(&mut else_b, &union, &sigs)?;

    let out_types = then_b.out_types.clone();
    let then_name = then_b.def.name.clone();
    let else_name = else_b.def.name.clone();
    {
        let lib = ctx.library_mut();
        lib.register(then_b.def)?;
        lib.register(else_b.def)?;
    }

    let mut if_inputs = Vec::with_capacity(1 + union.len());
    if_inputs.push(pred);
    if_inputs.extend(union.iter().copied());
    let op = Op::If {
        then_branch: then_name,
        else_branch: else_name,
        mode: opts.mode,
    };
    let id = ctx.add_op("cond", op, &if_inputs, &out_types)?;
    Ok((0..out_types.len())
        .map(|i| ctx.graph().value(id, i as u32))
        .collect())
}

fn join_types(types: &[TypeSig]) -> String {
    types
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn union_sigs(
    union: &[ValueRef],
    then_b: &CapturedBranch,
    else_b: &CapturedBranch,
) -> Result<Vec<TypeSig>, BuildError> {
    union
        .iter()
        .map(|v| {
            then_b
                .ext_inputs
                .iter()
                .position(|e| e == v)
                .map(|i| then_b.def.inputs[i].sig.clone())
                .or_else(|| {
                    else_b
                        .ext_inputs
                        .iter()
                        .position(|e| e == v)
                        .map(|i| else_b.def.inputs[i].sig.clone())
                })
                .ok_or_else(|| {
                    BuildError::Internal("union input missing from both branches".into())
                })
        })
        .collect()
}

/// Rebuilds a branch's input list in union order, padding externals this
/// branch never read with unused placeholders.
fn pad_inputs(
    branch: &mut CapturedBranch,
    union: &[ValueRef],
    sigs: &[TypeSig],
) -> Result<(), BuildError> {
    let mut inputs = Vec::with_capacity(union.len());
    for (v, sig) in union.iter().zip(sigs) {
        match branch.ext_inputs.iter().position(|e| e == v) {
            Some(i) => inputs.push(branch.def.inputs[i].clone()),
            None => {
                let name = branch.def.body.unique_name("unused_capture");
                let ph = branch.def.body.add_node(
                    name.clone(),
                    Op::Placeholder,
                    &[],
                    &[],
                    std::slice::from_ref(sig),
                )?;
                inputs.push(ramify_ir::FuncInput {
                    name,
                    sig: sig.clone(),
                    placeholder: ph,
                });
            }
        }
    }
    branch.def.inputs = inputs;
    branch.ext_inputs = union.to_vec();
    Ok(())
}
