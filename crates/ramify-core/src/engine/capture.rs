//! Branch capture: turning a closure-style branch procedure into an
//! explicit-input function definition.
//!
//! The procedure runs inside a fresh frame pushed on the context's scope
//! stack. Every external value it reads is captured as a placeholder input
//! (first-use order, deduplicated by identity), and anything it creates via
//! [`GraphCtx::escape_to_root`] lands in the enclosing graph instead of the
//! isolated body. If the procedure fails, the frame is discarded and the
//! enclosing graph is left exactly as it was.

use ramify_ir::{FuncDef, FuncInput, TypeSig, ValueRef};

use crate::engine::errors::BuildError;
use crate::engine::scope::GraphCtx;

/// The result of capturing one branch procedure: an unregistered definition
/// draft plus the external values its inputs bind to.
#[derive(Debug)]
pub struct CapturedBranch {
    /// Definition draft; not yet registered in the library.
    pub def: FuncDef,
    /// External values in first-use order, aligned with `def.inputs`.
    pub ext_inputs: Vec<ValueRef>,
    /// Declared output types, in order.
    pub out_types: Vec<TypeSig>,
}

/// Captures `f` as a function definition named `name`.
pub fn capture_branch<F>(
    ctx: &mut GraphCtx,
    name: String,
    f: F,
) -> Result<CapturedBranch, BuildError>
where
    F: FnOnce(&mut GraphCtx) -> Result<Vec<ValueRef>, BuildError>,
{
    ctx.push_frame();
    let result = f(ctx).and_then(|outs| {
        // a branch may return an enclosing value unchanged; importing here
        // turns it into a captured input
        outs.into_iter()
            .map(|v| ctx.import(v))
            .collect::<Result<Vec<_>, _>>()
    });
    let frame = ctx.pop_frame();
    let outputs = result?;

    let mut inputs = Vec::with_capacity(frame.captures.len());
    let mut ext_inputs = Vec::with_capacity(frame.captures.len());
    for c in &frame.captures {
        let pname = frame
            .graph
            .node(c.placeholder)
            .map(|n| n.name.clone())
            .ok_or_else(|| BuildError::Internal("capture placeholder vanished".into()))?;
        inputs.push(FuncInput {
            name: pname,
            sig: c.sig.clone(),
            placeholder: c.placeholder,
        });
        ext_inputs.push(c.outer);
    }
    let out_types = outputs
        .iter()
        .map(|v| {
            frame
                .graph
                .value_type(*v)
                .cloned()
                .ok_or_else(|| BuildError::Internal("branch output missing from body".into()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let def = FuncDef {
        name,
        inputs,
        body: frame.graph,
        outputs,
        mirror_outputs: Vec::new(),
    };
    Ok(CapturedBranch { def, ext_inputs, out_types })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramify_ir::{DType, Literal};

    #[test]
    fn capture_records_externals_as_inputs() {
        let mut ctx = GraphCtx::new();
        let x = ctx.constant(Literal::F64(3.0)).unwrap();
        let branch = capture_branch(&mut ctx, "b".into(), |c| {
            let one = c.constant(Literal::F64(1.0))?;
            Ok(vec![c.add(x, one)?])
        })
        .unwrap();
        assert_eq!(branch.ext_inputs, vec![x]);
        assert_eq!(branch.def.inputs.len(), 1);
        assert_eq!(branch.out_types, vec![TypeSig::scalar(DType::F64)]);
        branch.def.validate().unwrap();
    }

    #[test]
    fn returning_an_external_value_captures_it() {
        let mut ctx = GraphCtx::new();
        let x = ctx.constant(Literal::F64(3.0)).unwrap();
        let branch = capture_branch(&mut ctx, "b".into(), |_| Ok(vec![x])).unwrap();
        assert_eq!(branch.ext_inputs, vec![x]);
        assert_eq!(branch.def.outputs[0].node, branch.def.inputs[0].placeholder);
    }

    #[test]
    fn failed_capture_leaves_enclosing_graph_untouched() {
        let mut ctx = GraphCtx::new();
        let before = ctx.graph().len();
        let err = capture_branch(&mut ctx, "b".into(), |c| {
            c.constant(Literal::F64(1.0))?;
            Err(BuildError::Internal("boom".into()))
        });
        assert!(err.is_err());
        assert!(!ctx.in_branch());
        assert_eq!(ctx.graph().len(), before);
    }

    #[test]
    fn capture_with_no_externals_has_empty_inputs() {
        let mut ctx = GraphCtx::new();
        let branch = capture_branch(&mut ctx, "b".into(), |c| {
            Ok(vec![c.constant(Literal::I64(7))?])
        })
        .unwrap();
        assert!(branch.ext_inputs.is_empty());
        assert!(branch.def.inputs.is_empty());
    }
}
