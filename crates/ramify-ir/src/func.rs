//! Function definitions and the function library.
//!
//! A [`FuncDef`] is the captured form of a branch procedure: an ordered list
//! of explicit typed inputs, a body graph, and an ordered list of outputs.
//! Definitions are immutable once registered in a [`FuncLibrary`];
//! transformation passes build new definitions under new names rather than
//! mutating registered ones, so executions already in flight keep seeing the
//! definition they started with.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::errors::IrError;
use crate::graph::{Graph, NodeId, Op, ValueRef};
use crate::types::TypeSig;

/// One explicit input of a function definition.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FuncInput {
    pub name: String,
    pub sig: TypeSig,
    /// The placeholder node in the body bound to this position.
    pub placeholder: NodeId,
}

/// An editable function definition.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FuncDef {
    pub name: String,
    /// Explicit inputs in positional order.
    pub inputs: Vec<FuncInput>,
    pub body: Graph,
    /// Output values in positional order, all referring into `body`.
    pub outputs: Vec<ValueRef>,
    /// Output positions that are mirrors: synthetic outputs added only to
    /// keep sibling signatures aligned, never meaningfully read.
    pub mirror_outputs: Vec<usize>,
}

impl FuncDef {
    /// Declared types of the outputs, in order.
    pub fn output_types(&self) -> Vec<TypeSig> {
        self.outputs
            .iter()
            .map(|v| {
                self.body
                    .value_type(*v)
                    .cloned()
                    .expect("validated output refers into body")
            })
            .collect()
    }

    /// Declared types of the inputs, in order.
    pub fn input_types(&self) -> Vec<TypeSig> {
        self.inputs.iter().map(|i| i.sig.clone()).collect()
    }

    pub fn is_mirror(&self, index: usize) -> bool {
        self.mirror_outputs.contains(&index)
    }

    pub fn num_real_outputs(&self) -> usize {
        self.outputs.len() - self.mirror_outputs.len()
    }

    /// Input position bound to placeholder node `id`, if any.
    pub fn input_index_of(&self, id: NodeId) -> Option<usize> {
        self.inputs.iter().position(|i| i.placeholder == id)
    }

    /// A deep copy under a new name and a fresh body graph id. Node ids are
    /// preserved, so positions recorded against the old body stay valid.
    pub fn fork(&self, name: String) -> FuncDef {
        let body = self.body.fork();
        let outputs = self
            .outputs
            .iter()
            .map(|v| body.value(v.node, v.index))
            .collect();
        FuncDef {
            name,
            inputs: self.inputs.clone(),
            body,
            outputs,
            mirror_outputs: self.mirror_outputs.clone(),
        }
    }

    /// Structural validation of the definition.
    pub fn validate(&self) -> Result<(), IrError> {
        let invalid = |reason: String| IrError::InvalidFunction {
            name: self.name.clone(),
            reason,
        };
        self.body.validate()?;
        for input in &self.inputs {
            match self.body.node(input.placeholder) {
                Some(n) if matches!(n.op, Op::Placeholder) => {}
                Some(n) => {
                    return Err(invalid(format!(
                        "input `{}` bound to non-placeholder node `{}`",
                        input.name, n.name
                    )))
                }
                None => {
                    return Err(invalid(format!(
                        "input `{}` bound to missing node",
                        input.name
                    )))
                }
            }
        }
        for (i, v) in self.outputs.iter().enumerate() {
            if self.body.value_type(*v).is_none() {
                return Err(invalid(format!("output {i} does not refer into the body")));
            }
        }
        let mut prev = None;
        for &m in &self.mirror_outputs {
            if m >= self.outputs.len() {
                return Err(invalid(format!("mirror index {m} out of range")));
            }
            if let Some(p) = prev {
                if m <= p {
                    return Err(invalid("mirror indexes not strictly increasing".into()));
                }
            }
            prev = Some(m);
        }
        Ok(())
    }
}

/// A definition known only by signature, e.g. one loaded from a saved module
/// whose body has not been (or cannot be) decoded.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpaqueFunc {
    pub name: String,
    pub input_types: Vec<TypeSig>,
    pub output_types: Vec<TypeSig>,
    pub mirror_outputs: Vec<usize>,
    /// Serialized body, if a reconstruction path exists.
    pub body_json: Option<String>,
}

/// A library entry: either an editable definition or an opaque one.
#[derive(Debug, Clone)]
pub enum FuncEntry {
    Editable(Arc<FuncDef>),
    Opaque(OpaqueFunc),
}

impl FuncEntry {
    pub fn name(&self) -> &str {
        match self {
            FuncEntry::Editable(def) => &def.name,
            FuncEntry::Opaque(f) => &f.name,
        }
    }

    pub fn input_types(&self) -> Vec<TypeSig> {
        match self {
            FuncEntry::Editable(def) => def.input_types(),
            FuncEntry::Opaque(f) => f.input_types.clone(),
        }
    }

    pub fn output_types(&self) -> Vec<TypeSig> {
        match self {
            FuncEntry::Editable(def) => def.output_types(),
            FuncEntry::Opaque(f) => f.output_types.clone(),
        }
    }

    pub fn mirror_outputs(&self) -> &[usize] {
        match self {
            FuncEntry::Editable(def) => &def.mirror_outputs,
            FuncEntry::Opaque(f) => &f.mirror_outputs,
        }
    }
}

/// Name-keyed registry of function definitions, shared by every construct
/// built in one context. Iteration follows registration order.
#[derive(Debug, Clone, Default)]
pub struct FuncLibrary {
    entries: FxHashMap<String, FuncEntry>,
    order: Vec<String>,
}

impl FuncLibrary {
    pub fn new() -> FuncLibrary {
        FuncLibrary::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Registers an editable definition. The name must be unused.
    pub fn register(&mut self, def: FuncDef) -> Result<Arc<FuncDef>, IrError> {
        def.validate()?;
        if self.entries.contains_key(&def.name) {
            return Err(IrError::DuplicateFunction(def.name));
        }
        let name = def.name.clone();
        let arc = Arc::new(def);
        self.entries.insert(name.clone(), FuncEntry::Editable(arc.clone()));
        self.order.push(name);
        Ok(arc)
    }

    /// Registers an opaque definition. The name must be unused.
    pub fn register_opaque(&mut self, func: OpaqueFunc) -> Result<(), IrError> {
        if self.entries.contains_key(&func.name) {
            return Err(IrError::DuplicateFunction(func.name));
        }
        let name = func.name.clone();
        self.entries.insert(name.clone(), FuncEntry::Opaque(func));
        self.order.push(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FuncEntry> {
        self.entries.get(name)
    }

    /// Entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &FuncEntry> {
        self.order.iter().map(|n| &self.entries[n])
    }

    /// A function name not yet registered: `stem`, then `stem_1`, ...
    pub fn unique_name(&self, stem: &str) -> String {
        if !self.entries.contains_key(stem) {
            return stem.to_string();
        }
        let mut i = 1u32;
        loop {
            let candidate = format!("{stem}_{i}");
            if !self.entries.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    /// Resolves a name to an editable definition, reconstructing opaque
    /// entries from their serialized body when one exists. Reconstruction
    /// replaces the entry in place so later lookups are cheap.
    pub fn editable(&mut self, name: &str) -> Result<Arc<FuncDef>, IrError> {
        match self.entries.get(name) {
            None => Err(IrError::UnknownFunction(name.to_string())),
            Some(FuncEntry::Editable(def)) => Ok(def.clone()),
            Some(FuncEntry::Opaque(f)) => {
                let decoded = Self::decode_body(f)?;
                let arc = Arc::new(decoded);
                self.entries
                    .insert(name.to_string(), FuncEntry::Editable(arc.clone()));
                Ok(arc)
            }
        }
    }

    #[cfg(feature = "serde")]
    fn decode_body(f: &OpaqueFunc) -> Result<FuncDef, IrError> {
        let json = f
            .body_json
            .as_deref()
            .ok_or_else(|| IrError::OpaqueFunction(f.name.clone()))?;
        let mut def: FuncDef = serde_json::from_str(json)
            .map_err(|_| IrError::OpaqueFunction(f.name.clone()))?;
        def.body = rebuilt(def.body);
        crate::graph::GraphId::ensure_above(def.body.id());
        def.validate()?;
        Ok(def)
    }

    #[cfg(not(feature = "serde"))]
    fn decode_body(f: &OpaqueFunc) -> Result<FuncDef, IrError> {
        Err(IrError::OpaqueFunction(f.name.clone()))
    }
}

/// Restores a deserialized graph's lookup indexes.
#[cfg(feature = "serde")]
pub(crate) fn rebuilt(mut g: Graph) -> Graph {
    g.rebuild_indexes();
    g
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Op;
    use crate::types::{DType, Literal};

    fn simple_def(name: &str) -> FuncDef {
        let mut body = Graph::new();
        let sig = TypeSig::scalar(DType::F64);
        let p = body
            .add_node("x", Op::Placeholder, &[], &[], std::slice::from_ref(&sig))
            .unwrap();
        let pv = body.value(p, 0);
        let n = body
            .add_node("neg", Op::Neg, &[pv], &[], std::slice::from_ref(&sig))
            .unwrap();
        let out = body.value(n, 0);
        FuncDef {
            name: name.to_string(),
            inputs: vec![FuncInput { name: "x".into(), sig, placeholder: p }],
            body,
            outputs: vec![out],
            mirror_outputs: vec![],
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut lib = FuncLibrary::new();
        lib.register(simple_def("f")).unwrap();
        assert!(lib.get("f").is_some());
        assert!(matches!(
            lib.register(simple_def("f")),
            Err(IrError::DuplicateFunction(_))
        ));
    }

    #[test]
    fn unique_name_skips_registered() {
        let mut lib = FuncLibrary::new();
        lib.register(simple_def("f")).unwrap();
        assert_eq!(lib.unique_name("f"), "f_1");
        assert_eq!(lib.unique_name("g"), "g");
    }

    #[test]
    fn editable_fails_for_bodyless_opaque() {
        let mut lib = FuncLibrary::new();
        lib.register_opaque(OpaqueFunc {
            name: "ghost".into(),
            input_types: vec![],
            output_types: vec![TypeSig::scalar(DType::F64)],
            mirror_outputs: vec![],
            body_json: None,
        })
        .unwrap();
        assert!(matches!(
            lib.editable("ghost"),
            Err(IrError::OpaqueFunction(_))
        ));
        assert!(matches!(
            lib.editable("missing"),
            Err(IrError::UnknownFunction(_))
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn editable_reconstructs_from_serialized_body() {
        let def = simple_def("f");
        let json = serde_json::to_string(&def).unwrap();
        let mut lib = FuncLibrary::new();
        lib.register_opaque(OpaqueFunc {
            name: "f".into(),
            input_types: def.input_types(),
            output_types: def.output_types(),
            mirror_outputs: vec![],
            body_json: Some(json),
        })
        .unwrap();
        let rebuilt = lib.editable("f").unwrap();
        assert_eq!(rebuilt.inputs.len(), 1);
        assert_eq!(rebuilt.output_types(), vec![TypeSig::scalar(DType::F64)]);
        // entry upgraded in place
        assert!(matches!(lib.get("f"), Some(FuncEntry::Editable(_))));
    }

    #[test]
    fn fork_renames_and_refreshes_graph_id() {
        let def = simple_def("f");
        let forked = def.fork("f_1".into());
        assert_eq!(forked.name, "f_1");
        assert_ne!(forked.body.id(), def.body.id());
        assert_eq!(forked.outputs[0].node, def.outputs[0].node);
        forked.validate().unwrap();
    }

    #[test]
    fn mirror_bookkeeping() {
        let mut def = simple_def("f");
        def.mirror_outputs = vec![0];
        assert!(def.is_mirror(0));
        assert_eq!(def.num_real_outputs(), 0);
    }

    #[test]
    fn validate_rejects_bad_mirror_index() {
        let mut def = simple_def("f");
        def.mirror_outputs = vec![7];
        assert!(matches!(
            def.validate(),
            Err(IrError::InvalidFunction { .. })
        ));
    }
}
