//! Saved-module serialization.
//!
//! A [`SavedModule`] bundles one top-level graph with the function
//! definitions it references, in registration order. The JSON text form is
//! deterministic: node order is insertion order and function order is
//! registration order, so identical builds serialize identically and diffs
//! stay readable.

use crate::errors::IrError;
use crate::func::{rebuilt, FuncDef, FuncEntry, FuncLibrary};
use crate::graph::{Graph, GraphId};

/// A serializable bundle of a graph and its function library.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SavedModule {
    pub graph: Graph,
    /// Function definitions in registration order. Definitions are shared by
    /// name: a forward construct and its gradient construct reference the
    /// same entries.
    pub functions: Vec<FuncDef>,
}

impl SavedModule {
    /// Snapshots a graph and every editable definition in the library.
    pub fn new(graph: &Graph, library: &FuncLibrary) -> SavedModule {
        let functions = library
            .iter()
            .filter_map(|entry| match entry {
                FuncEntry::Editable(def) => Some((**def).clone()),
                FuncEntry::Opaque(_) => None,
            })
            .collect();
        SavedModule { graph: graph.clone(), functions }
    }

    pub fn to_json(&self) -> Result<String, IrError> {
        serde_json::to_string_pretty(self).map_err(|e| IrError::MalformedModule(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<SavedModule, IrError> {
        let mut module: SavedModule =
            serde_json::from_str(json).map_err(|e| IrError::MalformedModule(e.to_string()))?;
        module.graph = rebuilt(module.graph);
        GraphId::ensure_above(module.graph.id());
        module.graph.validate()?;
        module.functions = module
            .functions
            .into_iter()
            .map(|mut def| {
                def.body = rebuilt(def.body);
                GraphId::ensure_above(def.body.id());
                def.validate().map(|_| def)
            })
            .collect::<Result<_, _>>()?;
        Ok(module)
    }

    /// Splits the module into a graph and a freshly populated library.
    pub fn into_parts(self) -> Result<(Graph, FuncLibrary), IrError> {
        let mut library = FuncLibrary::new();
        for def in self.functions {
            library.register(def)?;
        }
        Ok((self.graph, library))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ExecMode, Op};
    use crate::types::{DType, Literal, TypeSig};

    fn module_with_cond() -> (Graph, FuncLibrary) {
        let sig = TypeSig::scalar(DType::F64);
        let mut library = FuncLibrary::new();
        for (name, value) in [("cond_true", 1.0), ("cond_false", 2.0)] {
            let mut body = Graph::new();
            let c = body
                .add_node("lit", Op::Const(Literal::F64(value)), &[], &[], std::slice::from_ref(&sig))
                .unwrap();
            let out = body.value(c, 0);
            library
                .register(FuncDef {
                    name: name.into(),
                    inputs: vec![],
                    body,
                    outputs: vec![out],
                    mirror_outputs: vec![],
                })
                .unwrap();
        }
        let mut graph = Graph::new();
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
        graph
            .add_node(
                "cond",
                Op::If {
                    then_branch: "cond_true".into(),
                    else_branch: "cond_false".into(),
                    mode: ExecMode::Lowered,
                },
                &[pv],
                &[],
                std::slice::from_ref(&sig),
            )
            .unwrap();
        (graph, library)
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let (graph, library) = module_with_cond();
        let module = SavedModule::new(&graph, &library);
        let json = module.to_json().unwrap();
        let loaded = SavedModule::from_json(&json).unwrap();
        assert_eq!(loaded.functions.len(), 2);
        assert_eq!(loaded.functions[0].name, "cond_true");
        assert_eq!(loaded.graph.len(), graph.len());
        let names: Vec<_> = loaded.graph.nodes().map(|n| n.name.clone()).collect();
        assert_eq!(names, vec!["pred", "cond"]);
    }

    #[test]
    fn round_trip_is_stable() {
        let (graph, library) = module_with_cond();
        let json = SavedModule::new(&graph, &library).to_json().unwrap();
        let reloaded = SavedModule::from_json(&json).unwrap();
        assert_eq!(reloaded.to_json().unwrap(), json);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(
            SavedModule::from_json("not json"),
            Err(IrError::MalformedModule(_))
        ));
    }

    #[test]
    fn into_parts_registers_functions() {
        let (graph, library) = module_with_cond();
        let json = SavedModule::new(&graph, &library).to_json().unwrap();
        let (g, lib) = SavedModule::from_json(&json).unwrap().into_parts().unwrap();
        assert_eq!(g.len(), 2);
        assert!(lib.get("cond_true").is_some());
        assert!(lib.get("cond_false").is_some());
    }
}
