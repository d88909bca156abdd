//! # Ramify IR
//!
//! Dataflow-graph intermediate representation for the ramify conditional
//! compiler: value typing, graphs, function definitions, and the saved-module
//! serialization format.

pub mod errors;
pub mod func;
pub mod graph;
#[cfg(feature = "serde")]
pub mod module;
pub mod types;

// Re-export commonly used types
pub use errors::IrError;
pub use func::{FuncDef, FuncEntry, FuncInput, FuncLibrary, OpaqueFunc};
pub use graph::{ExecMode, Graph, GraphId, Node, NodeId, Op, ValueRef};
#[cfg(feature = "serde")]
pub use module::SavedModule;
pub use types::{DType, Literal, Shape, TypeSig};
