//! Error types for IR construction and validation.

use thiserror::Error;

/// Errors raised by graph and function-definition structural operations.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// without breaking changes.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum IrError {
    /// A node name was reused within one graph.
    #[error("duplicate node name `{0}` in graph")]
    DuplicateName(String),

    /// A node id was not found in the graph it was used against.
    #[error("unknown node id {0} in graph")]
    UnknownNode(u32),

    /// A value referenced an output port the producing node does not have.
    #[error("node `{node}` has no output port {port}")]
    PortOutOfRange { node: String, port: u32 },

    /// A node input referenced a value from a different graph.
    #[error("node `{node}` input {input} references a foreign graph")]
    ForeignInput { node: String, input: usize },

    /// Attempted to remove a node that still has consumers.
    #[error("node `{0}` still has consumers and cannot be removed")]
    NodeInUse(String),

    /// The graph contains a dataflow cycle.
    #[error("graph contains a cycle involving node `{0}`")]
    Cycle(String),

    /// A function name was registered twice.
    #[error("duplicate function name `{0}`")]
    DuplicateFunction(String),

    /// A function name was not found in the library.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    /// A function exists only in opaque form and its body cannot be
    /// reconstructed.
    #[error("function `{0}` has no reconstructable body")]
    OpaqueFunction(String),

    /// A function definition failed structural validation.
    #[error("invalid function `{name}`: {reason}")]
    InvalidFunction { name: String, reason: String },

    /// A serialized module could not be decoded.
    #[error("malformed module: {0}")]
    MalformedModule(String),
}
