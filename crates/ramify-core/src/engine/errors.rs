//! Error types for construct building and execution.

use thiserror::Error;

use ramify_ir::IrError;

/// Errors raised while building or transforming conditional constructs.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking changes.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BuildError {
    /// The two branch procedures disagree on output count or types.
    ///
    /// This is a hard precondition of the conditional builder, surfaced to
    /// its caller; it is not recoverable by retry.
    #[error(
        "branch signature mismatch: then branch returns {then_arity} output(s) [{then_types}], \
         else branch returns {else_arity} output(s) [{else_types}]"
    )]
    Capture {
        then_arity: usize,
        else_arity: usize,
        then_types: String,
        else_types: String,
    },

    /// A branch definition exists only in opaque form with no reconstruction
    /// path, so it cannot be differentiated.
    #[error("branch function `{name}` has no editable body available for differentiation")]
    UngradableBranch { name: String },

    /// A sibling definition pair was found with mismatched output arity
    /// after exposure.
    ///
    /// This indicates a defect in the intermediate exposure pass and is an
    /// unrecoverable internal invariant failure, not a user-facing
    /// condition.
    #[error(
        "conditional `{construct}` violates the matching-arity invariant: \
         then={then_arity} outputs, else={else_arity} outputs"
    )]
    ArityInvariant {
        construct: String,
        then_arity: usize,
        else_arity: usize,
    },

    /// A mirror output's placeholder value is consumed by real computation.
    ///
    /// Mirrors exist only to keep sibling signatures aligned; any real
    /// consumer is a design invariant violation and is fatal when detected.
    #[error("mirror output {output} of `{function}` is consumed by real computation")]
    MirrorOutputConsumed { function: String, output: usize },

    /// A construct referenced a function the library does not know.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    /// An operand had the wrong type or shape.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error(transparent)]
    Ir(#[from] IrError),

    /// An unexpected condition: a programmer error, not a user error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised by the reference interpreter.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Build(#[from] BuildError),

    /// A placeholder had no bound value at execution time.
    #[error("no value fed for placeholder `{0}`")]
    MissingFeed(String),

    /// A requested output resolved to a dead token (its producing branch was
    /// not taken).
    #[error("requested value from `{0}` is dead")]
    DeadValue(String),

    /// The interpreter does not implement the operation for the given
    /// operand types.
    #[error("unsupported operation: {0}")]
    UnsupportedOp(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<IrError> for ExecError {
    fn from(e: IrError) -> Self {
        ExecError::Build(BuildError::Ir(e))
    }
}
