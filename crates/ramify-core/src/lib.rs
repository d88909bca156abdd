//! # Ramify Core
//!
//! Functional control-flow engine for dataflow graphs: capture closure-style
//! branch procedures into explicit function definitions, combine them into
//! single conditional constructs, differentiate those constructs, and
//! optionally lower them back to primitive `Switch`/`Merge` routing.

pub mod engine;

// Re-export commonly used types
pub use engine::capture::{capture_branch, CapturedBranch};
pub use engine::cond::{cond, cond_with, CondOptions};
pub use engine::errors::{BuildError, ExecError};
pub use engine::exec::{ExecOptions, ExecStats, RunResult, Runtime, Value};
pub use engine::expose::{expose_cond, expose_with, ExposedCond, MirrorPolicy, MirrorSource};
pub use engine::grad::{grad_cond, CondGrad};
pub use engine::lower::lower_graph;
pub use engine::prune::prune;
pub use engine::scope::GraphCtx;
pub use engine::validate::{verify_cond_invariants, verify_mirror_isolation};
