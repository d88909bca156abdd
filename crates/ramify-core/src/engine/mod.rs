//! The conditional-construct engine.
//!
//! This module provides:
//! - **errors**: error types for building and execution
//! - **scope**: the graph-construction context and scope stack
//! - **capture**: branch procedure capture
//! - **cond**: the conditional builder
//! - **expose**: the intermediate exposure pass
//! - **grad**: gradient construction
//! - **lower** / **prune**: lowering to primitive routing and dead-code
//!   pruning
//! - **exec**: the reference interpreter and dispatch runtime
//! - **validate**: structural invariant checks

pub mod capture;
pub mod cond;
pub mod errors;
pub mod exec;
pub mod expose;
pub mod grad;
pub mod lower;
pub mod prune;
pub mod scope;
pub mod validate;
