//! KRM function execution seam for rpkg.
//!
//! The core decides *what* to run (function identity, resolved config,
//! selected resources); a `FunctionRunner` decides *how*. This crate defines
//! that trait, the typed `ExecutionError`, a builtin runner for the common
//! metadata-mutating functions, and a recording mock for tests.

pub mod builtin;
pub mod mock;
pub mod runner;

pub use builtin::BuiltinRunner;
pub use mock::MockRunner;
pub use runner::{run_with_timeout, select_runner, FunctionRequest, FunctionResponse, FunctionRunner};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionCause {
    #[error("exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("sandbox fault: {0}")]
    Sandbox(String),
}

/// A function evaluation failure, carrying the function and selector that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("function '{function}' (match {selector}) failed: {cause}")]
pub struct ExecutionError {
    pub function: String,
    pub selector: String,
    #[source]
    pub cause: ExecutionCause,
}

impl ExecutionError {
    pub fn new(request: &FunctionRequest, cause: ExecutionCause) -> Self {
        Self {
            function: request.function.clone(),
            selector: request.selector.to_string(),
            cause,
        }
    }
}
