//! Result and error types for code generation.

use thiserror::Error;

/// A convenient alias for a `Result` that uses `CodegenError` as the error.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// An error produced while generating code.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// A semantic error surfaced from the front end; aborts compilation.
    #[error("compile error: {message}")]
    Semantic {
        /// Diagnostic text.
        message: String,
        /// Source line, when the failing instruction carried one.
        line: Option<u32>,
    },

    /// A recoverable per-function failure: the function's partial output is
    /// discarded and code generation resumes at the next `FunctionDecl`.
    #[error("codegen failed in `{function}`: {message}")]
    PerFunction {
        /// Function being lowered.
        function: String,
        /// What went wrong.
        message: String,
    },

    /// An invariant the back end relies on was violated; indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),

    /// A construct the back end does not support.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Some functions were discarded by per-function recovery. The object
    /// file was still written, minus the failing functions.
    #[error("{failed} function(s) failed to compile")]
    PartialFailure {
        /// Number of discarded functions.
        failed: u32,
    },

    /// Object-file writing failed; always fatal.
    #[error("object write error")]
    Object(#[from] anyhow::Error),
}

impl CodegenError {
    /// Shorthand for a per-function error.
    pub fn in_function(function: impl Into<String>, message: impl Into<String>) -> Self {
        CodegenError::PerFunction {
            function: function.into(),
            message: message.into(),
        }
    }

    /// True when the driver should discard the current function and keep
    /// going rather than abort the translation unit.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CodegenError::PerFunction { .. } | CodegenError::Unsupported(_)
        )
    }
}
