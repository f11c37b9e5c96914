//! Error types for attend-expr.

use thiserror::Error;

/// Result alias for graph construction, differentiation and evaluation.
pub type Result<T> = std::result::Result<T, ExprError>;

/// Errors raised while building, differentiating or evaluating a graph.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ExprError {
    /// An operand is not a value of the graph being built, or its kind or
    /// shape cannot take part in the requested operation.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Differentiation reached an operator with no adjoint rule.
    #[error("unsupported gradient: no adjoint rule for `{op}`")]
    UnsupportedGradient {
        /// Name of the offending operator.
        op: &'static str,
    },

    /// Evaluation met a variable with no binding.
    #[error("unbound variable `{0}`")]
    UnboundVariable(String),

    /// A symbolic value was created outside of an active trace.
    #[error("no active trace")]
    NoActiveTrace,
}
