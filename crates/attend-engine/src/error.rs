//! Error types for attend-engine.

use attend_expr::ExprError;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while compiling, caching, loading or running a kernel.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// Failure inside the expression layer (tracing, differentiation,
    /// evaluation).
    #[error(transparent)]
    Expr(#[from] ExprError),

    /// A value of the wrong kind or shape reached the engine.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A custom tensor name was declared twice.
    #[error("duplicate declaration of custom tensor `{0}`")]
    DuplicateDeclaration(String),

    /// Shape metadata matches no kernel template.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// A kernel template rejected the traced program.
    #[error("lowering failed: {0}")]
    LoweringFailure(String),

    /// A cached kernel could not be loaded, even after regeneration.
    #[error("cache corruption for {digest}: {reason}")]
    CacheCorruption { digest: String, reason: String },

    /// Execution backend rejected the kernel or its arguments.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the error came from [`ExprError::UnsupportedGradient`].
    pub fn is_unsupported_gradient(&self) -> bool {
        matches!(self, EngineError::Expr(ExprError::UnsupportedGradient { .. }))
    }
}
