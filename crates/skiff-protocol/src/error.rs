//! Error types shared across the workspace.

use thiserror::Error;

/// Failure decoding a wire record into an [`crate::Event`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEventError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has neither an `action` nor an `observation` tag")]
    MissingTag,
    #[error("record carries both an `action` and an `observation` tag")]
    AmbiguousTag,
    #[error("unknown {family} tag `{tag}`")]
    UnknownTag { family: &'static str, tag: String },
    #[error("bad arguments for `{tag}`: {reason}")]
    BadArgs { tag: String, reason: String },
    #[error("bad envelope field: {0}")]
    BadEnvelope(String),
}

/// Errors surfaced by kernel components and external ports.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] MalformedEventError),
    #[error("malformed action from agent: {0}")]
    MalformedAction(String),
    #[error("llm error: {0}")]
    Llm(String),
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict { expected: u64, actual: u64 },
}

impl KernelError {
    /// Errors the agent can recover from on its next step.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedEvent(_) | Self::MalformedAction(_) | Self::Llm(_)
        )
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for KernelError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Convenience result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
