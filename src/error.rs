//! Error types for rlm-engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using rlm-engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error buckets carried on node and execution records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Program referenced a forbidden name, used disallowed syntax, or
    /// attempted a blocked capability.
    SandboxViolation,
    /// Program raised an error during execution (bad index, division by
    /// zero, type mismatch).
    ProgramRuntime,
    /// LM call failed after retries.
    Provider,
    /// `llm_query` called past the configured depth cap.
    RecursionLimit,
    /// Wall-clock deadline expired.
    DeadlineExceeded,
    /// Input exceeded the configured context limit.
    ContextTooLarge,
    /// Root program completed without calling FINAL.
    NoFinal,
    /// Repository/storage failure.
    Storage,
    /// Anything else.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SandboxViolation => "sandbox_violation",
            Self::ProgramRuntime => "program_runtime",
            Self::Provider => "provider",
            Self::RecursionLimit => "recursion_limit",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ContextTooLarge => "context_too_large",
            Self::NoFinal => "no_final",
            Self::Storage => "storage",
            Self::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur while orchestrating an execution.
#[derive(Error, Debug)]
pub enum Error {
    /// Sandbox allow-list rejected the program.
    #[error("sandbox violation: {message}")]
    SandboxViolation { message: String },

    /// Generated program failed at runtime.
    #[error("program runtime error: {0}")]
    ProgramRuntime(String),

    /// Provider API error.
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: String,
        message: String,
        retryable: bool,
    },

    /// Depth cap reached.
    #[error("maximum recursion depth {max_depth} exceeded")]
    RecursionLimit { max_depth: u32 },

    /// Wall-clock deadline expired.
    #[error("execution deadline exceeded")]
    DeadlineExceeded,

    /// Context rejected at entry.
    #[error("context of {size} characters exceeds the limit of {limit}")]
    ContextTooLarge { size: usize, limit: usize },

    /// Program never called FINAL.
    #[error("program terminated without FINAL")]
    NoFinal,

    /// Repository failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a sandbox violation naming the offending construct.
    pub fn sandbox_violation(message: impl Into<String>) -> Self {
        Self::SandboxViolation {
            message: message.into(),
        }
    }

    /// Create a sandbox violation for an unbound or forbidden name.
    pub fn forbidden_name(name: impl AsRef<str>) -> Self {
        Self::SandboxViolation {
            message: format!("reference to forbidden name '{}'", name.as_ref()),
        }
    }

    /// Create a program runtime error.
    pub fn program_runtime(message: impl Into<String>) -> Self {
        Self::ProgramRuntime(message.into())
    }

    /// Create a provider error.
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Create a max-depth error.
    pub fn recursion_limit(max_depth: u32) -> Self {
        Self::RecursionLimit { max_depth }
    }

    /// Whether a retry inside the same node may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. })
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SandboxViolation { .. } => ErrorKind::SandboxViolation,
            Self::ProgramRuntime(_) => ErrorKind::ProgramRuntime,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::RecursionLimit { .. } => ErrorKind::RecursionLimit,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::ContextTooLarge { .. } => ErrorKind::ContextTooLarge,
            Self::NoFinal => ErrorKind::NoFinal,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Serialization(_) | Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_final_message() {
        let err = Error::NoFinal;
        assert!(err.to_string().contains("terminated without FINAL"));
        assert_eq!(err.kind(), ErrorKind::NoFinal);
    }

    #[test]
    fn test_forbidden_name_mentions_offender() {
        let err = Error::forbidden_name("os");
        assert!(err.to_string().contains("'os'"));
        assert_eq!(err.kind(), ErrorKind::SandboxViolation);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::provider("openai", "503", true).is_retryable());
        assert!(!Error::provider("openai", "bad request", false).is_retryable());
        assert!(!Error::DeadlineExceeded.is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DeadlineExceeded).unwrap();
        assert_eq!(json, "\"deadline_exceeded\"");
    }
}
