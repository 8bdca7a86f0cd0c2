//! Engine configuration and limits.
//!
//! All limits can be provided through the environment; unset or malformed
//! values fall back to the defaults below with a warning.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default model used when the caller omits one.
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

/// Runtime limits and defaults for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executions with a larger context are rejected at entry (chars).
    pub max_context_size: usize,
    /// Advisory chunk size handed to the root LM in its system prompt (chars).
    pub default_chunk_size: usize,
    /// Cap enforced on every `llm_query`.
    pub max_recursion_depth: u32,
    /// Global wall-clock deadline per execution.
    pub execution_timeout: Duration,
    /// Per-call cap for a single LM request.
    pub llm_call_timeout: Duration,
    /// Per-node cap for one sandbox run.
    pub sandbox_timeout: Duration,
    /// Model used when the request does not name one.
    pub default_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_context_size: 500_000,
            default_chunk_size: 50_000,
            max_recursion_depth: 10,
            execution_timeout: Duration::from_secs(300),
            llm_call_timeout: Duration::from_secs(120),
            sandbox_timeout: Duration::from_secs(120),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_context_size: env_parse("MAX_CONTEXT_SIZE", defaults.max_context_size),
            default_chunk_size: env_parse("DEFAULT_CHUNK_SIZE", defaults.default_chunk_size),
            max_recursion_depth: env_parse("MAX_RECURSION_DEPTH", defaults.max_recursion_depth),
            execution_timeout: Duration::from_secs(env_parse(
                "EXECUTION_TIMEOUT",
                defaults.execution_timeout.as_secs(),
            )),
            llm_call_timeout: Duration::from_secs(env_parse(
                "LLM_CALL_TIMEOUT",
                defaults.llm_call_timeout.as_secs(),
            )),
            sandbox_timeout: Duration::from_secs(env_parse(
                "SANDBOX_TIMEOUT",
                defaults.sandbox_timeout.as_secs(),
            )),
            default_model: std::env::var("DEFAULT_MODEL").unwrap_or(defaults.default_model),
        }
    }

    pub fn with_max_context_size(mut self, chars: usize) -> Self {
        self.max_context_size = chars;
        self
    }

    pub fn with_default_chunk_size(mut self, chars: usize) -> Self {
        self.default_chunk_size = chars;
        self
    }

    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_llm_call_timeout(mut self, timeout: Duration) -> Self {
        self.llm_call_timeout = timeout;
        self
    }

    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout = timeout;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(%name, %raw, "ignoring unparsable environment value");
                default
            }
        },
        Err(_) => default,
    }
}
