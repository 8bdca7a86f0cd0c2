//! # rlm-engine
//!
//! A recursive code-execution orchestrator: a root language model answers a
//! query over a context too large for any single prompt by writing a small
//! program, and the runtime executes that program in a capability-restricted
//! sandbox whose `llm_query` primitive recurses back into the orchestrator.
//!
//! ## Core components
//!
//! - **Sandbox**: allow-list interpreter over a minimal scripting language
//! - **Agent loop**: one node's lifecycle from prompt to recorded outcome
//! - **Orchestrator**: entry point, depth cap, deadline, memory merge
//! - **Trace**: per-execution node tree plus the streaming event bus
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rlm_engine::{
//!     AnthropicClient, ClientConfig, ExecuteRequest, Orchestrator,
//! };
//!
//! let client = Arc::new(AnthropicClient::new(ClientConfig::new(api_key)));
//! let orchestrator = Orchestrator::builder().client(client).build()?;
//!
//! let execution = orchestrator
//!     .run(ExecuteRequest::new("summarize the incident timeline", context))
//!     .await?;
//! println!("{}", execution.final_result.unwrap_or_default());
//! ```

use std::collections::BTreeMap;

pub mod adapters;
pub mod agent;
pub mod config;
pub mod deadline;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod pricing;
pub mod sandbox;
pub mod store;
pub mod trace;

/// Session and node memory: a string-keyed JSON document, deep-copied at
/// every snapshot boundary.
pub type MemoryMap = BTreeMap<String, serde_json::Value>;

// Re-exports for convenience
pub use agent::{extract_program, root_prompt, system_prompt, ContextMetadata};
pub use config::EngineConfig;
pub use deadline::Deadline;
pub use error::{Error, ErrorKind, Result};
pub use llm::{
    AnthropicClient, ChatMessage, ChatRole, ClientConfig, CompletionRequest, CompletionResponse,
    LLMClient, OpenAIClient, Provider, TokenUsage,
};
pub use orchestrator::{ExecuteRequest, Orchestrator, OrchestratorBuilder};
pub use pricing::{ModelPricing, PricingTable};
pub use sandbox::{Outcome, SandboxRun};
pub use store::{
    ExecutionRepository, Session, SessionRepository, SqliteExecutionStore, SqliteSessionStore,
};
pub use trace::{
    EventBus, EventKind, Execution, ExecutionEvent, ExecutionNode, ExecutionStatus,
    ExecutionTrace, NodeStatus, NodeTree, NodeType,
};
