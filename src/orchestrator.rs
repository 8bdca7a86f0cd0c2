//! Top-level orchestrator.
//!
//! `run` turns a `(query, context, session?)` request into one execution:
//! it validates the context, loads session memory, drives the root agent
//! loop under a global deadline, merges memory back, and persists the
//! records. Recursion is wired in the agent loop: every `llm_query` becomes
//! a nested node at `depth + 1`, gated by the depth cap and the deadline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::NodeRunner;
use crate::config::EngineConfig;
use crate::deadline::Deadline;
use crate::error::{Error, ErrorKind, Result};
use crate::llm::LLMClient;
use crate::pricing::PricingTable;
use crate::store::{ExecutionRepository, SessionRepository, SqliteSessionStore};
use crate::trace::{EventBus, Execution, ExecutionEvent, ExecutionTrace, NodeTree};
use crate::MemoryMap;

/// One execution request.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub query: String,
    pub context: String,
    pub session_id: Option<Uuid>,
    pub model: Option<String>,
}

impl ExecuteRequest {
    pub fn new(query: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context: context.into(),
            session_id: None,
            model: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

struct ActiveExecution {
    trace: Arc<ExecutionTrace>,
    deadline: Arc<Deadline>,
}

/// The orchestration runtime. Thread-safe; executions run concurrently
/// across callers.
pub struct Orchestrator {
    config: EngineConfig,
    client: Arc<dyn LLMClient>,
    pricing: Arc<PricingTable>,
    bus: Arc<EventBus>,
    executions: Arc<dyn ExecutionRepository>,
    sessions: Arc<dyn SessionRepository>,
    active: Mutex<HashMap<Uuid, ActiveExecution>>,
}

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<EngineConfig>,
    client: Option<Arc<dyn LLMClient>>,
    pricing: Option<PricingTable>,
    executions: Option<Arc<dyn ExecutionRepository>>,
    sessions: Option<Arc<dyn SessionRepository>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn client(mut self, client: Arc<dyn LLMClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn executions(mut self, executions: Arc<dyn ExecutionRepository>) -> Self {
        self.executions = Some(executions);
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionRepository>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Build the orchestrator. A client is required; missing stores default
    /// to a shared in-memory database.
    pub fn build(self) -> Result<Orchestrator> {
        let client = self
            .client
            .ok_or_else(|| Error::Config("an LLM client is required".to_string()))?;

        let (executions, sessions) = match (self.executions, self.sessions) {
            (Some(executions), Some(sessions)) => (executions, sessions),
            (executions, sessions) => {
                let store = Arc::new(SqliteSessionStore::in_memory()?);
                let executions = executions.unwrap_or_else(|| {
                    Arc::new(store.execution_store()) as Arc<dyn ExecutionRepository>
                });
                let sessions =
                    sessions.unwrap_or_else(|| store as Arc<dyn SessionRepository>);
                (executions, sessions)
            }
        };

        Ok(Orchestrator {
            config: self.config.unwrap_or_default(),
            client,
            pricing: Arc::new(self.pricing.unwrap_or_else(PricingTable::builtin)),
            bus: Arc::new(EventBus::new()),
            executions,
            sessions,
            active: Mutex::new(HashMap::new()),
        })
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<dyn SessionRepository> {
        &self.sessions
    }

    /// Run one execution to a terminal status.
    ///
    /// Returns the terminal execution record; `Err` is reserved for
    /// rejections at entry (oversized context, storage failures before the
    /// execution exists).
    pub async fn run(&self, request: ExecuteRequest) -> Result<Execution> {
        // Fall back to the session's stored context when the request has
        // none.
        let mut context = request.context;
        if context.is_empty() {
            if let Some(session_id) = request.session_id {
                if let Some(stored) = self.sessions.get_context(session_id)? {
                    context = stored;
                }
            }
        }

        let context_size = context.chars().count();
        if context_size > self.config.max_context_size {
            return Err(Error::ContextTooLarge {
                size: context_size,
                limit: self.config.max_context_size,
            });
        }

        let memory = match request.session_id {
            Some(session_id) => self.sessions.get_memory(session_id)?,
            None => MemoryMap::new(),
        };
        let model = request
            .model
            .unwrap_or_else(|| self.config.default_model.clone());

        let trace = Arc::new(ExecutionTrace::new(Execution::new(
            &request.query,
            context_size,
            request.session_id,
        )));
        let execution_id = trace.execution_id();
        self.executions.save_execution(&trace.execution())?;

        let deadline = Arc::new(Deadline::after(self.config.execution_timeout));
        self.active.lock().expect("active lock poisoned").insert(
            execution_id,
            ActiveExecution {
                trace: Arc::clone(&trace),
                deadline: Arc::clone(&deadline),
            },
        );

        trace.mark_running();
        self.bus.publish(ExecutionEvent::execution_started(
            execution_id,
            &request.query,
            context_size,
            &model,
        ));
        info!(%execution_id, context_size, %model, "execution started");

        let runner = NodeRunner {
            client: Arc::clone(&self.client),
            pricing: Arc::clone(&self.pricing),
            config: self.config.clone(),
            bus: Arc::clone(&self.bus),
            trace: Arc::clone(&trace),
            deadline: Arc::clone(&deadline),
            model: model.clone(),
        };

        let result = runner.run_root(&request.query, context, memory).await;

        match result {
            Ok((final_result, memory_after)) => {
                // Merge memory back under the session lock; persistence is
                // best-effort and never un-completes the execution.
                if let Some(session_id) = request.session_id {
                    if let Err(err) = self.sessions.merge_memory(session_id, &memory_after) {
                        warn!(%session_id, error = %err, "session memory merge failed");
                    }
                }
                trace.mark_completed(&final_result);
                let execution = trace.execution();
                self.bus.publish(ExecutionEvent::execution_completed(
                    execution_id,
                    &final_result,
                    execution.total_input_tokens,
                    execution.total_output_tokens,
                    execution.total_cost_usd,
                ));
                info!(%execution_id, "execution completed");
            }
            Err(err) => {
                let kind = err.kind();
                let message = err.to_string();
                trace.fail_unfinished(kind, &message);
                if deadline.was_cancelled() && kind == ErrorKind::DeadlineExceeded {
                    trace.mark_cancelled("execution cancelled");
                } else {
                    trace.mark_failed(kind, &message);
                }
                self.bus.publish(ExecutionEvent::execution_failed(
                    execution_id,
                    kind,
                    &message,
                ));
                warn!(%execution_id, %kind, %message, "execution failed");
            }
        }

        self.persist(&trace);
        self.bus.close(execution_id);
        self.active
            .lock()
            .expect("active lock poisoned")
            .remove(&execution_id);

        Ok(trace.execution())
    }

    /// Write-through of the terminal execution and all its nodes.
    fn persist(&self, trace: &ExecutionTrace) {
        for node in trace.nodes() {
            if let Err(err) = self.executions.save_node(&node) {
                error!(node_id = %node.id, error = %err, "failed to persist node");
            }
        }
        if let Err(err) = self.executions.save_execution(&trace.execution()) {
            error!(error = %err, "failed to persist execution");
        }
    }

    /// Cancel a running execution: the deadline moves to now and the run
    /// terminates as if the wall clock ran out.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        let active = self.active.lock().expect("active lock poisoned");
        match active.get(&execution_id) {
            Some(entry) => {
                entry.deadline.cancel();
                true
            }
            None => false,
        }
    }

    /// Subscribe to an execution's event stream. Running executions come
    /// with a synthesized snapshot of nodes already terminal.
    pub fn subscribe(
        &self,
        execution_id: Uuid,
    ) -> (Vec<ExecutionEvent>, broadcast::Receiver<ExecutionEvent>) {
        let active = self.active.lock().expect("active lock poisoned");
        match active.get(&execution_id) {
            Some(entry) => self.bus.subscribe_with_snapshot(&entry.trace),
            None => (Vec::new(), self.bus.subscribe(execution_id)),
        }
    }

    /// The execution record, live or persisted.
    pub fn execution(&self, execution_id: Uuid) -> Result<Option<Execution>> {
        {
            let active = self.active.lock().expect("active lock poisoned");
            if let Some(entry) = active.get(&execution_id) {
                return Ok(Some(entry.trace.execution()));
            }
        }
        self.executions.get_execution(execution_id)
    }

    /// The materialized node tree, live or persisted.
    pub fn tree(&self, execution_id: Uuid) -> Result<Option<NodeTree>> {
        {
            let active = self.active.lock().expect("active lock poisoned");
            if let Some(entry) = active.get(&execution_id) {
                return Ok(entry.trace.tree());
            }
        }
        let nodes = self.executions.list_nodes(execution_id)?;
        Ok(crate::trace::materialize(&nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionRequest, CompletionResponse, Provider, TokenUsage};
    use crate::trace::{ExecutionStatus, NodeStatus, NodeType};
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const MODEL: &str = "claude-3-5-sonnet-20241022";

    #[derive(Clone, Copy)]
    enum Scripted {
        Text(&'static str),
        Error { retryable: bool },
    }

    /// Plays back scripted responses in order; repeats the last entry when
    /// the script runs out. Every call reports 10 input / 5 output tokens.
    struct ScriptedClient {
        script: Mutex<VecDeque<Scripted>>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LLMClient for ScriptedClient {
        async fn complete(&self, request: CompletionRequest) -> crate::error::Result<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().copied()
                }
            };
            match next {
                Some(Scripted::Text(text)) => Ok(CompletionResponse {
                    id: "scripted".to_string(),
                    model: request.model.unwrap_or_else(|| MODEL.to_string()),
                    content: text.to_string(),
                    usage: TokenUsage::new(10, 5),
                    timestamp: Utc::now(),
                }),
                Some(Scripted::Error { retryable }) => Err(Error::provider(
                    "scripted",
                    "503 service unavailable",
                    retryable,
                )),
                None => Ok(CompletionResponse {
                    id: "scripted".to_string(),
                    model: MODEL.to_string(),
                    content: "child answer".to_string(),
                    usage: TokenUsage::new(10, 5),
                    timestamp: Utc::now(),
                }),
            }
        }

        fn provider(&self) -> Provider {
            Provider::Anthropic
        }
    }

    fn orchestrator(client: Arc<ScriptedClient>, config: EngineConfig) -> Orchestrator {
        Orchestrator::builder()
            .client(client)
            .config(config)
            .build()
            .unwrap()
    }

    fn assert_tree_invariants(orch: &Orchestrator, execution: &Execution) {
        let nodes = orch.executions.list_nodes(execution.id).unwrap();

        // Exactly one root; every other node's parent exists.
        let roots: Vec<_> = nodes.iter().filter(|n| n.parent_node_id.is_none()).collect();
        assert_eq!(roots.len(), 1);
        for node in &nodes {
            if let Some(parent_id) = node.parent_node_id {
                let parent = nodes.iter().find(|n| n.id == parent_id).unwrap();
                assert_eq!(node.depth, parent.depth + 1);
                assert_eq!(node.execution_id, execution.id);
            } else {
                assert_eq!(node.depth, 0);
            }
        }

        // Totals are the sum over all nodes.
        assert_eq!(
            execution.total_input_tokens,
            nodes.iter().map(|n| n.input_tokens).sum::<u64>()
        );
        assert_eq!(
            execution.total_output_tokens,
            nodes.iter().map(|n| n.output_tokens).sum::<u64>()
        );

        // Sibling sequences are 0..k-1 without gaps.
        let mut by_parent: HashMap<Option<Uuid>, Vec<u64>> = HashMap::new();
        for node in &nodes {
            by_parent
                .entry(node.parent_node_id)
                .or_default()
                .push(node.sequence);
        }
        for sequences in by_parent.values_mut() {
            sequences.sort_unstable();
            for (i, sequence) in sequences.iter().enumerate() {
                assert_eq!(*sequence, i as u64);
            }
        }
    }

    #[tokio::test]
    async fn test_trivial_final() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Text(
            "```\nFINAL(context)\n```",
        )]));
        let orch = orchestrator(Arc::clone(&client), EngineConfig::default());

        let execution = orch
            .run(ExecuteRequest::new("echo", "abc").with_model(MODEL))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.final_result.as_deref(), Some("abc"));
        assert_eq!(client.calls(), 1);
        assert_eq!(execution.total_input_tokens, 10);
        assert_eq!(execution.total_output_tokens, 5);
        // 10 in * $3/M + 5 out * $15/M
        let expected = 10.0 / 1e6 * 3.0 + 5.0 / 1e6 * 15.0;
        assert!((execution.total_cost_usd - expected).abs() < 1e-12);

        let tree = orch.tree(execution.id).unwrap().unwrap();
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.node.status, NodeStatus::Completed);
        assert_eq!(tree.node.output, execution.final_result);
        assert_eq!(
            tree.node.generated_code.as_deref(),
            Some("FINAL(context)")
        );
        assert_tree_invariants(&orch, &execution);
    }

    #[tokio::test]
    async fn test_chunked_map_reduce() {
        let program = "```python\n\
size = 50000\n\
parts = []\n\
count = (len(context) + size - 1) // size\n\
for i in range(count):\n\
    chunk = context[i * size:(i + 1) * size]\n\
    parts = parts + [llm_query(\"summarize \" + str(len(chunk)) + \" chars\")]\n\
FINAL(\"\\n---\\n\".join(parts))\n\
```";
        let client = Arc::new(ScriptedClient::new(vec![
            Scripted::Text(program),
            Scripted::Text("S1"),
            Scripted::Text("S2"),
            Scripted::Text("S3"),
        ]));
        let orch = orchestrator(Arc::clone(&client), EngineConfig::default());

        let context = "x".repeat(120_000);
        let execution = orch
            .run(ExecuteRequest::new("summarize", context).with_model(MODEL))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(
            execution.final_result.as_deref(),
            Some("S1\n---\nS2\n---\nS3")
        );
        assert_eq!(client.calls(), 4);
        assert_eq!(execution.total_input_tokens, 40);
        assert_eq!(execution.total_output_tokens, 20);

        let tree = orch.tree(execution.id).unwrap().unwrap();
        assert_eq!(tree.size(), 4);
        assert_eq!(tree.children.len(), 3);
        for (i, child) in tree.children.iter().enumerate() {
            assert_eq!(child.node.sequence, i as u64);
            assert_eq!(child.node.depth, 1);
            assert_eq!(child.node.node_type, NodeType::Child);
            assert_eq!(child.node.status, NodeStatus::Completed);
        }
        // Children received the llm_query argument verbatim as their prompt.
        assert_eq!(tree.children[0].node.prompt, "summarize 50000 chars");
        assert_eq!(tree.children[2].node.prompt, "summarize 20000 chars");
        assert_tree_invariants(&orch, &execution);
    }

    #[tokio::test]
    async fn test_recursion_cap() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Text(
            "```\nanswer = llm_query(\"go deeper\")\nFINAL(answer)\n```",
        )]));
        let config = EngineConfig::default().with_max_recursion_depth(0);
        let orch = orchestrator(Arc::clone(&client), config);

        let execution = orch
            .run(ExecuteRequest::new("recurse", "ctx").with_model(MODEL))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_kind, Some(ErrorKind::RecursionLimit));
        // The rejected llm_query never became a node.
        assert_eq!(client.calls(), 1);
        let tree = orch.tree(execution.id).unwrap().unwrap();
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.node.status, NodeStatus::Failed);
        assert_eq!(tree.node.error_kind, Some(ErrorKind::RecursionLimit));
    }

    #[tokio::test]
    async fn test_depth_one_allowed_by_cap() {
        let client = Arc::new(ScriptedClient::new(vec![
            Scripted::Text("```\nFINAL(llm_query(\"q\"))\n```"),
            Scripted::Text("deep answer"),
        ]));
        let config = EngineConfig::default().with_max_recursion_depth(1);
        let orch = orchestrator(Arc::clone(&client), config);

        let execution = orch
            .run(ExecuteRequest::new("recurse", "ctx").with_model(MODEL))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.final_result.as_deref(), Some("deep answer"));
    }

    #[tokio::test]
    async fn test_sandbox_violation() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Text(
            "```\nimport os; FINAL(os.getcwd())\n```",
        )]));
        let orch = orchestrator(Arc::clone(&client), EngineConfig::default());

        let execution = orch
            .run(ExecuteRequest::new("escape", "ctx").with_model(MODEL))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_kind, Some(ErrorKind::SandboxViolation));
        assert!(execution.error_message.unwrap().contains("os"));

        let tree = orch.tree(execution.id).unwrap().unwrap();
        assert_eq!(tree.node.status, NodeStatus::Failed);
        assert_eq!(tree.node.error_kind, Some(ErrorKind::SandboxViolation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_outage() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Error {
            retryable: true,
        }]));
        let orch = orchestrator(Arc::clone(&client), EngineConfig::default());

        let execution = orch
            .run(ExecuteRequest::new("q", "ctx").with_model(MODEL))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_kind, Some(ErrorKind::Provider));
        assert_eq!(client.calls(), 3);

        let tree = orch.tree(execution.id).unwrap().unwrap();
        assert_eq!(tree.node.status, NodeStatus::Failed);
        assert_eq!(tree.node.error_kind, Some(ErrorKind::Provider));
        assert_eq!(execution.total_input_tokens, 0);
    }

    #[tokio::test]
    async fn test_no_final() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Text(
            "```\nx = 1 + 1\n```",
        )]));
        let orch = orchestrator(Arc::clone(&client), EngineConfig::default());

        let execution = orch
            .run(ExecuteRequest::new("q", "ctx").with_model(MODEL))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_kind, Some(ErrorKind::NoFinal));
        assert!(execution
            .error_message
            .unwrap()
            .contains("terminated without FINAL"));
        assert!(execution.final_result.is_none());
    }

    #[tokio::test]
    async fn test_deadline_expiry() {
        let program = "```\n\
for i in range(1000):\n\
    x = llm_query(\"slow\")\n\
FINAL(x)\n\
```";
        let client = Arc::new(
            ScriptedClient::new(vec![Scripted::Text(program)])
                .with_delay(Duration::from_millis(100)),
        );
        let config = EngineConfig::default()
            .with_execution_timeout(Duration::from_millis(350))
            .with_llm_call_timeout(Duration::from_secs(120));
        let orch = orchestrator(Arc::clone(&client), config);

        let execution = orch
            .run(ExecuteRequest::new("q", "ctx").with_model(MODEL))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_kind, Some(ErrorKind::DeadlineExceeded));

        let nodes = orch.executions.list_nodes(execution.id).unwrap();
        let children: Vec<_> = nodes.iter().filter(|n| n.parent_node_id.is_some()).collect();
        assert!(!children.is_empty());
        assert!(children
            .iter()
            .any(|n| matches!(n.status, NodeStatus::Timeout | NodeStatus::Failed)));

        // Totals reflect only calls that actually returned usage.
        let completed_sum: u64 = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed || n.input_tokens > 0)
            .map(|n| n.input_tokens)
            .sum();
        assert_eq!(execution.total_input_tokens, completed_sum);
        assert_tree_invariants(&orch, &execution);
    }

    #[tokio::test]
    async fn test_context_size_boundary() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Text(
            "```\nFINAL(context)\n```",
        )]));
        let config = EngineConfig::default().with_max_context_size(5);
        let orch = orchestrator(Arc::clone(&client), config);

        // Exactly at the limit: accepted.
        let ok = orch
            .run(ExecuteRequest::new("q", "12345").with_model(MODEL))
            .await
            .unwrap();
        assert_eq!(ok.status, ExecutionStatus::Completed);

        // One more character: rejected, no execution created.
        let err = orch
            .run(ExecuteRequest::new("q", "123456").with_model(MODEL))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContextTooLarge);
    }

    #[tokio::test]
    async fn test_session_memory_round_trip() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Text(
            "```\nmemory[\"runs\"] = 1\nFINAL(\"ok\")\n```",
        )]));
        let orch = orchestrator(Arc::clone(&client), EngineConfig::default());

        let session = orch.sessions().create_session("s").unwrap();
        let execution = orch
            .run(
                ExecuteRequest::new("q", "ctx")
                    .with_session(session.id)
                    .with_model(MODEL),
            )
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let memory = orch.sessions().get_memory(session.id).unwrap();
        assert_eq!(memory.get("runs"), Some(&serde_json::json!(1)));

        // Node snapshots captured before and after.
        let nodes = orch.executions.list_nodes(execution.id).unwrap();
        assert!(nodes[0].memory_before.is_empty());
        assert_eq!(
            nodes[0].memory_after.as_ref().unwrap().get("runs"),
            Some(&serde_json::json!(1))
        );
    }

    #[tokio::test]
    async fn test_failed_execution_does_not_touch_session_memory() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Text(
            "```\nmemory[\"x\"] = 1\ny = 1 / 0\nFINAL(y)\n```",
        )]));
        let orch = orchestrator(Arc::clone(&client), EngineConfig::default());

        let session = orch.sessions().create_session("s").unwrap();
        let execution = orch
            .run(
                ExecuteRequest::new("q", "ctx")
                    .with_session(session.id)
                    .with_model(MODEL),
            )
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(orch.sessions().get_memory(session.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_stored_context_used_when_request_has_none() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Text(
            "```\nFINAL(context)\n```",
        )]));
        let orch = orchestrator(Arc::clone(&client), EngineConfig::default());

        let session = orch.sessions().create_session("s").unwrap();
        orch.sessions()
            .set_context(session.id, "stored context")
            .unwrap();

        let execution = orch
            .run(
                ExecuteRequest::new("q", "")
                    .with_session(session.id)
                    .with_model(MODEL),
            )
            .await
            .unwrap();
        assert_eq!(execution.final_result.as_deref(), Some("stored context"));
        assert_eq!(execution.context_size, "stored context".chars().count());
    }

    #[tokio::test]
    async fn test_event_stream_with_snapshot() {
        let client = Arc::new(
            ScriptedClient::new(vec![Scripted::Text("```\nFINAL(context)\n```")])
                .with_delay(Duration::from_millis(100)),
        );
        let orch = Arc::new(orchestrator(Arc::clone(&client), EngineConfig::default()));

        let task = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move {
                orch.run(ExecuteRequest::new("q", "abc").with_model(MODEL))
                    .await
            })
        };

        // Subscribe while the root LM call is in flight.
        let mut subscription = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let id = {
                let active = orch.active.lock().unwrap();
                active.keys().next().copied()
            };
            if let Some(id) = id {
                subscription = Some(orch.subscribe(id));
                break;
            }
        }
        let (snapshot, mut rx) = subscription.expect("execution never registered");

        let execution = task.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let mut kinds: Vec<&'static str> =
            snapshot.iter().map(|e| e.kind.name()).collect();
        loop {
            match rx.recv().await {
                Ok(event) => kinds.push(event.kind.name()),
                Err(_) => break,
            }
        }

        for expected in [
            "execution_started",
            "node_started",
            "node_code",
            "node_output",
            "execution_completed",
        ] {
            assert!(kinds.contains(&expected), "missing {expected} in {kinds:?}");
        }
        assert_eq!(kinds.last(), Some(&"execution_completed"));
    }

    #[tokio::test]
    async fn test_cancel_marks_execution_cancelled() {
        let client = Arc::new(
            ScriptedClient::new(vec![Scripted::Text("```\nFINAL(context)\n```")])
                .with_delay(Duration::from_millis(300)),
        );
        let orch = Arc::new(orchestrator(Arc::clone(&client), EngineConfig::default()));

        let task = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move {
                orch.run(ExecuteRequest::new("q", "ctx").with_model(MODEL))
                    .await
            })
        };

        // Wait until the execution registers, then cancel it.
        let mut cancelled = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let id = {
                let active = orch.active.lock().unwrap();
                active.keys().next().copied()
            };
            if let Some(id) = id {
                assert!(orch.cancel(id));
                cancelled = true;
                break;
            }
        }
        assert!(cancelled);

        let execution = task.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.error_kind, Some(ErrorKind::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_unknown_model_prices_at_zero_with_warning() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Text(
            "```\nFINAL(context)\n```",
        )]));
        let orch = orchestrator(Arc::clone(&client), EngineConfig::default());

        let execution = orch
            .run(ExecuteRequest::new("q", "abc").with_model("not-in-table"))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.total_cost_usd, 0.0);
        let nodes = orch.executions.list_nodes(execution.id).unwrap();
        assert!(nodes[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("unknown model"));
        assert_eq!(nodes[0].status, NodeStatus::Completed);
    }
}
