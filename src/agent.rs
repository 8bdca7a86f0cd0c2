//! Single-node agent loop.
//!
//! Drives one node's lifecycle: compose the prompt, call the LM (with
//! retries), parse the program out of the root response, run it in the
//! sandbox, and record the outcome on the trace. The sandbox's `llm_query`
//! primitive is bridged back here through an mpsc/oneshot pair: the
//! interpreter blocks its worker thread while a sibling task runs the nested
//! child node.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::deadline::Deadline;
use crate::error::{Error, ErrorKind, Result};
use crate::llm::{complete_with_retry, ChatMessage, CompletionRequest, LLMClient, TokenUsage};
use crate::pricing::PricingTable;
use crate::sandbox::{run_program, LlmQueryFn, Outcome, SandboxRun};
use crate::store::sha256_hex;
use crate::trace::{preview, EventBus, ExecutionEvent, ExecutionTrace, NodeType};
use crate::MemoryMap;

/// Characters of context included verbatim in the root prompt.
const CONTEXT_SAMPLE_CHARS: usize = 200;

/// Context metadata shown to the root LM instead of the full content.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextMetadata {
    pub size: usize,
    pub sha256: String,
    pub sample: String,
}

impl ContextMetadata {
    pub fn of(context: &str) -> Self {
        Self {
            size: context.chars().count(),
            sha256: sha256_hex(context),
            sample: preview(context, CONTEXT_SAMPLE_CHARS),
        }
    }
}

/// Fixed system message describing the sandbox primitives and response
/// format.
pub fn system_prompt(chunk_size: usize) -> String {
    format!(
        "You are the controller of a recursive language-model runtime. The full \
context does not fit in your prompt; instead you write a short program that \
inspects it and delegates focused questions to sub-models.\n\
\n\
Respond with exactly one fenced code block containing a program in the \
runtime's minimal scripting language (a restricted Python-like subset).\n\
\n\
Environment:\n\
- context: the full context as a string\n\
- memory: a persistent string-keyed mapping you may read and mutate\n\
- llm_query(prompt) -> str: ask a sub-model and get its answer\n\
- FINAL(value): terminate with the final answer (required, exactly once)\n\
- builtins: len, range, enumerate, min, max, sum, sorted, str, int, float, \
bool, list, dict\n\
- string methods: split, join, strip, upper, lower, find, replace, \
startswith, endswith\n\
\n\
Rules:\n\
- no imports, no file or network access, no while loops; use for loops\n\
- keep the text embedded in each llm_query prompt under about {} characters\n\
- you MUST call FINAL(...) or the run fails",
        chunk_size
    )
}

/// User message for the root node: the query plus context metadata.
pub fn root_prompt(query: &str, meta: &ContextMetadata, chunk_size: usize) -> String {
    format!(
        "Task: {}\n\
\n\
Context metadata:\n\
- size: {} characters\n\
- sha256: {}\n\
- sample (first {} chars): {}\n\
\n\
Work in chunks of roughly {} characters when scanning the context.",
        query,
        meta.size,
        meta.sha256,
        CONTEXT_SAMPLE_CHARS,
        meta.sample,
        chunk_size
    )
}

/// Extract the program from an LM response: the content of the first fenced
/// code block (language tag ignored), or the whole response when there is no
/// fence.
pub fn extract_program(response: &str) -> String {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[a-zA-Z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
    });
    match fence.captures(response) {
        Some(captures) => captures[1].trim_end().to_string(),
        None => response.trim().to_string(),
    }
}

/// A pending `llm_query` from the interpreter worker.
struct ChildRequest {
    prompt: String,
    memory: MemoryMap,
    reply: oneshot::Sender<Result<String>>,
}

/// Shared per-execution state for running nodes.
pub(crate) struct NodeRunner {
    pub client: Arc<dyn LLMClient>,
    pub pricing: Arc<PricingTable>,
    pub config: EngineConfig,
    pub bus: Arc<EventBus>,
    pub trace: Arc<ExecutionTrace>,
    pub deadline: Arc<Deadline>,
    pub model: String,
}

impl NodeRunner {
    /// Run the root node to its outcome. Returns the FINAL value and the
    /// post-execution memory; on failure the node (and any affected
    /// ancestors) are already recorded on the trace.
    pub async fn run_root(
        &self,
        query: &str,
        context: String,
        memory_in: MemoryMap,
    ) -> Result<(String, MemoryMap)> {
        let execution_id = self.trace.execution_id();
        let meta = ContextMetadata::of(&context);
        let user_prompt = root_prompt(query, &meta, self.config.default_chunk_size);

        let node = self.trace.begin_node(
            None,
            NodeType::Root,
            0,
            &user_prompt,
            &self.model,
            memory_in.clone(),
        );
        self.bus.publish(ExecutionEvent::node_started(
            execution_id,
            node.id,
            None,
            0,
            node.sequence,
            NodeType::Root,
            &user_prompt,
        ));
        info!(%execution_id, node_id = %node.id, "root node started");

        let response = match self.call_model(&user_prompt).await {
            Ok(response) => response,
            Err(err) => return Err(self.finish_failed(node.id, err, None)),
        };
        let (usage, cost) = self.record_usage(node.id, response.usage);

        let program = extract_program(&response.content);
        self.trace.set_code(node.id, &program);
        self.bus
            .publish(ExecutionEvent::node_code(execution_id, node.id, &program));
        debug!(node_id = %node.id, program_len = program.len(), "program extracted");

        let sandbox_run = self.run_sandbox(node.id, &program, context, memory_in).await?;

        match sandbox_run.outcome {
            Outcome::Final(result) => {
                self.trace
                    .complete_node(node.id, &result, sandbox_run.memory_after.clone());
                self.bus.publish(ExecutionEvent::node_output(
                    execution_id,
                    node.id,
                    &result,
                    usage.input_tokens,
                    usage.output_tokens,
                    cost,
                ));
                info!(node_id = %node.id, "root node completed");
                Ok((result, sandbox_run.memory_after))
            }
            // An error propagated out of the program (including a child's
            // deadline expiry) fails the root: only the node the clock
            // actually caught gets `timeout` status.
            Outcome::Error(err) => {
                let kind = err.kind();
                let message = err.to_string();
                self.trace
                    .fail_node(node.id, kind, &message, Some(sandbox_run.memory_after));
                self.bus.publish(ExecutionEvent::node_failed(
                    execution_id,
                    node.id,
                    kind,
                    &message,
                ));
                warn!(node_id = %node.id, %kind, %message, "root program failed");
                Err(err)
            }
            Outcome::Timeout => {
                self.trace
                    .timeout_node(node.id, Some(sandbox_run.memory_after));
                self.bus.publish(ExecutionEvent::node_failed(
                    execution_id,
                    node.id,
                    ErrorKind::DeadlineExceeded,
                    "execution deadline exceeded",
                ));
                warn!(node_id = %node.id, "root program timed out");
                Err(Error::DeadlineExceeded)
            }
        }
    }

    /// Execute the program on a blocking worker while this task services
    /// the `llm_query` requests it issues.
    async fn run_sandbox(
        &self,
        root_id: uuid::Uuid,
        program: &str,
        context: String,
        memory_in: MemoryMap,
    ) -> Result<SandboxRun> {
        let (tx, mut rx) = mpsc::channel::<ChildRequest>(1);
        let node_cap =
            Instant::now() + self.deadline.remaining().min(self.config.sandbox_timeout);
        let sandbox_deadline = Arc::clone(&self.deadline);
        let program = program.to_string();

        let worker = tokio::task::spawn_blocking(move || {
            let llm_query: LlmQueryFn<'_> = Box::new(move |prompt, memory| {
                let (reply_tx, reply_rx) = oneshot::channel();
                tx.blocking_send(ChildRequest {
                    prompt: prompt.to_string(),
                    memory: memory.clone(),
                    reply: reply_tx,
                })
                .map_err(|_| Error::Internal("llm_query channel closed".to_string()))?;
                reply_rx
                    .blocking_recv()
                    .map_err(|_| Error::Internal("llm_query reply dropped".to_string()))?
            });
            run_program(
                &program,
                context,
                memory_in,
                llm_query,
                sandbox_deadline,
                node_cap,
            )
        });

        // Service child calls in issue order until the program finishes and
        // drops its sender.
        while let Some(request) = rx.recv().await {
            let result = self.serve_child(root_id, request.prompt, request.memory).await;
            let _ = request.reply.send(result);
        }

        worker
            .await
            .map_err(|e| Error::Internal(format!("sandbox worker panicked: {}", e)))
    }

    /// Depth and deadline gate for one `llm_query`, then the nested child
    /// node.
    async fn serve_child(
        &self,
        parent_id: uuid::Uuid,
        prompt: String,
        memory: MemoryMap,
    ) -> Result<String> {
        let parent_depth = self
            .trace
            .node(parent_id)
            .map(|node| node.depth)
            .unwrap_or(0);
        let depth = parent_depth + 1;

        if depth > self.config.max_recursion_depth {
            warn!(parent_id = %parent_id, depth, "llm_query rejected: depth cap");
            return Err(Error::recursion_limit(self.config.max_recursion_depth));
        }
        if self.deadline.expired() {
            return Err(Error::DeadlineExceeded);
        }

        self.run_child(parent_id, depth, prompt, memory).await
    }

    /// One child node: the LM response text is the node's output, returned
    /// verbatim to the caller of `llm_query`.
    async fn run_child(
        &self,
        parent_id: uuid::Uuid,
        depth: u32,
        prompt: String,
        memory: MemoryMap,
    ) -> Result<String> {
        let execution_id = self.trace.execution_id();
        let node = self.trace.begin_node(
            Some(parent_id),
            NodeType::Child,
            depth,
            &prompt,
            &self.model,
            memory.clone(),
        );
        self.bus.publish(ExecutionEvent::node_started(
            execution_id,
            node.id,
            Some(parent_id),
            depth,
            node.sequence,
            NodeType::Child,
            &prompt,
        ));
        debug!(node_id = %node.id, depth, sequence = node.sequence, "child node started");

        match self.call_model(&prompt).await {
            Ok(response) => {
                let (usage, cost) = self.record_usage(node.id, response.usage);
                self.trace
                    .complete_node(node.id, &response.content, memory);
                self.bus.publish(ExecutionEvent::node_output(
                    execution_id,
                    node.id,
                    &response.content,
                    usage.input_tokens,
                    usage.output_tokens,
                    cost,
                ));
                Ok(response.content)
            }
            Err(err) => Err(self.finish_failed(node.id, err, Some(memory))),
        }
    }

    async fn call_model(&self, user_prompt: &str) -> Result<crate::llm::CompletionResponse> {
        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(system_prompt(self.config.default_chunk_size))
            .with_message(ChatMessage::user(user_prompt));
        complete_with_retry(
            &*self.client,
            request,
            &self.deadline,
            self.config.llm_call_timeout,
        )
        .await
    }

    /// Record the node's single LM call; unknown models price at zero with
    /// a non-fatal warning on the node.
    fn record_usage(&self, node_id: uuid::Uuid, usage: TokenUsage) -> (TokenUsage, f64) {
        let (cost, warning) = match self.pricing.cost_for(
            &self.model,
            usage.input_tokens,
            usage.output_tokens,
        ) {
            Some(cost) => (cost, None),
            None => (
                0.0,
                Some(format!(
                    "unknown model '{}'; cost not tracked",
                    self.model
                )),
            ),
        };
        self.trace.record_usage(node_id, usage, cost, warning);
        (usage, cost)
    }

    /// Mark a node terminal for `err` and publish the failure event. The
    /// node the deadline caught mid-flight becomes `timeout`; other errors
    /// mark it `failed`.
    fn finish_failed(
        &self,
        node_id: uuid::Uuid,
        err: Error,
        memory_after: Option<MemoryMap>,
    ) -> Error {
        let kind = err.kind();
        let message = err.to_string();
        if kind == ErrorKind::DeadlineExceeded {
            self.trace.timeout_node(node_id, memory_after);
            self.trace.fail_ancestors_deadline(node_id);
        } else {
            self.trace.fail_node(node_id, kind, &message, memory_after);
        }
        self.bus.publish(ExecutionEvent::node_failed(
            self.trace.execution_id(),
            node_id,
            kind,
            &message,
        ));
        warn!(node_id = %node_id, %kind, %message, "node failed");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extract_program_from_plain_fence() {
        let response = "Here is the plan.\n```\nFINAL(context)\n```\nDone.";
        assert_eq!(extract_program(response), "FINAL(context)");
    }

    #[test]
    fn test_extract_program_ignores_language_tag() {
        let response = "```python\nx = 1\nFINAL(x)\n```";
        assert_eq!(extract_program(response), "x = 1\nFINAL(x)");
    }

    #[test]
    fn test_extract_program_takes_first_fence() {
        let response = "```\nfirst = True\n```\nand then\n```\nsecond = True\n```";
        assert_eq!(extract_program(response), "first = True");
    }

    #[test]
    fn test_extract_program_without_fence_uses_whole_response() {
        assert_eq!(extract_program("  FINAL(context)\n"), "FINAL(context)");
    }

    #[test]
    fn test_context_metadata() {
        let meta = ContextMetadata::of("abc");
        assert_eq!(meta.size, 3);
        assert_eq!(meta.sample, "abc");
        assert_eq!(meta.sha256.len(), 64);
    }

    #[test]
    fn test_context_metadata_sample_clipped() {
        let context = "x".repeat(10_000);
        let meta = ContextMetadata::of(&context);
        assert_eq!(meta.size, 10_000);
        assert_eq!(meta.sample.chars().count(), 200);
    }

    #[test]
    fn test_prompts_mention_primitives() {
        let system = system_prompt(50_000);
        assert!(system.contains("llm_query"));
        assert!(system.contains("FINAL"));
        assert!(system.contains("50000"));

        let meta = ContextMetadata::of("hello");
        let prompt = root_prompt("summarize", &meta, 50_000);
        assert!(prompt.contains("summarize"));
        assert!(prompt.contains(&meta.sha256));
        assert!(prompt.contains("5 characters"));
    }
}
