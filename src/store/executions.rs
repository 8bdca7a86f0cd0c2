//! SQLite-backed execution repository.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::store::schema::{initialize_schema, is_initialized};
use crate::store::ExecutionRepository;
use crate::trace::{Execution, ExecutionNode, ExecutionStatus, NodeStatus, NodeType};
use crate::MemoryMap;

/// SQLite-backed store for executions and their nodes.
pub struct SqliteExecutionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutionStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Share an existing connection (sessions and executions in one file).
    pub(crate) fn with_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }
}

impl ExecutionRepository for SqliteExecutionStore {
    fn save_execution(&self, execution: &Execution) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO executions (
                    id, session_id, query, context_size, status, started_at, completed_at,
                    total_input_tokens, total_output_tokens, total_cost_usd,
                    final_result, error_kind, error_message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    completed_at = excluded.completed_at,
                    total_input_tokens = excluded.total_input_tokens,
                    total_output_tokens = excluded.total_output_tokens,
                    total_cost_usd = excluded.total_cost_usd,
                    final_result = excluded.final_result,
                    error_kind = excluded.error_kind,
                    error_message = excluded.error_message",
                params![
                    execution.id.to_string(),
                    execution.session_id.map(|id| id.to_string()),
                    execution.query,
                    execution.context_size as i64,
                    status_str(execution.status),
                    execution.started_at.to_rfc3339(),
                    execution.completed_at.map(|t| t.to_rfc3339()),
                    execution.total_input_tokens as i64,
                    execution.total_output_tokens as i64,
                    execution.total_cost_usd,
                    execution.final_result,
                    execution.error_kind.map(|k| k.to_string()),
                    execution.error_message,
                ],
            )?;
            Ok(())
        })
    }

    fn save_node(&self, node: &ExecutionNode) -> Result<()> {
        let memory_before = serde_json::to_string(&node.memory_before)?;
        let memory_after = node
            .memory_after
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO execution_nodes (
                    id, execution_id, parent_node_id, node_type, depth, sequence,
                    prompt, generated_code, status, started_at, completed_at, model,
                    input_tokens, output_tokens, cost_usd, output, error_kind,
                    error_message, memory_before, memory_after
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                          ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                ON CONFLICT(id) DO UPDATE SET
                    generated_code = excluded.generated_code,
                    status = excluded.status,
                    completed_at = excluded.completed_at,
                    input_tokens = excluded.input_tokens,
                    output_tokens = excluded.output_tokens,
                    cost_usd = excluded.cost_usd,
                    output = excluded.output,
                    error_kind = excluded.error_kind,
                    error_message = excluded.error_message,
                    memory_after = excluded.memory_after",
                params![
                    node.id.to_string(),
                    node.execution_id.to_string(),
                    node.parent_node_id.map(|id| id.to_string()),
                    node_type_str(node.node_type),
                    node.depth as i64,
                    node.sequence as i64,
                    node.prompt,
                    node.generated_code,
                    node_status_str(node.status),
                    node.started_at.to_rfc3339(),
                    node.completed_at.map(|t| t.to_rfc3339()),
                    node.model,
                    node.input_tokens as i64,
                    node.output_tokens as i64,
                    node.cost_usd,
                    node.output,
                    node.error_kind.map(|k| k.to_string()),
                    node.error_message,
                    memory_before,
                    memory_after,
                ],
            )?;
            Ok(())
        })
    }

    fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, session_id, query, context_size, status, started_at, completed_at,
                        total_input_tokens, total_output_tokens, total_cost_usd,
                        final_result, error_kind, error_message
                 FROM executions WHERE id = ?1",
                params![id.to_string()],
                row_to_execution,
            )
            .optional()
        })
    }

    fn list_nodes(&self, execution_id: Uuid) -> Result<Vec<ExecutionNode>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, parent_node_id, node_type, depth, sequence,
                        prompt, generated_code, status, started_at, completed_at, model,
                        input_tokens, output_tokens, cost_usd, output, error_kind,
                        error_message, memory_before, memory_after
                 FROM execution_nodes WHERE execution_id = ?1
                 ORDER BY depth ASC, sequence ASC",
            )?;
            let nodes = stmt
                .query_map(params![execution_id.to_string()], row_to_node)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(nodes)
        })
    }
}

fn status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

fn parse_status(raw: &str) -> rusqlite::Result<ExecutionStatus> {
    match raw {
        "pending" => Ok(ExecutionStatus::Pending),
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        other => Err(bad_column("status", other)),
    }
}

fn node_status_str(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Running => "running",
        NodeStatus::Completed => "completed",
        NodeStatus::Failed => "failed",
        NodeStatus::Timeout => "timeout",
    }
}

fn parse_node_status(raw: &str) -> rusqlite::Result<NodeStatus> {
    match raw {
        "running" => Ok(NodeStatus::Running),
        "completed" => Ok(NodeStatus::Completed),
        "failed" => Ok(NodeStatus::Failed),
        "timeout" => Ok(NodeStatus::Timeout),
        other => Err(bad_column("node status", other)),
    }
}

fn node_type_str(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::Root => "root",
        NodeType::Child => "child",
    }
}

fn parse_node_type(raw: &str) -> rusqlite::Result<NodeType> {
    match raw {
        "root" => Ok(NodeType::Root),
        "child" => Ok(NodeType::Child),
        other => Err(bad_column("node type", other)),
    }
}

fn parse_error_kind(raw: &str) -> rusqlite::Result<ErrorKind> {
    let kind = match raw {
        "sandbox_violation" => ErrorKind::SandboxViolation,
        "program_runtime" => ErrorKind::ProgramRuntime,
        "provider" => ErrorKind::Provider,
        "recursion_limit" => ErrorKind::RecursionLimit,
        "deadline_exceeded" => ErrorKind::DeadlineExceeded,
        "context_too_large" => ErrorKind::ContextTooLarge,
        "no_final" => ErrorKind::NoFinal,
        "storage" => ErrorKind::Storage,
        "internal" => ErrorKind::Internal,
        other => return Err(bad_column("error kind", other)),
    };
    Ok(kind)
}

fn bad_column(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("invalid {}: {}", what, value).into(),
    )
}

fn parse_uuid(raw: String) -> rusqlite::Result<Uuid> {
    raw.parse()
        .map_err(|_| bad_column("uuid", &raw))
}

fn parse_timestamp(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| bad_column("timestamp", &raw))
}

fn parse_memory(raw: String) -> rusqlite::Result<MemoryMap> {
    serde_json::from_str(&raw).map_err(|_| bad_column("memory document", &raw))
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: parse_uuid(row.get(0)?)?,
        session_id: row
            .get::<_, Option<String>>(1)?
            .map(parse_uuid)
            .transpose()?,
        query: row.get(2)?,
        context_size: row.get::<_, i64>(3)? as usize,
        status: parse_status(&row.get::<_, String>(4)?)?,
        started_at: parse_timestamp(row.get(5)?)?,
        completed_at: row
            .get::<_, Option<String>>(6)?
            .map(parse_timestamp)
            .transpose()?,
        total_input_tokens: row.get::<_, i64>(7)? as u64,
        total_output_tokens: row.get::<_, i64>(8)? as u64,
        total_cost_usd: row.get(9)?,
        final_result: row.get(10)?,
        error_kind: row
            .get::<_, Option<String>>(11)?
            .map(|raw| parse_error_kind(&raw))
            .transpose()?,
        error_message: row.get(12)?,
    })
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<ExecutionNode> {
    Ok(ExecutionNode {
        id: parse_uuid(row.get(0)?)?,
        execution_id: parse_uuid(row.get(1)?)?,
        parent_node_id: row
            .get::<_, Option<String>>(2)?
            .map(parse_uuid)
            .transpose()?,
        node_type: parse_node_type(&row.get::<_, String>(3)?)?,
        depth: row.get::<_, i64>(4)? as u32,
        sequence: row.get::<_, i64>(5)? as u64,
        prompt: row.get(6)?,
        generated_code: row.get(7)?,
        status: parse_node_status(&row.get::<_, String>(8)?)?,
        started_at: parse_timestamp(row.get(9)?)?,
        completed_at: row
            .get::<_, Option<String>>(10)?
            .map(parse_timestamp)
            .transpose()?,
        model: row.get(11)?,
        input_tokens: row.get::<_, i64>(12)? as u64,
        output_tokens: row.get::<_, i64>(13)? as u64,
        cost_usd: row.get(14)?,
        output: row.get(15)?,
        error_kind: row
            .get::<_, Option<String>>(16)?
            .map(|raw| parse_error_kind(&raw))
            .transpose()?,
        error_message: row.get(17)?,
        memory_before: parse_memory(row.get(18)?)?,
        memory_after: row
            .get::<_, Option<String>>(19)?
            .map(parse_memory)
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::ExecutionTrace;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_execution_round_trip() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let trace = ExecutionTrace::new(Execution::new("q", 42, Some(Uuid::new_v4())));
        trace.mark_running();
        trace.mark_completed("result");

        let execution = trace.execution();
        store.save_execution(&execution).unwrap();

        let loaded = store.get_execution(execution.id).unwrap().unwrap();
        assert_eq!(loaded, execution);
    }

    #[test]
    fn test_save_is_upsert() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let trace = ExecutionTrace::new(Execution::new("q", 1, None));
        store.save_execution(&trace.execution()).unwrap();

        trace.mark_running();
        trace.mark_failed(ErrorKind::Provider, "503");
        store.save_execution(&trace.execution()).unwrap();

        let loaded = store.get_execution(trace.execution_id()).unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.error_kind, Some(ErrorKind::Provider));
    }

    #[test]
    fn test_node_round_trip_with_memory() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let trace = ExecutionTrace::new(Execution::new("q", 1, None));
        store.save_execution(&trace.execution()).unwrap();

        let mut memory = MemoryMap::new();
        memory.insert("k".to_string(), serde_json::json!([1, "two", null]));
        let node = trace.begin_node(None, NodeType::Root, 0, "p", "m", memory);
        trace.set_code(node.id, "FINAL(context)");
        trace.complete_node(node.id, "abc", MemoryMap::new());
        let node = trace.node(node.id).unwrap();

        store.save_node(&node).unwrap();
        let nodes = store.list_nodes(trace.execution_id()).unwrap();
        assert_eq!(nodes, vec![node]);
    }

    #[test]
    fn test_list_nodes_ordered_by_depth_then_sequence() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        let trace = ExecutionTrace::new(Execution::new("q", 1, None));
        store.save_execution(&trace.execution()).unwrap();

        let root = trace.begin_node(None, NodeType::Root, 0, "root", "m", MemoryMap::new());
        let c0 = trace.begin_node(Some(root.id), NodeType::Child, 1, "c0", "m", MemoryMap::new());
        let c1 = trace.begin_node(Some(root.id), NodeType::Child, 1, "c1", "m", MemoryMap::new());
        for id in [root.id, c1.id, c0.id] {
            store.save_node(&trace.node(id).unwrap()).unwrap();
        }

        let nodes = store.list_nodes(trace.execution_id()).unwrap();
        let prompts: Vec<_> = nodes.iter().map(|n| n.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["root", "c0", "c1"]);
    }

    #[test]
    fn test_get_missing_execution_is_none() {
        let store = SqliteExecutionStore::in_memory().unwrap();
        assert!(store.get_execution(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let trace = ExecutionTrace::new(Execution::new("q", 7, None));
        trace.mark_running();
        trace.mark_completed("done");
        let execution = trace.execution();

        {
            let store = SqliteExecutionStore::open(&path).unwrap();
            store.save_execution(&execution).unwrap();
        }

        let reopened = SqliteExecutionStore::open(&path).unwrap();
        let loaded = reopened.get_execution(execution.id).unwrap().unwrap();
        assert_eq!(loaded, execution);
    }
}
