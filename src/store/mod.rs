//! Repository boundary for executions and sessions.
//!
//! The orchestrator persists through these narrow traits: node and
//! execution rows are written through on terminal transitions, session
//! memory is merged once per execution under the store lock.

mod executions;
mod schema;
mod sessions;

use uuid::Uuid;

use crate::error::Result;
use crate::trace::{Execution, ExecutionNode};
use crate::MemoryMap;

pub use executions::SqliteExecutionStore;
pub use schema::{initialize_schema, is_initialized};
pub use sessions::{sha256_hex, Session, SqliteSessionStore};

/// Write-through store for execution and node records.
pub trait ExecutionRepository: Send + Sync {
    /// Insert or update an execution row.
    fn save_execution(&self, execution: &Execution) -> Result<()>;

    /// Insert or update a node row.
    fn save_node(&self, node: &ExecutionNode) -> Result<()>;

    fn get_execution(&self, id: Uuid) -> Result<Option<Execution>>;

    /// All nodes of an execution, depth-major then sequence order.
    fn list_nodes(&self, execution_id: Uuid) -> Result<Vec<ExecutionNode>>;
}

/// Session CRUD plus the per-session memory document.
pub trait SessionRepository: Send + Sync {
    fn create_session(&self, name: &str) -> Result<Session>;

    fn get_session(&self, id: Uuid) -> Result<Option<Session>>;

    fn list_sessions(&self) -> Result<Vec<Session>>;

    fn delete_session(&self, id: Uuid) -> Result<bool>;

    /// Store a context blob, recomputing `{size, sha256}` metadata.
    fn set_context(&self, id: Uuid, context: &str) -> Result<()>;

    fn get_context(&self, id: Uuid) -> Result<Option<String>>;

    /// The session's memory document (empty for an unknown session).
    fn get_memory(&self, id: Uuid) -> Result<MemoryMap>;

    /// Merge updates into the memory document, key by key, atomically for
    /// this session. Last writer wins; merging the same updates twice is
    /// idempotent.
    fn merge_memory(&self, id: Uuid, updates: &MemoryMap) -> Result<()>;
}

impl SqliteSessionStore {
    /// An execution store sharing this session store's database.
    pub fn execution_store(&self) -> SqliteExecutionStore {
        SqliteExecutionStore::with_connection(self.connection())
    }
}
