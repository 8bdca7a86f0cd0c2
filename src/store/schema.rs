//! SQLite schema for executions, nodes, and sessions.

use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS executions (
    id                  TEXT PRIMARY KEY,
    session_id          TEXT,
    query               TEXT NOT NULL,
    context_size        INTEGER NOT NULL,
    status              TEXT NOT NULL,
    started_at          TEXT NOT NULL,
    completed_at        TEXT,
    total_input_tokens  INTEGER NOT NULL DEFAULT 0,
    total_output_tokens INTEGER NOT NULL DEFAULT 0,
    total_cost_usd      REAL NOT NULL DEFAULT 0,
    final_result        TEXT,
    error_kind          TEXT,
    error_message       TEXT
);

CREATE TABLE IF NOT EXISTS execution_nodes (
    id             TEXT PRIMARY KEY,
    execution_id   TEXT NOT NULL REFERENCES executions(id),
    parent_node_id TEXT REFERENCES execution_nodes(id),
    node_type      TEXT NOT NULL,
    depth          INTEGER NOT NULL,
    sequence       INTEGER NOT NULL,
    prompt         TEXT NOT NULL,
    generated_code TEXT,
    status         TEXT NOT NULL,
    started_at     TEXT NOT NULL,
    completed_at   TEXT,
    model          TEXT NOT NULL,
    input_tokens   INTEGER NOT NULL DEFAULT 0,
    output_tokens  INTEGER NOT NULL DEFAULT 0,
    cost_usd       REAL NOT NULL DEFAULT 0,
    output         TEXT,
    error_kind     TEXT,
    error_message  TEXT,
    memory_before  TEXT NOT NULL DEFAULT '{}',
    memory_after   TEXT
);

CREATE INDEX IF NOT EXISTS idx_nodes_execution ON execution_nodes(execution_id);
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON execution_nodes(parent_node_id);

CREATE TABLE IF NOT EXISTS sessions (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    context        TEXT,
    context_size   INTEGER NOT NULL DEFAULT 0,
    context_sha256 TEXT,
    memory         TEXT NOT NULL DEFAULT '{}',
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);
"#;

/// Create all tables and indexes.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Whether the schema has been applied to this database.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'executions'",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initializes_once() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!is_initialized(&conn));
        initialize_schema(&conn).unwrap();
        assert!(is_initialized(&conn));
        // idempotent
        initialize_schema(&conn).unwrap();
    }
}
