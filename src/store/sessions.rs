//! SQLite-backed session repository.
//!
//! Sessions hold an optional stored context (with size and sha-256
//! metadata) and a JSON memory document. Memory writes are read-modify-write
//! under the store's connection lock, so merges are atomic per session.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::schema::{initialize_schema, is_initialized};
use crate::store::SessionRepository;
use crate::MemoryMap;

/// A stored session: named context plus persistent memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub name: String,
    /// Context size in characters (0 when no context is stored).
    pub context_size: usize,
    /// Hex sha-256 of the stored context.
    pub context_sha256: Option<String>,
    pub memory: MemoryMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hex sha-256 digest of a text blob.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SQLite-backed session store.
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// Open or create a session store at the given path.
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

    /// The underlying connection, for co-locating the execution store in
    /// the same database file.
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
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

impl SessionRepository for SqliteSessionStore {
    fn create_session(&self, name: &str) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            name: name.to_string(),
            context_size: 0,
            context_sha256: None,
            memory: MemoryMap::new(),
            created_at: now,
            updated_at: now,
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, context, context_size, context_sha256,
                                       memory, created_at, updated_at)
                 VALUES (?1, ?2, NULL, 0, NULL, '{}', ?3, ?4)",
                params![
                    session.id.to_string(),
                    session.name,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(session)
    }

    fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, context_size, context_sha256, memory, created_at, updated_at
                 FROM sessions WHERE id = ?1",
                params![id.to_string()],
                row_to_session,
            )
            .optional()
        })
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, context_size, context_sha256, memory, created_at, updated_at
                 FROM sessions ORDER BY created_at ASC",
            )?;
            let sessions = stmt
                .query_map([], row_to_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
    }

    fn delete_session(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM sessions WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(deleted > 0)
        })
    }

    fn set_context(&self, id: Uuid, context: &str) -> Result<()> {
        let size = context.chars().count();
        let hash = sha256_hex(context);
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions
                 SET context = ?2, context_size = ?3, context_sha256 = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    context,
                    size as i64,
                    hash,
                    Utc::now().to_rfc3339(),
                ],
            )
        })?;
        if updated == 0 {
            return Err(Error::Storage(format!("session not found: {}", id)));
        }
        Ok(())
    }

    fn get_context(&self, id: Uuid) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT context FROM sessions WHERE id = ?1",
                params![id.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(|found| found.flatten())
        })
    }

    fn get_memory(&self, id: Uuid) -> Result<MemoryMap> {
        let raw = self.with_conn(|conn| {
            conn.query_row(
                "SELECT memory FROM sessions WHERE id = ?1",
                params![id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(MemoryMap::new()),
        }
    }

    fn merge_memory(&self, id: Uuid, updates: &MemoryMap) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        // Read-modify-write inside one lock hold: last writer wins per key.
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;

        let raw: Option<String> = conn
            .query_row(
                "SELECT memory FROM sessions WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(e.to_string()))?;

        let Some(raw) = raw else {
            return Err(Error::Storage(format!("session not found: {}", id)));
        };

        let mut memory: MemoryMap = serde_json::from_str(&raw)?;
        for (key, value) in updates {
            memory.insert(key.clone(), value.clone());
        }

        conn.execute(
            "UPDATE sessions SET memory = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                serde_json::to_string(&memory)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let id: String = row.get(0)?;
    let memory: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    let bad = |what: &str, value: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid {}: {}", what, value).into(),
        )
    };

    Ok(Session {
        id: id.parse().map_err(|_| bad("uuid", &id))?,
        name: row.get(1)?,
        context_size: row.get::<_, i64>(2)? as usize,
        context_sha256: row.get(3)?,
        memory: serde_json::from_str(&memory).map_err(|_| bad("memory document", &memory))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| bad("timestamp", &created_at))?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| bad("timestamp", &updated_at))?,
    })
}
