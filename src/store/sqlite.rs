//! SQLite implementation of the local store
//!
//! WAL journal mode, shared connection behind a mutex, RFC3339 timestamps.
//! Embeddings are stored as little-endian f32 blobs.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{LocalStore, UpdatedStamp};
use crate::error::{MnemonError, Result};
use crate::types::{ContentHash, Memory, PartialUpdate};

/// Local memory store backed by SQLite
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let conn = Self::create_connection(&path_str)?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path_str,
        })
    }

    /// Open an in-memory store (testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn create_connection(path: &str) -> Result<Connection> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(path, flags)?
        };

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            PRAGMA cache_size=-64000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
            "#,
        )?;

        Ok(conn)
    }

    /// Database path ( ":memory:" for the in-memory store)
    pub fn path(&self) -> &str {
        &self.path
    }

    fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                content_hash TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                memory_type TEXT NOT NULL DEFAULT 'note',
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_updated_at ON memories(updated_at);
            CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);
            PRAGMA user_version = 1;
            "#,
        )?;
    }

    Ok(())
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(MnemonError::InvalidInput(format!(
            "Embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let mut embedding = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk.try_into().expect("chunks_exact(4)");
        embedding.push(f32::from_le_bytes(arr));
    }
    Ok(embedding)
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Memory, Option<Vec<u8>>)> {
    let content_hash: String = row.get(0)?;
    let content: String = row.get(1)?;
    let memory_type: String = row.get(2)?;
    let tags_json: String = row.get(3)?;
    let metadata_json: String = row.get(4)?;
    let embedding_blob: Option<Vec<u8>> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let metadata: HashMap<String, serde_json::Value> =
        serde_json::from_str(&metadata_json).unwrap_or_default();

    Ok((
        Memory {
            content_hash,
            content,
            memory_type,
            tags,
            metadata,
            embedding: None,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        },
        embedding_blob,
    ))
}

const MEMORY_COLUMNS: &str =
    "content_hash, content, memory_type, tags, metadata, embedding, created_at, updated_at";

impl LocalStore for SqliteStore {
    fn put(&self, memory: &Memory) -> Result<()> {
        let tags_json = serde_json::to_string(&memory.tags)?;
        let metadata_json = serde_json::to_string(&memory.metadata)?;
        let embedding_blob = memory.embedding.as_deref().map(embedding_to_blob);

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memories (content_hash, content, memory_type, tags, metadata, embedding, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(content_hash) DO UPDATE SET
                content = excluded.content,
                memory_type = excluded.memory_type,
                tags = excluded.tags,
                metadata = excluded.metadata,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at",
            params![
                memory.content_hash,
                memory.content,
                memory.memory_type,
                tags_json,
                metadata_json,
                embedding_blob,
                memory.created_at.to_rfc3339(),
                memory.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, content_hash: &str) -> Result<Option<Memory>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM memories WHERE content_hash = ?1",
                    MEMORY_COLUMNS
                ),
                params![content_hash],
                row_to_memory,
            )
            .optional()?;

        match row {
            Some((mut memory, blob)) => {
                if let Some(bytes) = blob {
                    memory.embedding = Some(blob_to_embedding(&bytes)?);
                }
                Ok(Some(memory))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, content_hash: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM memories WHERE content_hash = ?1",
            params![content_hash],
        )?;
        Ok(())
    }

    fn all_hashes(&self) -> Result<HashSet<ContentHash>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT content_hash FROM memories")?;
        let hashes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(hashes)
    }

    fn all_stamps(&self) -> Result<Vec<UpdatedStamp>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT content_hash, updated_at FROM memories")?;
        let stamps = stmt
            .query_map([], |row| {
                let content_hash: String = row.get(0)?;
                let updated_at: String = row.get(1)?;
                Ok((content_hash, updated_at))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        stamps
            .into_iter()
            .map(|(content_hash, updated_at)| {
                Ok(UpdatedStamp {
                    content_hash,
                    updated_at: DateTime::parse_from_rfc3339(&updated_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| {
                            MnemonError::Storage(format!("Bad timestamp '{}': {}", updated_at, e))
                        })?,
                })
            })
            .collect()
    }

    fn update_metadata_batch(&self, updates: &[PartialUpdate]) -> Result<usize> {
        self.with_transaction(|conn| {
            let mut applied = 0usize;
            for update in updates {
                let tags_json = update
                    .tags
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                let metadata_json = update
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                let updated_at = update.updated_at.unwrap_or_else(Utc::now).to_rfc3339();

                let changed = conn.execute(
                    "UPDATE memories SET
                        tags = COALESCE(?1, tags),
                        memory_type = COALESCE(?2, memory_type),
                        metadata = COALESCE(?3, metadata),
                        updated_at = ?4
                     WHERE content_hash = ?5",
                    params![
                        tags_json,
                        update.memory_type,
                        metadata_json,
                        updated_at,
                        update.content_hash,
                    ],
                )?;
                applied += changed;
            }
            Ok(applied)
        })
    }

    fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl Clone for SqliteStore {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            path: self.path.clone(),
        }
    }
}
