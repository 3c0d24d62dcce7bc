//! SQLite 后端
//!
//! 单表 tool_context(key 主键, group_key, payload, created_at)；INSERT OR IGNORE 保证只追加。
//! rusqlite 为同步 API，所有操作在 blocking 线程池执行。

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::context_store::backend::{group_of, ContextBackend};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tool_context (
    key TEXT PRIMARY KEY,
    group_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tool_context_group ON tool_context(group_key);
";

/// SQLite 后端
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<R, F>(&self, f: F) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await??;
        Ok(result)
    }
}

#[async_trait]
impl ContextBackend for SqliteBackend {
    async fn put(&self, key: &str, payload: &str) -> anyhow::Result<bool> {
        let key = key.to_string();
        let group = group_of(&key).to_string();
        let payload = payload.to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        let changed = self
            .run(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO tool_context (key, group_key, payload, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![key, group, payload, created_at],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT payload FROM tool_context WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn list(&self, group_key: &str) -> anyhow::Result<Vec<(String, String)>> {
        let group = group_key.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, payload FROM tool_context WHERE group_key = ?1 ORDER BY key",
            )?;
            let rows = stmt.query_map([group], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
        .await
    }
}
