//! 检查点持久化
//!
//! 每轮结束时把整个 SessionState 作为一次原子写入落盘，用于进程重启后恢复
//! 以及断线重连时的会话回放。支持三种后端：
//! - 内存（默认，仅测试与单进程使用）
//! - JSON 文件（每个线程一个文件，先写临时文件再 rename）
//! - SQLite（`checkpoints` 表，阻塞操作放在 spawn_blocking 中执行）

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{CheckpointBackend, CheckpointSection};
use crate::core::state::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("checkpoint sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("checkpoint task failed: {0}")]
    Task(String),
}

/// 检查点存储接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, state: &SessionState) -> Result<(), CheckpointError>;

    async fn load(&self, thread_id: &str) -> Result<Option<SessionState>, CheckpointError>;
}

/// 按配置打开检查点存储
pub fn open_checkpoint_store(section: &CheckpointSection) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    let store: Arc<dyn CheckpointStore> = match section.backend {
        CheckpointBackend::Memory => Arc::new(InMemoryCheckpointStore::default()),
        CheckpointBackend::File => Arc::new(FileCheckpointStore::new(&section.path)?),
        CheckpointBackend::Sqlite => Arc::new(SqliteCheckpointStore::open(&section.path)?),
    };
    Ok(store)
}

/// 内存实现，保存序列化后的副本以保证与持久化后端行为一致
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    states: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, state: &SessionState) -> Result<(), CheckpointError> {
        let json = serde_json::to_string(state)?;
        self.states.write().await.insert(state.thread_id.clone(), json);
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<SessionState>, CheckpointError> {
        match self.states.read().await.get(thread_id) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }
}

/// JSON 文件实现：`<dir>/<hex(thread_id)>.json`
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// 目录不存在时自动创建
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// 文件名为线程 ID 原始字节的十六进制编码，不同 ID 不会映射到同一文件
    fn path_for(&self, thread_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(thread_id.as_bytes())))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &SessionState) -> Result<(), CheckpointError> {
        let path = self.path_for(&state.thread_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<SessionState>, CheckpointError> {
        let path = self.path_for(thread_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: SessionState = serde_json::from_str(&data)?;
        if state.thread_id != thread_id {
            tracing::warn!(
                thread_id,
                stored = %state.thread_id,
                path = %path.display(),
                "checkpoint file belongs to another thread, ignoring"
            );
            return Ok(None);
        }
        Ok(Some(state))
    }
}

/// SQLite 实现
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = rusqlite::Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                summary_version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, CheckpointError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| CheckpointError::Task(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| CheckpointError::Task(e.to_string()))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, state: &SessionState) -> Result<(), CheckpointError> {
        let thread_id = state.thread_id.clone();
        let json = serde_json::to_string(state)?;
        let version = state.summary_version as i64;
        let updated_at = state.updated_at.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints (thread_id, state, summary_version, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(thread_id) DO UPDATE SET
                    state = excluded.state,
                    summary_version = excluded.summary_version,
                    updated_at = excluded.updated_at",
                rusqlite::params![thread_id, json, version, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, thread_id: &str) -> Result<Option<SessionState>, CheckpointError> {
        let thread_id = thread_id.to_string();
        let json: Option<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare("SELECT state FROM checkpoints WHERE thread_id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![thread_id])?;
                let state = match rows.next()? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                };
                Ok(state)
            })
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
