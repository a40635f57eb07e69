//! Durable JSON-backed ordered collection of scheduled-task records, guarded
//! by a single process-wide mutex.
//!
//! Follows the same functional-core/imperative-shell split the teacher
//! crate uses for its SQL storage: (de)serialization and id generation are
//! pure functions; [`TaskStore`] is the thin imperative shell performing the
//! actual file I/O under its lock.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain_types::{ChannelName, ChatId, TaskId};

/// The kind of due-detection rule a task uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Cron-expression driven.
    Cron,
    /// Fixed-interval driven, in seconds.
    Interval,
    /// Fires exactly once at a fixed timestamp.
    Once,
}

/// A durable scheduled-task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// 8-character unique identifier.
    pub id: TaskId,
    /// The prompt to invoke the agent with when due.
    pub prompt: String,
    /// The due-detection rule.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Type-specific value: a cron expression, a positive-integer seconds
    /// string, or an ISO timestamp, per `task_type`.
    pub value: String,
    /// The channel to deliver results to.
    pub channel: ChannelName,
    /// The chat id to deliver results to.
    pub chat_id: ChatId,
    /// When this task was created.
    pub created_at: DateTime<Utc>,
    /// When this task last fired, if ever.
    pub last_run: Option<DateTime<Utc>>,
    /// Whether the scheduler should still consider this task.
    pub active: bool,
    /// An optional model-tier hint scoped to this task's invocation only.
    pub model_tier: Option<String>,
}

/// Errors surfaced by the task store. Corruption is never silently
/// discarded.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    /// The backing file could not be read for a reason other than absence.
    #[error("failed to read task file {path}: {source}")]
    Read {
        /// The path that failed to read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The backing file's contents could not be parsed as a task array.
    #[error("task file {path} is corrupt: {source}")]
    Corrupt {
        /// The path whose contents failed to parse.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// The backing file could not be written atomically.
    #[error("failed to persist task file {path}: {source}")]
    Write {
        /// The path that failed to write.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Generates a fresh 8-character id guaranteed not to collide with any id in
/// `existing`. Pure apart from its use of the process RNG.
fn generate_unique_id(existing: &[ScheduledTask]) -> TaskId {
    loop {
        let candidate = generate_candidate_id();
        if !existing.iter().any(|t| t.id.as_ref() == candidate) {
            return TaskId::try_new(candidate).expect("generated id is always 8 chars");
        }
    }
}

fn generate_candidate_id() -> String {
    let raw: u128 = rand::rng().random();
    let hex = format!("{raw:032x}");
    hex[..8].to_string()
}

/// Pure (de)serialization helpers, kept separate from the I/O shell below.
mod codec {
    use super::{ScheduledTask, TaskStoreError};
    use std::path::Path;

    pub fn decode(path: &Path, bytes: &[u8]) -> Result<Vec<ScheduledTask>, TaskStoreError> {
        serde_json::from_slice(bytes).map_err(|source| TaskStoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn encode(tasks: &[ScheduledTask]) -> Vec<u8> {
        serde_json::to_vec(tasks).expect("ScheduledTask serialization never fails")
    }
}

/// Writes `bytes` to `path` atomically via a sibling temp file and rename.
async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_name = format!(
        ".{}.tmp-{:x}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("task_store"),
        rand::rng().random::<u64>()
    );
    let tmp_path = path.with_file_name(tmp_name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// The sole owner of the ordered sequence of [`ScheduledTask`] records.
pub struct TaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TaskStore {
    /// Creates a store backed by `path`. The file is not touched until the
    /// first read or write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Loads all tasks. An absent file is treated as an empty sequence.
    pub async fn load(&self) -> Result<Vec<ScheduledTask>, TaskStoreError> {
        let _guard = self.lock.lock().await;
        self.load_locked().await
    }

    async fn load_locked(&self) -> Result<Vec<ScheduledTask>, TaskStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => codec::decode(&self.path, &bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(TaskStoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn replace_locked(&self, tasks: &[ScheduledTask]) -> Result<(), TaskStoreError> {
        let bytes = codec::encode(tasks);
        atomic_write(&self.path, &bytes)
            .await
            .map_err(|source| TaskStoreError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Appends a new task with a prompt, type, value, channel, and chat id,
    /// generating a unique id and setting `created_at = now`. Returns the
    /// stored record.
    pub async fn create(
        &self,
        prompt: String,
        task_type: TaskType,
        value: String,
        channel: ChannelName,
        chat_id: ChatId,
        model_tier: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask, TaskStoreError> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load_locked().await?;
        let id = generate_unique_id(&tasks);
        let task = ScheduledTask {
            id,
            prompt,
            task_type,
            value,
            channel,
            chat_id,
            created_at: now,
            last_run: None,
            active: true,
            model_tier,
        };
        tasks.push(task.clone());
        self.replace_locked(&tasks).await?;
        Ok(task)
    }

    /// Sets `active = false` on the task matching `id`, if any. Returns
    /// whether a matching task was found.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool, TaskStoreError> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load_locked().await?;
        let Some(task) = tasks.iter_mut().find(|t| &t.id == id) else {
            return Ok(false);
        };
        task.active = false;
        self.replace_locked(&tasks).await?;
        Ok(true)
    }

    /// Runs `mutate` against the full loaded list under the store lock, then
    /// persists the result. Used by the scheduler's critical section (load,
    /// compute due subset, flip fields, persist, release) as a single
    /// locked operation.
    pub async fn with_lock<F, T>(&self, mutate: F) -> Result<T, TaskStoreError>
    where
        F: FnOnce(&mut Vec<ScheduledTask>) -> T,
    {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load_locked().await?;
        let result = mutate(&mut tasks);
        self.replace_locked(&tasks).await?;
        Ok(result)
    }
}
