//! Append-only JSONL turn logging, one file per thread id.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::domain_types::{ChannelName, ThreadId, UserId};

/// The role of a logged turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A user-authored turn.
    User,
    /// An assistant-authored turn.
    Assistant,
}

/// One append-only turn record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Who produced this turn.
    pub role: Role,
    /// Plain-text content.
    pub content: String,
    /// UTC timestamp with sub-second precision.
    pub timestamp: DateTime<Utc>,
    /// The originating channel name.
    pub channel: ChannelName,
    /// The originating user id; `None` for assistant turns.
    pub user_id: Option<UserId>,
}

/// Writes turn records to a JSONL file per thread id.
///
/// No explicit lock: per-thread write contention is bounded by the
/// channel's own per-chat serialization (§5), and each write opens the file
/// in append mode independently.
pub struct TurnLog {
    dir: PathBuf,
}

impl TurnLog {
    /// Creates a turn log rooted at `dir`; one file per thread id is created
    /// under it on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, thread_id: &ThreadId) -> PathBuf {
        self.dir.join(format!("{thread_id}.jsonl"))
    }

    /// Appends `record` to the log for `thread_id`. Failures are the
    /// caller's responsibility to log and ignore per §7 ("logging failure:
    /// warn, continue").
    pub async fn append(
        &self,
        thread_id: &ThreadId,
        record: &TurnRecord,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(record).expect("TurnRecord serialization never fails");
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(thread_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }

    /// Reads back every record logged for `thread_id`, in append order.
    /// Used by tests; not needed by production code paths.
    pub async fn read_all(&self, thread_id: &ThreadId) -> std::io::Result<Vec<TurnRecord>> {
        let path = self.path_for(thread_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

/// Formats `at` as RFC 3339 with millisecond precision, for use in the
/// router's message-framing prefix and anywhere else a human-visible
/// timestamp is needed.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
