//! Key/value persistence of per-user bridge session state, and the
//! session-reset counter store. Both are single JSON-object files guarded by
//! their own mutex, using the same atomic write-then-rename discipline as
//! the task store.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain_types::{ChannelName, ChatId, ResetCount, UserId};

/// Whether a user is being handled normally or intercepted by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Normal router handling.
    Normal,
    /// Intercepted by the bridge session manager.
    Bridge,
}

/// Per-user bridge session state. Absence of an entry in the store is
/// equivalent to [`SessionMode::Normal`]; only bridge-mode entries are ever
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    /// Current mode. Always `Bridge` for persisted entries.
    pub mode: SessionMode,
    /// Opaque bridge project id.
    pub active_project: String,
    /// Absolute path to the active project's working directory.
    pub active_project_path: PathBuf,
    /// Opaque bridge session id, or `None` to request a new session.
    pub active_session_id: Option<String>,
    /// Optional model override.
    pub active_model: Option<String>,
    /// Optional effort-level override.
    pub active_effort: Option<String>,
}

/// Errors surfaced by the user-state and session-counter stores.
#[derive(Debug, Error)]
pub enum UserStateError {
    /// The backing file could not be read for a reason other than absence.
    #[error("failed to read user-state file {path}: {source}")]
    Read {
        /// The path that failed to read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The backing file's contents could not be parsed.
    #[error("user-state file {path} is corrupt: {source}")]
    Corrupt {
        /// The path whose contents failed to parse.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// The backing file could not be written atomically.
    #[error("failed to persist user-state file {path}: {source}")]
    Write {
        /// The path that failed to write.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

async fn atomic_write_json<T: Serialize>(
    path: &PathBuf,
    value: &T,
) -> Result<(), std::io::Error> {
    let bytes = serde_json::to_vec(value).expect("serialization never fails for this type");
    let tmp_name = format!(
        ".{}.tmp-{:x}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state"),
        rand::random::<u64>()
    );
    let tmp_path = path.with_file_name(tmp_name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await
}

async fn read_json<T: for<'de> Deserialize<'de> + Default>(
    path: &PathBuf,
) -> Result<T, UserStateError>
where
    T: Serialize,
{
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| UserStateError::Corrupt {
            path: path.clone(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(UserStateError::Read {
            path: path.clone(),
            source,
        }),
    }
}

/// Key/value store of per-user bridge sessions, keyed by user id.
pub struct UserStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl UserStateStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Loads the full map. An absent file is treated as empty.
    pub async fn load(&self) -> Result<HashMap<String, UserSession>, UserStateError> {
        let _guard = self.lock.lock().await;
        read_json(&self.path).await
    }

    /// Returns the session for `user`, if one is persisted (i.e. the user is
    /// in bridge mode).
    pub async fn get(&self, user: &UserId) -> Result<Option<UserSession>, UserStateError> {
        let map = self.load().await?;
        Ok(map.get(user.as_ref()).cloned())
    }

    /// Inserts or replaces the session for `user` and persists.
    pub async fn put(&self, user: &UserId, session: UserSession) -> Result<(), UserStateError> {
        let _guard = self.lock.lock().await;
        let mut map: HashMap<String, UserSession> = read_json(&self.path).await?;
        map.insert(user.as_ref().to_string(), session);
        atomic_write_json(&self.path, &map)
            .await
            .map_err(|source| UserStateError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Removes `user`'s entry (exit from bridge mode back to normal).
    pub async fn remove(&self, user: &UserId) -> Result<(), UserStateError> {
        let _guard = self.lock.lock().await;
        let mut map: HashMap<String, UserSession> = read_json(&self.path).await?;
        map.remove(user.as_ref());
        atomic_write_json(&self.path, &map)
            .await
            .map_err(|source| UserStateError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// Mapping from `"<channel>_<chat_id>"` to a non-negative reset counter.
pub struct SessionCounterStore {
    path: PathBuf,
    lock: Mutex<()>,
}

fn counter_key(channel: &ChannelName, chat_id: &ChatId) -> String {
    format!("{channel}_{chat_id}")
}

impl SessionCounterStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load_raw(&self) -> Result<HashMap<String, u64>, UserStateError> {
        read_json(&self.path).await
    }

    /// Returns the current counter for (channel, chat_id), defaulting to 0.
    pub async fn get(
        &self,
        channel: &ChannelName,
        chat_id: &ChatId,
    ) -> Result<ResetCount, UserStateError> {
        let _guard = self.lock.lock().await;
        let map = self.load_raw().await?;
        Ok(ResetCount::new(
            map.get(&counter_key(channel, chat_id)).copied().unwrap_or(0),
        ))
    }

    /// Increments the counter for (channel, chat_id) and persists, returning
    /// the new value.
    pub async fn increment(
        &self,
        channel: &ChannelName,
        chat_id: &ChatId,
    ) -> Result<ResetCount, UserStateError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_raw().await?;
        let key = counter_key(channel, chat_id);
        let next = map.get(&key).copied().unwrap_or(0) + 1;
        map.insert(key, next);
        atomic_write_json(&self.path, &map)
            .await
            .map_err(|source| UserStateError::Write {
                path: self.path.clone(),
                source,
            })?;
        Ok(ResetCount::new(next))
    }

    /// Raises the counter for (channel, chat_id) to `at_least` if it is
    /// currently lower, persisting only when an upgrade occurs. Used by
    /// startup reconciliation against the external checkpoint namespace.
    pub async fn raise_to_at_least(
        &self,
        channel: &ChannelName,
        chat_id: &ChatId,
        at_least: u64,
    ) -> Result<(), UserStateError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_raw().await?;
        let key = counter_key(channel, chat_id);
        let current = map.get(&key).copied().unwrap_or(0);
        if current >= at_least {
            return Ok(());
        }
        map.insert(key, at_least);
        atomic_write_json(&self.path, &map)
            .await
            .map_err(|source| UserStateError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelName {
        ChannelName::try_new("telegram").unwrap()
    }
    fn chat() -> ChatId {
        ChatId::try_new("100").unwrap()
    }
    fn user() -> UserId {
        UserId::try_new("7").unwrap()
    }

    #[tokio::test]
    async fn absent_user_session_is_normal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStateStore::new(dir.path().join("state.json"));
        assert!(store.get(&user()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_then_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStateStore::new(dir.path().join("state.json"));
        store
            .put(
                &user(),
                UserSession {
                    mode: SessionMode::Bridge,
                    active_project: "proj".into(),
                    active_project_path: "/home/me/proj".into(),
                    active_session_id: None,
                    active_model: None,
                    active_effort: None,
                },
            )
            .await
            .unwrap();
        assert!(store.get(&user()).await.unwrap().is_some());
        store.remove(&user()).await.unwrap();
        assert!(store.get(&user()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn counter_increments_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionCounterStore::new(dir.path().join("counters.json"));
        assert_eq!(store.get(&channel(), &chat()).await.unwrap().into_inner(), 0);
        assert_eq!(
            store.increment(&channel(), &chat()).await.unwrap().into_inner(),
            1
        );
        assert_eq!(
            store.increment(&channel(), &chat()).await.unwrap().into_inner(),
            2
        );
    }

    #[tokio::test]
    async fn raise_to_at_least_only_upgrades() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionCounterStore::new(dir.path().join("counters.json"));
        store.increment(&channel(), &chat()).await.unwrap();
        store.raise_to_at_least(&channel(), &chat(), 1).await.unwrap();
        assert_eq!(store.get(&channel(), &chat()).await.unwrap().into_inner(), 1);
        store.raise_to_at_least(&channel(), &chat(), 5).await.unwrap();
        assert_eq!(store.get(&channel(), &chat()).await.unwrap().into_inner(), 5);
    }
}
