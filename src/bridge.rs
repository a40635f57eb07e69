//! Owns per-user sessions over a streaming NDJSON CLI, intercepts messages
//! for users in bridge mode, and parses output into ordered [`Event`]s
//! (§4.5).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain_types::UserId;
use crate::event::Event;
use crate::gateway::{GatewayClient, GatewayRequest, GatewayResult};
use crate::user_state::{SessionMode, UserSession, UserStateError, UserStateStore};

/// Static configuration for the CLI the bridge drives.
#[derive(Debug, Clone)]
pub struct BridgeCliConfig {
    /// Path (or bare name) of the external CLI binary.
    pub binary: String,
    /// Optional permission-mode flag value, passed as `--permission-mode
    /// <value>` when set.
    pub permission_mode: Option<String>,
    /// Overall timeout in seconds passed through to the gateway, if any.
    pub timeout_secs: Option<u64>,
    /// The bridge name this CLI is reachable under on the gateway.
    pub gateway_bridge_name: String,
}

/// The outcome of one bridged send, after NDJSON parsing.
#[derive(Debug, Clone, Default)]
pub struct BridgeResponse {
    /// Ordered events parsed from the CLI's output.
    pub events: Vec<Event>,
    /// Set on transport errors, non-zero exit codes, or timeouts; in that
    /// case `events` is always empty.
    pub error: Option<String>,
}

/// Errors surfaced by session-state operations (not send failures, which
/// are folded into [`BridgeResponse::error`] per §4.5).
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The user-state store failed.
    #[error("user state store error: {0}")]
    UserState(#[from] UserStateError),
}

fn list_session_stems(project_dir: &Path) -> HashSet<String> {
    let Ok(entries) = std::fs::read_dir(project_dir) else {
        return HashSet::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            entry
                .path()
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .collect()
}

/// Parses one line of bridge NDJSON output, appending events to `events` in
/// encounter order and attaching `tool_result` blocks to the matching
/// already-open `tool_use` event by correlation id. `"result"`-typed
/// objects always produce no events.
fn parse_ndjson_line(line: &str, events: &mut Vec<Event>) -> Result<(), serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("type").and_then(|t| t.as_str()) == Some("result") {
        return Ok(());
    }
    let Some(blocks) = value.get("content").and_then(|c| c.as_array()) else {
        return Ok(());
    };
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                let content = block.get("text").and_then(|t| t.as_str()).unwrap_or_default();
                events.push(Event::Text {
                    content: content.to_string(),
                });
            }
            Some("thinking") => {
                let content = block
                    .get("thinking")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default();
                events.push(Event::Thinking {
                    content: content.to_string(),
                });
            }
            Some("tool_use") => {
                let call_id = block.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                let tool_name = block.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                let input_summary = block
                    .get("input")
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                events.push(Event::ToolCall {
                    tool_name: tool_name.to_string(),
                    input_summary,
                    result: None,
                    call_id: call_id.to_string(),
                });
            }
            Some("tool_result") => {
                let correlation_id = block
                    .get("tool_use_id")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default();
                let result_text = block
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                let matching = events.iter_mut().find(
                    |event| matches!(event, Event::ToolCall { call_id, .. } if call_id == correlation_id),
                );
                if let Some(Event::ToolCall { result, .. }) = matching {
                    *result = Some(result_text);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parses a full NDJSON stdout blob into ordered events, in encounter
/// order. Empty lines are ignored; malformed lines are skipped (the caller
/// is expected to log `bad_lines` at warn level).
#[must_use]
pub fn parse_ndjson(stdout: &str) -> (Vec<Event>, usize) {
    let mut events: Vec<Event> = Vec::new();
    let mut bad_lines = 0usize;
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if parse_ndjson_line(line, &mut events).is_err() {
            bad_lines += 1;
        }
    }
    (events, bad_lines)
}

/// Per-user state plus the sharded lock table serializing one user's
/// messages while allowing cross-user concurrency (§4.5, §9 REDESIGN
/// FLAGS).
pub struct BridgeSessionManager {
    cli: BridgeCliConfig,
    store: Arc<UserStateStore>,
    client: Option<Arc<GatewayClient>>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl BridgeSessionManager {
    /// Creates a manager over `store`, executing via `client` when set, or
    /// directly on the local host otherwise (the "no gateway URL
    /// configured" case in §4.5).
    #[must_use]
    pub fn new(
        cli: BridgeCliConfig,
        store: Arc<UserStateStore>,
        client: Option<Arc<GatewayClient>>,
    ) -> Self {
        Self {
            cli,
            store,
            client,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user: &UserId) -> Arc<Mutex<()>> {
        self.locks
            .entry(user.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Enters bridge mode for `user`, binding a project and optionally a
    /// pre-existing session id.
    pub async fn enter(
        &self,
        user: &UserId,
        project: String,
        project_path: PathBuf,
        session_id: Option<String>,
    ) -> Result<(), BridgeError> {
        self.store
            .put(
                user,
                UserSession {
                    mode: SessionMode::Bridge,
                    active_project: project,
                    active_project_path: project_path,
                    active_session_id: session_id,
                    active_model: None,
                    active_effort: None,
                },
            )
            .await?;
        Ok(())
    }

    /// Exits bridge mode for `user`, clearing all bindings.
    pub async fn exit(&self, user: &UserId) -> Result<(), BridgeError> {
        self.store.remove(user).await?;
        Ok(())
    }

    /// Returns whether `user` is currently in bridge mode.
    pub async fn is_bridged(&self, user: &UserId) -> Result<bool, BridgeError> {
        Ok(self.store.get(user).await?.is_some())
    }

    /// Updates the active model override and persists.
    pub async fn set_model(&self, user: &UserId, model: String) -> Result<(), BridgeError> {
        let Some(mut session) = self.store.get(user).await? else {
            return Ok(());
        };
        session.active_model = Some(model);
        self.store.put(user, session).await?;
        Ok(())
    }

    /// Updates the active effort override and persists.
    pub async fn set_effort(&self, user: &UserId, effort: String) -> Result<(), BridgeError> {
        let Some(mut session) = self.store.get(user).await? else {
            return Ok(());
        };
        session.active_effort = Some(effort);
        self.store.put(user, session).await?;
        Ok(())
    }

    fn build_argv(&self, session: &UserSession, text: &str) -> Vec<String> {
        let mut argv = vec![self.cli.binary.clone(), "--print".to_string()];
        if let Some(session_id) = &session.active_session_id {
            argv.push("--resume".to_string());
            argv.push(session_id.clone());
        }
        argv.push("--output-format".to_string());
        argv.push("stream-json".to_string());
        if let Some(mode) = &self.cli.permission_mode {
            argv.push("--permission-mode".to_string());
            argv.push(mode.clone());
        }
        if let Some(model) = &session.active_model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
        if let Some(effort) = &session.active_effort {
            argv.push("--effort".to_string());
            argv.push(effort.clone());
        }
        argv.push(text.to_string());
        argv
    }

    async fn execute(&self, session: &UserSession, text: &str) -> GatewayResult {
        let argv = self.build_argv(session, text);
        let request = GatewayRequest {
            bridge: self.cli.gateway_bridge_name.clone(),
            argv,
            cwd: Some(session.active_project_path.to_string_lossy().into_owned()),
            timeout: self.cli.timeout_secs,
        };
        if let Some(client) = &self.client {
            client.execute(&request).await
        } else {
            run_locally(&request).await
        }
    }

    /// Sends `text` through the bridge for `user`, serialized against any
    /// other in-flight message for the same user.
    pub async fn send_message(
        &self,
        user: &UserId,
        text: &str,
    ) -> Result<BridgeResponse, BridgeError> {
        let user_lock = self.lock_for(user);
        let _guard = user_lock.lock().await;

        let Some(mut session) = self.store.get(user).await? else {
            return Ok(BridgeResponse {
                events: Vec::new(),
                error: Some("user is not in bridge mode".into()),
            });
        };

        let detecting_new_session = session.active_session_id.is_none();
        let before = detecting_new_session
            .then(|| list_session_stems(&session.active_project_path))
            .unwrap_or_default();

        let result = self.execute(&session, text).await;

        if let Some(error) = result.error {
            return Ok(BridgeResponse {
                events: Vec::new(),
                error: Some(error),
            });
        }
        if result.returncode != 0 {
            return Ok(BridgeResponse {
                events: Vec::new(),
                error: Some(format!(
                    "bridge command exited {}: {}",
                    result.returncode, result.stderr
                )),
            });
        }

        if detecting_new_session {
            let after = list_session_stems(&session.active_project_path);
            let mut new_stems: Vec<&String> = after.difference(&before).collect();
            if new_stems.len() == 1 {
                session.active_session_id = Some(new_stems.remove(0).clone());
                self.store.put(user, session).await?;
            } else {
                tracing::warn!(
                    count = new_stems.len(),
                    "ambiguous or absent new bridge session file; active_session_id left unset"
                );
            }
        }

        let (events, bad_lines) = parse_ndjson(&result.stdout);
        if bad_lines > 0 {
            tracing::warn!(bad_lines, "skipped malformed NDJSON lines from bridge output");
        }
        Ok(BridgeResponse { events, error: None })
    }
}

/// Executes a gateway request directly on the local host, bypassing the
/// gateway client, for the "no gateway URL configured" deployment mode.
async fn run_locally(request: &GatewayRequest) -> GatewayResult {
    let mut command = tokio::process::Command::new(&request.argv[0]);
    command
        .args(&request.argv[1..])
        .kill_on_drop(true)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }
    let timeout_secs = request.timeout.unwrap_or(0);
    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return GatewayResult {
                stdout: String::new(),
                stderr: format!("{}: command not found", request.argv[0]),
                returncode: 127,
                error: None,
            };
        }
        Err(err) => {
            return GatewayResult {
                stdout: String::new(),
                stderr: String::new(),
                returncode: 0,
                error: Some(err.to_string()),
            };
        }
    };
    let wait = child.wait_with_output();
    let output = if timeout_secs == 0 {
        wait.await
    } else {
        match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), wait).await {
            Ok(result) => result,
            Err(_elapsed) => {
                return GatewayResult {
                    stdout: String::new(),
                    stderr: "Command timed out".into(),
                    returncode: -1,
                    error: None,
                };
            }
        }
    };
    match output {
        Ok(output) => GatewayResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            returncode: output.status.code().unwrap_or(-1),
            error: None,
        },
        Err(err) => GatewayResult {
            stdout: String::new(),
            stderr: String::new(),
            returncode: 0,
            error: Some(err.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_typed_objects_emit_no_events() {
        let (events, bad) = parse_ndjson("{\"type\":\"result\",\"foo\":1}\n");
        assert!(events.is_empty());
        assert_eq!(bad, 0);
    }

    #[test]
    fn text_and_thinking_blocks_become_events() {
        let line = serde_json::json!({
            "type": "assistant",
            "content": [
                {"type": "thinking", "thinking": "pondering"},
                {"type": "text", "text": "done"}
            ]
        })
        .to_string();
        let (events, bad) = parse_ndjson(&line);
        assert_eq!(bad, 0);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Thinking { content } if content == "pondering"));
        assert!(matches!(&events[1], Event::Text { content } if content == "done"));
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let input = "not json\n{\"type\":\"result\"}\n";
        let (events, bad) = parse_ndjson(input);
        assert!(events.is_empty());
        assert_eq!(bad, 1);
    }

    #[test]
    fn empty_lines_are_ignored() {
        let (events, bad) = parse_ndjson("\n\n   \n");
        assert!(events.is_empty());
        assert_eq!(bad, 0);
    }

    #[tokio::test]
    async fn enter_then_exit_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(UserStateStore::new(dir.path().join("state.json")));
        let manager = BridgeSessionManager::new(
            BridgeCliConfig {
                binary: "claude".into(),
                permission_mode: None,
                timeout_secs: None,
                gateway_bridge_name: "claude-code".into(),
            },
            store,
            None,
        );
        let user = UserId::try_new("7").unwrap();
        manager
            .enter(&user, "proj".into(), "/tmp".into(), None)
            .await
            .unwrap();
        assert!(manager.is_bridged(&user).await.unwrap());
        manager.exit(&user).await.unwrap();
        assert!(!manager.is_bridged(&user).await.unwrap());
    }

    #[tokio::test]
    async fn new_session_detection_picks_exactly_one_new_stem() {
        let _dir = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("a.jsonl"), "").unwrap();
        std::fs::write(project.path().join("b.jsonl"), "").unwrap();

        let before = list_session_stems(project.path());
        std::fs::write(project.path().join("c.jsonl"), "").unwrap();
        let after = list_session_stems(project.path());
        let new_stems: Vec<_> = after.difference(&before).collect();
        assert_eq!(new_stems.len(), 1);
        assert_eq!(new_stems[0], "c");
    }

    #[test]
    fn build_argv_includes_resume_flag_when_session_known() {
        let manager = BridgeSessionManager::new(
            BridgeCliConfig {
                binary: "claude".into(),
                permission_mode: Some("acceptEdits".into()),
                timeout_secs: None,
                gateway_bridge_name: "claude-code".into(),
            },
            Arc::new(UserStateStore::new(
                tempfile::tempdir().unwrap().path().join("state.json"),
            )),
            None,
        );
        let session = UserSession {
            mode: SessionMode::Bridge,
            active_project: "proj".into(),
            active_project_path: "/tmp".into(),
            active_session_id: Some("abc".into()),
            active_model: None,
            active_effort: None,
        };
        let argv = manager.build_argv(&session, "hello");
        assert!(argv.contains(&"--resume".to_string()));
        assert!(argv.contains(&"abc".to_string()));
        assert!(argv.contains(&"--permission-mode".to_string()));
        assert_eq!(argv.last(), Some(&"hello".to_string()));
    }
}
