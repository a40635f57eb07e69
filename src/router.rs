//! Translates an [`IncomingMessage`] into an agent invocation with a
//! deterministic, resumable conversational identity; enforces access; logs
//! every turn (§4.4).
//!
//! The pure decision logic (authorization, trigger stripping, framing) lives
//! in [`pipeline`] as free functions separated from the I/O shell
//! ([`MessageRouter`]) that calls them, the same functional-core /
//! imperative-shell split the teacher applies to its storage layer.

// `tokio::task_local!` expands to an item that rustdoc cannot attach outer
// doc comments to; suppress the resulting `missing_docs` false positive.
#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{Agent, AgentMessage};
use crate::domain_types::{thread_id_for, ChannelName, ChatId, ThreadId, UserId};
use crate::turn_log::{format_timestamp, Role, TurnLog, TurnRecord};
use crate::user_state::SessionCounterStore;

// The originating (channel, chat_id) of the message currently being
// routed, bound for the duration of one `route` call so a tool the agent
// invokes mid-call (notably `schedule_task`, §6) can observe it without an
// ambient global. Replaces the module-level mutable state the source
// implementation used for this purpose (§9 REDESIGN FLAGS).
tokio::task_local! {
    pub static ACTIVE_CHAT_CONTEXT: (ChannelName, ChatId);
}

/// Reads the chat context bound for the currently executing `route` call,
/// if any. Used by the schedule tool to bind a new task to the right
/// (channel, chat_id) without the caller passing it explicitly.
#[must_use]
pub fn active_chat_context() -> Option<(ChannelName, ChatId)> {
    ACTIVE_CHAT_CONTEXT.try_with(Clone::clone).ok()
}

/// An inbound message as produced by a channel adapter, prior to routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Source channel name.
    pub channel: ChannelName,
    /// The chat this message belongs to.
    pub chat_id: ChatId,
    /// The sending user.
    pub user_id: UserId,
    /// A human-readable display name for framing.
    pub display_name: String,
    /// The message text (possibly empty if only an image is attached).
    pub text: String,
    /// Whether this chat is a 1:1 private chat.
    pub is_private: bool,
    /// An optional upstream message id, for channels that have one.
    pub message_id: Option<String>,
    /// An optional base64-encoded image.
    pub image_base64: Option<String>,
    /// The image's MIME type, required when `image_base64` is set.
    pub image_mime_type: Option<String>,
    /// Whether this message requests a session reset instead of normal
    /// handling.
    pub reset_session: bool,
}

/// The router's per-call outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterOutcome {
    /// The message produced no agent response (unauthorized, reset request,
    /// trigger miss, or empty-after-strip).
    NoResponse,
    /// The message was routed to the agent and this is its final text.
    Responded {
        /// The thread id this turn was recorded under.
        thread_id: ThreadId,
        /// The agent's final text response.
        text: String,
    },
}

/// Per-channel authorization configuration: an allowlist of user ids. An
/// empty list allows every user.
#[derive(Debug, Clone, Default)]
pub struct ChannelAuthorization {
    /// Permitted user ids; empty means "allow all".
    pub allowed_user_ids: HashSet<String>,
}

/// Router-wide configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Per-channel authorization lists.
    pub authorization: HashMap<String, ChannelAuthorization>,
    /// The case-insensitive prefix required in group chats, e.g. `"/ai"`.
    pub trigger_prefix: String,
}

/// Errors the router's I/O shell can surface. Agent and logging failures
/// are handled internally per §7 and never appear here.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The session-counter store failed.
    #[error("session counter store error: {0}")]
    Counters(#[from] crate::user_state::UserStateError),
}

/// Pure decision functions, kept free of I/O so they are trivially testable.
pub mod pipeline {
    use super::{ChannelAuthorization, IncomingMessage};

    /// Step 1: authorization. `None` allowlist entry for the channel means
    /// "allow all" in this implementation's representation (an absent key),
    /// matching "empty list ⇒ allow all".
    #[must_use]
    pub fn is_authorized(auth: Option<&ChannelAuthorization>, user_id: &str) -> bool {
        match auth {
            None => true,
            Some(auth) if auth.allowed_user_ids.is_empty() => true,
            Some(auth) => auth.allowed_user_ids.contains(user_id),
        }
    }

    /// Steps 3–4: trigger gate plus empty gate. Returns `Some(stripped)`
    /// text to proceed with, or `None` if this message should yield
    /// [`super::RouterOutcome::NoResponse`].
    #[must_use]
    pub fn apply_trigger_gate<'a>(
        msg: &'a IncomingMessage,
        trigger_prefix: &str,
    ) -> Option<&'a str> {
        let stripped = if msg.is_private {
            Some(msg.text.as_str())
        } else if msg.text.len() >= trigger_prefix.len()
            && msg.text[..trigger_prefix.len()].eq_ignore_ascii_case(trigger_prefix)
        {
            Some(msg.text[trigger_prefix.len()..].trim_start())
        } else {
            None
        };
        let stripped = stripped?;
        if stripped.is_empty() && msg.image_base64.is_none() {
            None
        } else {
            Some(stripped)
        }
    }

    /// Step 7: builds the single-line framing prefix.
    #[must_use]
    pub fn frame_prefix(timestamp: &str, user_name: &str) -> String {
        format!("[{timestamp}] [{user_name}]: ")
    }
}

/// The I/O shell: loads/persists counters, invokes the agent, writes turn
/// logs.
pub struct MessageRouter {
    config: RouterConfig,
    counters: Arc<SessionCounterStore>,
    turn_log: Arc<TurnLog>,
    agent: Arc<dyn Agent>,
}

impl MessageRouter {
    /// Creates a router over the given configuration and collaborators.
    #[must_use]
    pub fn new(
        config: RouterConfig,
        counters: Arc<SessionCounterStore>,
        turn_log: Arc<TurnLog>,
        agent: Arc<dyn Agent>,
    ) -> Self {
        Self {
            config,
            counters,
            turn_log,
            agent,
        }
    }

    /// Reconciles persisted reset counters with suffixes observed in an
    /// external conversation-checkpoint namespace at startup, raising each
    /// (channel, chat_id) counter to the max of the two sources. Prevents
    /// thread-id collisions after restoring from backups.
    pub async fn reconcile_counters_at_startup(
        &self,
        observed: &[(ChannelName, ChatId, u64)],
    ) -> Result<(), RouterError> {
        for (channel, chat_id, suffix) in observed {
            self.counters
                .raise_to_at_least(channel, chat_id, *suffix)
                .await?;
        }
        Ok(())
    }

    /// Runs the full 12-step pipeline for one incoming message.
    pub async fn route(&self, msg: IncomingMessage) -> Result<RouterOutcome, RouterError> {
        // Step 1: authorization.
        let auth = self.config.authorization.get(msg.channel.as_ref());
        if !pipeline::is_authorized(auth, msg.user_id.as_ref()) {
            tracing::warn!(user_id = %msg.user_id, channel = %msg.channel, "message rejected: user not authorized");
            return Ok(RouterOutcome::NoResponse);
        }

        // Step 2: session reset.
        if msg.reset_session {
            self.counters.increment(&msg.channel, &msg.chat_id).await?;
            return Ok(RouterOutcome::NoResponse);
        }

        // Steps 3-4: trigger + empty gates.
        let Some(stripped) = pipeline::apply_trigger_gate(&msg, &self.config.trigger_prefix)
        else {
            return Ok(RouterOutcome::NoResponse);
        };
        let stripped = stripped.to_string();

        // Step 5: thread identity.
        let counter = self.counters.get(&msg.channel, &msg.chat_id).await?;
        let thread_id = thread_id_for(&msg.channel, &msg.chat_id, counter);

        // Step 6: context propagation, scoped for the remainder of this call.
        let chat_context = (msg.channel.clone(), msg.chat_id.clone());

        // Step 7: framing.
        let now = Utc::now();
        let prefix = pipeline::frame_prefix(&format_timestamp(now), &msg.display_name);
        let framed_text = format!("{prefix}{stripped}");
        let content = if let (Some(image), Some(mime)) =
            (&msg.image_base64, &msg.image_mime_type)
        {
            serde_json::json!([
                { "type": "text", "text": framed_text },
                { "type": "image", "data": image, "mime_type": mime },
            ])
        } else {
            serde_json::json!(framed_text)
        };

        // Step 8: persist user turn.
        if let Err(err) = self
            .turn_log
            .append(
                &thread_id,
                &TurnRecord {
                    role: Role::User,
                    content: framed_text.clone(),
                    timestamp: now,
                    channel: msg.channel.clone(),
                    user_id: Some(msg.user_id.clone()),
                },
            )
            .await
        {
            tracing::warn!(error = %err, "failed to persist user turn");
        }

        // Step 9: invoke agent, with the originating chat bound into scope
        // for any tool the agent calls during this invocation.
        let agent = Arc::clone(&self.agent);
        let thread_id_for_agent = thread_id.clone();
        let reply = ACTIVE_CHAT_CONTEXT
            .scope(chat_context, async move {
                agent
                    .invoke(
                        &thread_id_for_agent,
                        vec![AgentMessage {
                            role: "user".into(),
                            content,
                        }],
                    )
                    .await
            })
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = %err, "agent invocation failed");
                return Ok(RouterOutcome::Responded {
                    thread_id,
                    text: String::new(),
                });
            }
        };

        // Step 10: extract response (final text already in reply.events
        // order; AgentReply::final_text applies the "last TextEvent" rule).
        let final_text = reply.final_text();

        // Step 11: persist assistant turn.
        if let Err(err) = self
            .turn_log
            .append(
                &thread_id,
                &TurnRecord {
                    role: Role::Assistant,
                    content: final_text.clone(),
                    timestamp: Utc::now(),
                    channel: msg.channel.clone(),
                    user_id: None,
                },
            )
            .await
        {
            tracing::warn!(error = %err, "failed to persist assistant turn");
        }

        // Step 12: return.
        Ok(RouterOutcome::Responded {
            thread_id,
            text: final_text,
        })
    }
}
