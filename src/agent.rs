//! The agent contract (external collaborator, §6).
//!
//! The agent's own LLM, tool loop, and memory are explicitly out of scope.
//! This module defines the narrow boundary the router and scheduler invoke
//! across, plus a trivial test double used by this crate's own tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain_types::ThreadId;
use crate::event::Event;

/// One message in the list handed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// `"user"` or `"assistant"`.
    pub role: String,
    /// Either a plain string or a multimodal content pair, represented as
    /// pre-serialized JSON so this crate never needs to understand the
    /// agent's own multimodal schema.
    pub content: serde_json::Value,
}

/// The agent's structured reply: an ordered event list the router unpacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReply {
    /// Ordered events produced by this turn.
    pub events: Vec<Event>,
}

impl AgentReply {
    /// The final text the router persists and returns to the channel.
    #[must_use]
    pub fn final_text(&self) -> String {
        crate::event::final_text(&self.events)
    }
}

/// Errors reported back across the agent boundary. The router and scheduler
/// log and continue on any of these; they never crash the process.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent collaborator itself failed (timeout, tool error, etc).
    #[error("agent invocation failed: {reason}")]
    InvocationFailed {
        /// A human-readable description of the failure.
        reason: String,
    },
}

/// The narrow boundary this crate invokes across into the (out-of-scope)
/// LLM agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Invokes the agent with `messages` under the given conversational
    /// `thread_id`, returning its structured reply.
    async fn invoke(
        &self,
        thread_id: &ThreadId,
        messages: Vec<AgentMessage>,
    ) -> Result<AgentReply, AgentError>;
}

/// A test double that echoes the last user message back as a single text
/// event. Used by this crate's own router/scheduler tests; not a stand-in
/// for a real LLM integration.
#[derive(Debug, Default)]
pub struct NullAgent;

#[async_trait]
impl Agent for NullAgent {
    async fn invoke(
        &self,
        _thread_id: &ThreadId,
        messages: Vec<AgentMessage>,
    ) -> Result<AgentReply, AgentError> {
        let last_text = messages
            .last()
            .and_then(|m| m.content.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(AgentReply {
            events: vec![Event::Text { content: last_text }],
        })
    }
}
