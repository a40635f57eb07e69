//! # CianaParrot core
//!
//! A self-hosted personal-assistant runtime bridging a chat channel to an
//! LLM-driven agent. This crate implements the four subsystems that carry
//! this project's hard engineering:
//!
//! - [`router`]: message normalization, authorization, trigger parsing,
//!   session identity, and durable turn logging.
//! - [`scheduler`]: a concurrent cron/interval/once task engine.
//! - [`gateway`]: an authenticated HTTP command executor with per-bridge
//!   allowlists and sandboxed working directories.
//! - [`bridge`]: per-user sessions over a streaming NDJSON CLI.
//!
//! [`dispatch`] wires an inbound [`channel`] message to either [`bridge`] or
//! [`router`], the mode-intercept split named in the data flow above.
//! Supporting persistence lives in [`task_store`] and [`user_state`]; the
//! agent and channel are modeled as narrow external-collaborator traits in
//! [`agent`] and [`channel`].
//!
//! ## Architecture
//!
//! Components that own durable state (`task_store`, `user_state`,
//! `turn_log`) separate pure (de)serialization and validation logic from
//! the async I/O shell that performs file or process work, the same
//! functional-core/imperative-shell split used throughout this crate.

pub mod agent;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod domain_types;
pub mod event;
pub mod gateway;
pub mod observability;
pub mod router;
pub mod scheduler;
pub mod task_store;
pub mod time_provider;
pub mod turn_log;
pub mod user_state;

pub use agent::{Agent, AgentError, AgentMessage, AgentReply, NullAgent};
pub use channel::{Channel, ChannelError, ChannelRegistry, RecordingChannel};
pub use config::{AppConfig, ConfigError};
pub use event::Event;
