//! The channel contract (external collaborator, §6): the chat transport
//! (e.g. Telegram) the router and scheduler send outbound messages through.
//! The wire protocol itself is out of scope; this module defines the
//! send-side boundary, the receive-side lifecycle (`start`/`stop` plus a
//! callback a channel invokes per inbound message), and a recording test
//! double exercising both directions.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::router::IncomingMessage;

/// The future a [`MessageCallback`] returns.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The callback a channel invokes once per inbound message after
/// [`Channel::start`] registers it, typically wiring straight into a
/// [`crate::router::MessageRouter`] or bridge dispatcher.
pub type MessageCallback = Arc<dyn Fn(IncomingMessage) -> BoxFuture + Send + Sync>;

/// Errors reported when a send to a channel fails.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The named channel has no registered adapter.
    #[error("unknown channel: {name}")]
    UnknownChannel {
        /// The channel name that was not found.
        name: String,
    },
    /// The adapter itself failed to deliver the message.
    #[error("send failed: {reason}")]
    SendFailed {
        /// A human-readable description of the failure.
        reason: String,
    },
}

/// A chat transport capable of sending text and files to a chat id.
///
/// Implementations are responsible for per-chat serialization, media
/// decoding, and chunking of long outputs at their own wire limit, per §6.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Sends `text` to `chat_id`. `notify` controls whether the recipient is
    /// actively notified (scheduler results are sent with `notify = false`).
    async fn send(&self, chat_id: &str, text: &str, notify: bool) -> Result<(), ChannelError>;

    /// Sends a file at `path` to `chat_id` with an optional caption.
    async fn send_file(
        &self,
        chat_id: &str,
        path: &std::path::Path,
        caption: Option<&str>,
    ) -> Result<(), ChannelError>;

    /// Starts this channel's receive side, registering `on_message` as the
    /// callback invoked once per inbound message. Implementations that poll
    /// or long-poll an external API spawn their own background task here;
    /// this returns once that task is running, not when it exits.
    async fn start(&self, on_message: MessageCallback) -> Result<(), ChannelError>;

    /// Stops whatever `start` began. A channel that was never started, or
    /// already stopped, treats this as a no-op.
    async fn stop(&self) -> Result<(), ChannelError>;
}

/// A record of one call made against a [`RecordingChannel`], used by tests
/// to assert what was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// The destination chat id.
    pub chat_id: String,
    /// The text that was sent.
    pub text: String,
    /// Whether the send requested recipient notification.
    pub notify: bool,
}

/// A channel test double that records every send instead of delivering it,
/// and stands in for a real wire transport's receive side: [`Self::deliver`]
/// simulates one inbound message arriving, invoking whatever callback
/// [`Channel::start`] most recently registered.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<SentMessage>>,
    on_message: Mutex<Option<MessageCallback>>,
}

impl RecordingChannel {
    /// Returns a copy of every message recorded so far, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("recording channel mutex poisoned").clone()
    }

    /// Simulates `msg` arriving on this channel. A no-op if no callback has
    /// been registered via [`Channel::start`].
    pub async fn deliver(&self, msg: IncomingMessage) {
        let callback = self
            .on_message
            .lock()
            .expect("recording channel mutex poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(msg).await;
        }
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    async fn send(&self, chat_id: &str, text: &str, notify: bool) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .expect("recording channel mutex poisoned")
            .push(SentMessage {
                chat_id: chat_id.to_string(),
                text: text.to_string(),
                notify,
            });
        Ok(())
    }

    async fn send_file(
        &self,
        _chat_id: &str,
        _path: &std::path::Path,
        _caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn start(&self, on_message: MessageCallback) -> Result<(), ChannelError> {
        *self.on_message.lock().expect("recording channel mutex poisoned") = Some(on_message);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        *self.on_message.lock().expect("recording channel mutex poisoned") = None;
        Ok(())
    }
}

/// A registry of named channels, used by the scheduler to fan results back
/// out to whichever channel a task names.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: std::collections::HashMap<String, std::sync::Arc<dyn Channel>>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel implementation under `name`.
    pub fn register(&mut self, name: impl Into<String>, channel: std::sync::Arc<dyn Channel>) {
        self.channels.insert(name.into(), channel);
    }

    /// Looks up a channel by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&std::sync::Arc<dyn Channel>> {
        self.channels.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_channel_records_sends() {
        let channel = RecordingChannel::default();
        channel.send("42", "hello", false).await.unwrap();
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, "42");
        assert!(!sent[0].notify);
    }

    #[test]
    fn registry_looks_up_registered_channel() {
        let mut registry = ChannelRegistry::new();
        registry.register("telegram", std::sync::Arc::new(RecordingChannel::default()));
        assert!(registry.get("telegram").is_some());
        assert!(registry.get("discord").is_none());
    }

    fn incoming(text: &str) -> IncomingMessage {
        IncomingMessage {
            channel: crate::domain_types::ChannelName::try_new("telegram").unwrap(),
            chat_id: crate::domain_types::ChatId::try_new("42").unwrap(),
            user_id: crate::domain_types::UserId::try_new("7").unwrap(),
            display_name: "Ada".into(),
            text: text.into(),
            is_private: true,
            message_id: None,
            image_base64: None,
            image_mime_type: None,
            reset_session: false,
        }
    }

    #[tokio::test]
    async fn deliver_before_start_is_a_noop() {
        let channel = RecordingChannel::default();
        channel.deliver(incoming("hello")).await;
    }

    #[tokio::test]
    async fn deliver_after_start_invokes_registered_callback() {
        let channel = RecordingChannel::default();
        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let received_for_callback = Arc::clone(&received);
        channel
            .start(Arc::new(move |msg: IncomingMessage| {
                let received = Arc::clone(&received_for_callback);
                Box::pin(async move {
                    received.lock().unwrap().push(msg.text);
                }) as BoxFuture
            }))
            .await
            .unwrap();

        channel.deliver(incoming("hello")).await;

        assert_eq!(received.lock().unwrap().as_slice(), ["hello".to_string()]);
    }

    #[tokio::test]
    async fn stop_clears_the_registered_callback() {
        let channel = RecordingChannel::default();
        channel
            .start(Arc::new(|_msg: IncomingMessage| Box::pin(async {}) as BoxFuture))
            .await
            .unwrap();
        channel.stop().await.unwrap();

        channel.deliver(incoming("hello")).await;

        assert!(channel.sent().is_empty());
    }
}
