//! Mode-intercept dispatch between the normal routing path and the bridge
//! session manager. Per `spec.md` §2: "the Channel may route a user's
//! messages directly to [the Bridge Session Manager], bypassing the Router
//! and Agent" — this module is that routing decision, wired as the
//! callback a [`Channel`](crate::channel::Channel) invokes for each inbound
//! message.

use std::sync::Arc;

use thiserror::Error;

use crate::bridge::{BridgeError, BridgeSessionManager};
use crate::channel::ChannelRegistry;
use crate::event::final_text;
use crate::router::{IncomingMessage, MessageRouter, RouterError, RouterOutcome};

/// Errors surfaced while dispatching one incoming message.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The router's pipeline failed.
    #[error("router error: {0}")]
    Router(#[from] RouterError),
    /// The bridge session manager's store failed.
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

/// Wires a [`MessageRouter`] and an optional [`BridgeSessionManager`] to a
/// [`ChannelRegistry`]: a user currently in bridge mode is handled entirely
/// by the bridge, bypassing the router and agent; everyone else goes
/// through the normal routing pipeline. Either path's reply text is sent
/// back out the channel the message arrived on.
pub struct Dispatcher {
    router: Arc<MessageRouter>,
    bridge: Option<Arc<BridgeSessionManager>>,
    channels: Arc<ChannelRegistry>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given collaborators. `bridge` is
    /// `None` when the bridge feature is unconfigured, in which case every
    /// message goes through `router`.
    #[must_use]
    pub fn new(
        router: Arc<MessageRouter>,
        bridge: Option<Arc<BridgeSessionManager>>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            router,
            bridge,
            channels,
        }
    }

    /// Handles one inbound message end to end: picks the bridge or router
    /// path, then sends the resulting text back out the originating
    /// channel. A `NoResponse` outcome or an empty reply sends nothing.
    pub async fn handle(&self, msg: IncomingMessage) -> Result<(), DispatchError> {
        let reply = self.resolve_reply(msg.clone()).await?;

        let Some(text) = reply.filter(|text| !text.is_empty()) else {
            return Ok(());
        };

        let Some(channel) = self.channels.get(msg.channel.as_ref()) else {
            tracing::warn!(channel = %msg.channel, "dispatched reply references unknown channel");
            return Ok(());
        };
        if let Err(err) = channel.send(msg.chat_id.as_ref(), &text, true).await {
            tracing::warn!(error = %err, "failed to deliver dispatched reply");
        }
        Ok(())
    }

    async fn resolve_reply(&self, msg: IncomingMessage) -> Result<Option<String>, DispatchError> {
        if let Some(bridge) = &self.bridge {
            if bridge.is_bridged(&msg.user_id).await? {
                let response = bridge.send_message(&msg.user_id, &msg.text).await?;
                return Ok(Some(match response.error {
                    Some(error) => error,
                    None => final_text(&response.events),
                }));
            }
        }

        match self.router.route(msg).await? {
            RouterOutcome::NoResponse => Ok(None),
            RouterOutcome::Responded { text, .. } => Ok(Some(text)),
        }
    }
}
