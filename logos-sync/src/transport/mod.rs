//! Pub/sub collaborator: named channels carrying [`BroadcastMessage`]s.
//!
//! A [`Transport`] hands out one [`Channel`] per topic. The channel
//! lifecycle mirrors a realtime broadcast service:
//!
//! ```text
//! channel(topic) ──► on(event, handler)* ──► subscribe(status_cb)
//!                                               │
//!        SUBSCRIBED ◄───────────────────────────┤
//!        TIMED_OUT | CHANNEL_ERROR | CLOSED ◄───┘ (any time after)
//! ```
//!
//! Handlers must be registered before `subscribe`. Messages a channel
//! sends are never delivered back to that same channel.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::{BroadcastEvent, BroadcastMessage, CodecError};

pub mod local;
pub mod ws;

pub use local::{HubFrame, LocalChannel, LocalHub};
pub use ws::{WsChannel, WsTransport};

/// Status reported through the subscribe callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        }
    }

    /// Whether the channel is gone after this status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChannelStatus::Subscribed)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receive handler for one broadcast event.
pub type BroadcastHandler = Arc<dyn Fn(BroadcastMessage) + Send + Sync>;

/// Subscription status callback.
pub type StatusCallback = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// A named broadcast channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    /// Register a receive handler for `event`.
    fn on(&mut self, event: BroadcastEvent, handler: BroadcastHandler);

    /// Start the subscription. Status changes arrive through `callback`,
    /// possibly from another task.
    fn subscribe(&mut self, callback: StatusCallback);

    /// Send to every other subscriber of the topic.
    async fn send(&self, message: BroadcastMessage) -> Result<(), TransportError>;

    /// Leave the topic and stop delivering messages.
    async fn unsubscribe(&mut self);
}

/// Factory for channels.
pub trait Transport: Send + Sync {
    fn channel(&self, topic: &str) -> Box<dyn Channel>;
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel is not subscribed")]
    NotSubscribed,
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Handlers registered on a channel, keyed by event.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    entries: Vec<(BroadcastEvent, BroadcastHandler)>,
}

impl Handlers {
    pub(crate) fn push(&mut self, event: BroadcastEvent, handler: BroadcastHandler) {
        self.entries.push((event, handler));
    }

    pub(crate) fn dispatch(&self, message: BroadcastMessage) {
        for (event, handler) in &self.entries {
            if *event == message.event {
                handler(message.clone());
            }
        }
    }
}
