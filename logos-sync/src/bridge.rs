//! Broadcast bridge: owns the active channel and frames outbound payloads.

use std::sync::Arc;

use crate::codec::{BroadcastEvent, BroadcastMessage};
use crate::transport::{BroadcastHandler, Channel, StatusCallback, Transport};

/// Fire-and-forget sender over at most one channel at a time.
pub struct BroadcastBridge {
    transport: Arc<dyn Transport>,
    channel: Option<Box<dyn Channel>>,
}

impl BroadcastBridge {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            channel: None,
        }
    }

    /// Create the channel for `topic`, register both receive handlers and
    /// subscribe. Any previous channel must be disconnected first.
    pub fn connect(
        &mut self,
        topic: &str,
        on_update: BroadcastHandler,
        on_presence: BroadcastHandler,
        status: StatusCallback,
    ) {
        if let Some(existing) = &self.channel {
            log::warn!("bridge already armed on {}, ignoring connect", existing.topic());
            return;
        }
        let mut channel = self.transport.channel(topic);
        channel.on(BroadcastEvent::Update, on_update);
        channel.on(BroadcastEvent::Presence, on_presence);
        channel.subscribe(status);
        self.channel = Some(channel);
    }

    /// Send full document state. Returns whether a channel took it.
    pub async fn send_update(&self, state: &[u8]) -> bool {
        self.send(BroadcastMessage::update(state)).await
    }

    /// Send a presence delta. Returns whether a channel took it.
    pub async fn send_presence(&self, delta: &[u8]) -> bool {
        self.send(BroadcastMessage::presence(delta)).await
    }

    async fn send(&self, message: BroadcastMessage) -> bool {
        let Some(channel) = &self.channel else {
            log::debug!("no active channel, dropping {} broadcast", message.event.as_str());
            return false;
        };
        match channel.send(message).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("broadcast on {} failed: {e}", channel.topic());
                false
            }
        }
    }

    /// Unsubscribe and forget the channel.
    pub async fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            log::debug!("unsubscribing from {}", channel.topic());
            channel.unsubscribe().await;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.channel.is_some()
    }

    pub fn topic(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.topic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelStatus, LocalHub};
    use tokio::sync::mpsc;

    fn noop_handler() -> BroadcastHandler {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_send_without_channel_is_noop() {
        let bridge = BroadcastBridge::new(Arc::new(LocalHub::new()));
        assert!(!bridge.is_armed());
        assert!(!bridge.send_update(b"state").await);
        assert!(!bridge.send_presence(b"delta").await);
    }

    #[tokio::test]
    async fn test_bridges_exchange_updates() {
        let hub = LocalHub::new();

        let (status_tx, mut statuses) = mpsc::unbounded_channel();
        let status: StatusCallback = Arc::new(move |s| {
            let _ = status_tx.send(s);
        });

        let mut sender = BroadcastBridge::new(Arc::new(hub.clone()));
        sender.connect("doc-1", noop_handler(), noop_handler(), status.clone());

        let (update_tx, mut updates) = mpsc::unbounded_channel();
        let mut receiver = BroadcastBridge::new(Arc::new(hub.clone()));
        receiver.connect(
            "doc-1",
            Arc::new(move |msg| {
                let _ = update_tx.send(msg);
            }),
            noop_handler(),
            status,
        );

        assert_eq!(statuses.recv().await, Some(ChannelStatus::Subscribed));
        assert_eq!(statuses.recv().await, Some(ChannelStatus::Subscribed));
        assert_eq!(sender.topic(), Some("doc-1"));

        assert!(sender.send_update(b"full state").await);
        let msg = updates.recv().await.unwrap();
        assert_eq!(msg.event, BroadcastEvent::Update);
        assert_eq!(msg.decode_payload().unwrap(), b"full state");

        sender.disconnect().await;
        assert!(!sender.is_armed());
        assert!(!sender.send_update(b"late").await);
    }
}
