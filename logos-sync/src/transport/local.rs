//! In-process broadcast hub.
//!
//! Every [`LocalChannel`] for the same topic on the same [`LocalHub`]
//! shares one [`BroadcastGroup`]. Useful for tests and for several
//! providers living in one process.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{BroadcastHandler, Channel, ChannelStatus, Handlers, StatusCallback, Transport, TransportError};
use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::codec::{BroadcastEvent, BroadcastMessage};

/// Default per-member buffer.
const DEFAULT_CAPACITY: usize = 256;

/// Item routed through a hub room.
#[derive(Debug, Clone)]
pub enum HubFrame {
    Broadcast { from: Uuid, message: BroadcastMessage },
    /// Status pushed to every member (simulated outage)
    Status(ChannelStatus),
}

/// In-process transport. Clones share the same rooms.
#[derive(Clone)]
pub struct LocalHub {
    rooms: Arc<RoomManager<HubFrame>>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(capacity)),
        }
    }

    /// Push a status to every member of `topic`. Terminal statuses make
    /// the members leave the room. Returns how many members were reached.
    pub async fn interrupt(&self, topic: &str, status: ChannelStatus) -> usize {
        match self.rooms.get(topic).await {
            Some(room) => room.send(HubFrame::Status(status)),
            None => 0,
        }
    }

    pub async fn member_count(&self, topic: &str) -> usize {
        match self.rooms.get(topic).await {
            Some(room) => room.member_count().await,
            None => 0,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }
}

impl Transport for LocalHub {
    fn channel(&self, topic: &str) -> Box<dyn Channel> {
        Box::new(LocalChannel::new(self.rooms.clone(), topic))
    }
}

/// One member's view of a hub topic.
pub struct LocalChannel {
    id: Uuid,
    topic: String,
    rooms: Arc<RoomManager<HubFrame>>,
    handlers: Handlers,
    joined: Arc<RwLock<Option<Arc<BroadcastGroup<HubFrame>>>>>,
    callback: Option<StatusCallback>,
    task: Option<JoinHandle<()>>,
}

impl LocalChannel {
    fn new(rooms: Arc<RoomManager<HubFrame>>, topic: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            rooms,
            handlers: Handlers::default(),
            joined: Arc::new(RwLock::new(None)),
            callback: None,
            task: None,
        }
    }

    pub fn member_id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn on(&mut self, event: BroadcastEvent, handler: BroadcastHandler) {
        self.handlers.push(event, handler);
    }

    fn subscribe(&mut self, callback: StatusCallback) {
        if self.task.is_some() {
            log::warn!("channel {} already subscribed", self.topic);
            return;
        }
        self.callback = Some(callback.clone());

        let id = self.id;
        let topic = self.topic.clone();
        let rooms = self.rooms.clone();
        let handlers = self.handlers.clone();
        let joined = self.joined.clone();

        self.task = Some(tokio::spawn(async move {
            let (room, mut rx) = rooms.join(&topic, id).await;
            *joined.write().await = Some(room.clone());
            callback(ChannelStatus::Subscribed);

            loop {
                match rx.recv().await {
                    Ok(HubFrame::Broadcast { from, message }) => {
                        if from != id {
                            handlers.dispatch(message);
                        }
                    }
                    Ok(HubFrame::Status(status)) => {
                        if status.is_terminal() {
                            *joined.write().await = None;
                            room.leave(&id).await;
                            rooms.remove_if_empty(&topic).await;
                            callback(status);
                            break;
                        }
                        callback(status);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("channel {topic} lagged, skipped {skipped} messages");
                        room.record_dropped(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        *joined.write().await = None;
                        callback(ChannelStatus::Closed);
                        break;
                    }
                }
            }
        }));
    }

    async fn send(&self, message: BroadcastMessage) -> Result<(), TransportError> {
        let joined = self.joined.read().await;
        let room = joined.as_ref().ok_or(TransportError::NotSubscribed)?;
        let reached = room.send(HubFrame::Broadcast {
            from: self.id,
            message,
        });
        log::trace!("hub {}: delivered to {reached} receivers", self.topic);
        Ok(())
    }

    async fn unsubscribe(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();

        let room = self.joined.write().await.take();
        if let Some(room) = room {
            room.leave(&self.id).await;
            self.rooms.remove_if_empty(&self.topic).await;
        }
        if let Some(callback) = self.callback.take() {
            callback(ChannelStatus::Closed);
        }
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
