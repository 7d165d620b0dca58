//! WebSocket transport talking to a [`RelayServer`](crate::relay::RelayServer).
//!
//! Each subscribed channel owns one connection:
//!
//! ```text
//! connect ──► Join{topic, member} ──► await Joined ──► SUBSCRIBED
//!    │                                   │ timeout ──► TIMED_OUT
//!    └─ error ──► CHANNEL_ERROR          └ close   ──► CLOSED
//! ```
//!
//! Once subscribed, a reader loop dispatches relayed broadcasts and a
//! writer task drains the outgoing queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{BroadcastHandler, Channel, ChannelStatus, Handlers, StatusCallback, Transport, TransportError};
use crate::codec::{BroadcastEvent, BroadcastMessage, Frame};

const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTGOING_CAPACITY: usize = 256;

type Outgoing = Arc<Mutex<Option<mpsc::Sender<Frame>>>>;

/// Channels over WebSocket connections to one relay URL.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    subscribe_timeout: Duration,
}

impl WsTransport {
    /// `url` like `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
        }
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn channel(&self, topic: &str) -> Box<dyn Channel> {
        Box::new(WsChannel {
            member: Uuid::new_v4(),
            topic: topic.to_string(),
            url: self.url.clone(),
            subscribe_timeout: self.subscribe_timeout,
            handlers: Handlers::default(),
            outgoing: Arc::new(Mutex::new(None)),
            callback: None,
            task: None,
        })
    }
}

/// One WebSocket-backed channel.
pub struct WsChannel {
    member: Uuid,
    topic: String,
    url: String,
    subscribe_timeout: Duration,
    handlers: Handlers,
    outgoing: Outgoing,
    callback: Option<StatusCallback>,
    task: Option<JoinHandle<()>>,
}

impl WsChannel {
    pub fn member_id(&self) -> Uuid {
        self.member
    }

    fn sender(&self) -> Option<mpsc::Sender<Frame>> {
        self.outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn take_sender(&self) -> Option<mpsc::Sender<Frame>> {
        self.outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl Channel for WsChannel {
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

        let session = Session {
            url: self.url.clone(),
            topic: self.topic.clone(),
            member: self.member,
            subscribe_timeout: self.subscribe_timeout,
            handlers: self.handlers.clone(),
            outgoing: self.outgoing.clone(),
        };
        self.task = Some(tokio::spawn(async move {
            let status = session.run(&callback).await;
            session.clear_outgoing();
            callback(status);
        }));
    }

    async fn send(&self, message: BroadcastMessage) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::NotSubscribed)?;
        tx.send(Frame::Broadcast {
            from: self.member,
            message,
        })
        .await
        .map_err(|_| TransportError::Closed)
    }

    async fn unsubscribe(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(tx) = self.take_sender() {
            // The writer closes the socket after Leave.
            let _ = tx.send(Frame::Leave).await;
        }
        task.abort();
        if let Some(callback) = self.callback.take() {
            callback(ChannelStatus::Closed);
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State moved into the connection task.
struct Session {
    url: String,
    topic: String,
    member: Uuid,
    subscribe_timeout: Duration,
    handlers: Handlers,
    outgoing: Outgoing,
}

impl Session {
    /// Drive the connection until it ends; returns the terminal status.
    async fn run(&self, callback: &StatusCallback) -> ChannelStatus {
        let ws = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::warn!("connect to {} failed: {e}", self.url);
                return ChannelStatus::ChannelError;
            }
        };
        let (mut writer, mut reader) = ws.split();

        let join = Frame::Join {
            topic: self.topic.clone(),
            member: self.member,
        };
        let bytes = match join.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("cannot encode join frame: {e}");
                return ChannelStatus::ChannelError;
            }
        };
        if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
            log::warn!("join {} failed: {e}", self.topic);
            return ChannelStatus::ChannelError;
        }

        let joined = tokio::time::timeout(self.subscribe_timeout, async {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if let Ok(Frame::Joined { members, .. }) = Frame::decode(&data) {
                            return Ok(members);
                        }
                    }
                    Ok(Message::Close(_)) => return Err(ChannelStatus::Closed),
                    Err(e) => {
                        log::warn!("join {} failed: {e}", self.topic);
                        return Err(ChannelStatus::ChannelError);
                    }
                    _ => {}
                }
            }
            Err(ChannelStatus::Closed)
        })
        .await;

        match joined {
            Ok(Ok(members)) => {
                log::info!("joined {} ({members} members)", self.topic);
            }
            Ok(Err(status)) => return status,
            Err(_) => {
                log::warn!("join {} timed out after {:?}", self.topic, self.subscribe_timeout);
                return ChannelStatus::TimedOut;
            }
        }

        let (tx, mut rx) = mpsc::channel::<Frame>(OUTGOING_CAPACITY);
        *self
            .outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);

        // Writer task: forward outgoing frames to the socket
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let leaving = matches!(frame, Frame::Leave);
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
                if leaving {
                    let _ = writer.close().await;
                    break;
                }
            }
        });

        callback(ChannelStatus::Subscribed);

        let status = loop {
            match reader.next().await {
                Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                    Ok(Frame::Broadcast { from, message }) if from != self.member => {
                        self.handlers.dispatch(message);
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("undecodable frame on {}: {e}", self.topic),
                },
                Some(Ok(Message::Close(_))) | None => break ChannelStatus::Closed,
                Some(Err(e)) => {
                    log::warn!("read error on {}: {e}", self.topic);
                    break ChannelStatus::Closed;
                }
                Some(Ok(_)) => {}
            }
        };

        writer_task.abort();
        status
    }

    fn clear_outgoing(&self) {
        self.outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}
