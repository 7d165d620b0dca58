//! WebSocket relay: the broadcast service behind [`WsTransport`](crate::transport::WsTransport).
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (topic) ── BroadcastGroup ──┬──► Client B
//! Client B ──┘                                     └──► Client C
//! ```
//!
//! The relay keeps no document state and persists nothing. The first
//! frame of a connection must be `Join`; every later `Broadcast` is fanned
//! out to the other members of the room, never back to its sender.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::codec::Frame;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// An encoded `Broadcast` frame plus its sender.
#[derive(Debug, Clone)]
struct Relayed {
    from: Uuid,
    bytes: Arc<Vec<u8>>,
}

type RelayError = Box<dyn std::error::Error + Send + Sync>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager<Relayed>>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager<Relayed>>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::debug!("websocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<(String, Uuid, Arc<BroadcastGroup<Relayed>>)> = None;
        let mut relay_rx: Option<broadcast::Receiver<Relayed>> = None;

        let result: Result<(), RelayError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let data = match msg {
                            Some(Ok(Message::Binary(data))) => data,
                            Some(Ok(Message::Close(_))) | None => {
                                log::debug!("connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Err(e)) => {
                                log::warn!("websocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        let frame = match Frame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("failed to decode frame from {addr}: {e}");
                                continue;
                            }
                        };
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }

                        match frame {
                            Frame::Join { topic, member } if session.is_none() => {
                                let (room, rx) = rooms.join(&topic, member).await;
                                relay_rx = Some(rx);
                                let members = room.member_count().await;
                                stats.write().await.active_rooms = rooms.room_count().await;

                                let ack = Frame::Joined { topic: topic.clone(), members }.encode()?;
                                ws_sender.send(Message::Binary(ack.into())).await?;
                                log::info!("member {member} joined {topic} ({members} members)");
                                session = Some((topic, member, room));
                            }
                            Frame::Join { topic, .. } => {
                                log::warn!("{addr} tried to join {topic} twice");
                            }
                            Frame::Broadcast { from, .. } => match &session {
                                Some((topic, member, room)) if from == *member => {
                                    let reached = room.send(Relayed {
                                        from,
                                        bytes: Arc::new(data.to_vec()),
                                    });
                                    log::trace!("relayed broadcast on {topic} to {} members", reached.saturating_sub(1));
                                }
                                Some(_) => log::warn!("{addr} sent a broadcast for another member"),
                                None => log::warn!("{addr} sent a broadcast before joining"),
                            },
                            Frame::Ping => {
                                let pong = Frame::Pong.encode()?;
                                ws_sender.send(Message::Binary(pong.into())).await?;
                            }
                            Frame::Leave => {
                                log::debug!("{addr} left");
                                break;
                            }
                            Frame::Joined { .. } | Frame::Pong => {}
                        }
                    }

                    msg = async {
                        match relay_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(relayed) => {
                                // Don't echo back to sender
                                let own = session.as_ref().is_some_and(|(_, member, _)| *member == relayed.from);
                                if !own {
                                    ws_sender.send(Message::Binary(relayed.bytes.to_vec().into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("{addr} lagged by {n} messages");
                                if let Some((_, _, room)) = &session {
                                    room.record_dropped(n);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: leave the room, drop it when empty
        if let Some((topic, member, room)) = session {
            room.leave(&member).await;
            if rooms.remove_if_empty(&topic).await {
                log::info!("room {topic} removed (empty)");
            }
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }

        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_fresh_relay_has_no_rooms() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.room_count().await, 0);
        assert_eq!(relay.stats().await, RelayStats::default());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Arc::new(RelayServer::with_defaults());
        let server = relay.clone();
        tokio::spawn(async move { server.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws.send(Message::Binary(Frame::Ping.encode().unwrap().into()))
            .await
            .unwrap();

        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    assert_eq!(Frame::decode(&data).unwrap(), Frame::Pong);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(relay.stats().await.total_messages >= 1);
    }
}
