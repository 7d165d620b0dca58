//! # logos-sync: Document sync provider for Logos
//!
//! Keeps a shared Yrs document consistent across clients by combining a
//! row store (durable snapshots) with a broadcast channel (low-latency
//! fan-out). Presence is propagated but never persisted.
//!
//! ## Architecture
//!
//! ```text
//!  local edit
//!      │
//!      ▼
//! ┌──────────────┐ debounced ┌───────────────────┐ 200/201 ┌─────────────────┐
//! │ SharedDoc    │──────────►│ PersistenceBridge │────────►│ BroadcastBridge │
//! │ (yrs)        │           │ (RowStore upsert) │         │ (Channel.send)  │
//! └──────▲───────┘           └───────────────────┘         └────────┬────────┘
//!        │ merge (origin = provider, never re-sent)                 │
//!        └──────────────────────────────────────── peers ◄──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`provider`]: `SyncProvider` actor: lifecycle state machine + loop guard
//! - [`batcher`]: per-stream debounce
//! - [`persistence`] / [`bridge`]: storage and broadcast sides
//! - [`document`] / [`presence`]: the replicated state
//! - [`storage`]: `RowStore` with memory and RocksDB backends
//! - [`transport`]: `Channel`s over an in-process hub or WebSocket
//! - [`relay`]: WebSocket relay server for [`WsTransport`]
//! - [`codec`]: base64 payloads and relay frames

pub mod batcher;
pub mod bridge;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod document;
pub mod events;
pub mod guard;
pub mod host;
pub mod persistence;
pub mod presence;
pub mod provider;
pub mod relay;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use codec::{decode_payload, encode_payload, BroadcastEvent, BroadcastMessage, CodecError, Frame};
pub use config::{ConfigError, ConfigUpdate, DatabaseDetails, ProviderConfig, UpdateColumns};
pub use document::{DocumentError, OriginTag, ReplicaId, SharedDocument};
pub use events::{ConnectionStatus, EventKind, ListenerId, ProviderEvent};
pub use host::{HostLifecycle, HostSignal};
pub use persistence::PersistError;
pub use presence::{Presence, PresenceChange, PresenceError};
pub use provider::{ProviderBuilder, ProviderError, SyncProvider};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use storage::{MemoryStore, RocksStore, RowStore, StoreConfig, StoreError, TableRef};
pub use transport::{Channel, ChannelStatus, LocalHub, Transport, TransportError, WsTransport};
