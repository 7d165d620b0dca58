//! The sync provider: connection lifecycle state machine plus loop guard.
//!
//! One tokio task owns all protocol state. Everything that can change it
//! arrives as a message:
//!
//! ```text
//!  SyncProvider ── Command ──────────┐
//!  SharedDocument observer ── update ┤
//!  Presence observer ── change ──────┼──► ProviderTask (select! loop)
//!  Channel handlers ── NetworkEvent ─┤         │
//!  Debouncer deadlines ──────────────┘         ├──► PersistenceBridge
//!                                              ├──► BroadcastBridge
//!                                              └──► EventDispatcher
//! ```
//!
//! State machine:
//!
//! ```text
//!               connect()               SUBSCRIBED
//! Disconnected ──────────► Connecting ─────────────► Connected
//!      ▲                       │                         │
//!      └── TIMED_OUT | CLOSED | CHANNEL_ERROR | disconnect()
//! ```
//!
//! Every network callback carries the session generation it was created
//! for; callbacks from an abandoned channel are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::batcher::{self, Debouncer, DocumentBatch, PresenceBatch};
use crate::codec::{BroadcastEvent, BroadcastMessage};
use crate::config::{ConfigError, ConfigUpdate, ProviderConfig, SharedConfig};
use crate::document::{DocumentError, DocumentSubscription, DocumentUpdate, OriginTag, SharedDocument};
use crate::bridge::BroadcastBridge;
use crate::events::{ConnectionStatus, EventDispatcher, EventKind, ListenerId, ProviderEvent};
use crate::guard::LoopGuard;
use crate::host::{HookId, HostLifecycle};
use crate::persistence::{PersistError, PersistenceBridge};
use crate::presence::{Presence, PresenceChange};
use crate::storage::RowStore;
use crate::transport::{BroadcastHandler, ChannelStatus, StatusCallback, Transport};

/// Errors surfaced through [`ProviderEvent::Error`] and the provider API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("channel {topic} reported {status}")]
    Channel { topic: String, status: ChannelStatus },
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("provider task has stopped")]
    Stopped,
}

enum Command {
    Connect,
    Disconnect,
    Reconfigure,
    HostExit,
    Destroy(oneshot::Sender<()>),
}

/// Callback from a channel, stamped with its session generation.
struct NetworkEvent {
    generation: u64,
    kind: NetworkEventKind,
}

enum NetworkEventKind {
    Inbound(BroadcastMessage),
    Status(ChannelStatus),
}

/// Configures and starts a [`SyncProvider`].
pub struct ProviderBuilder {
    config: ProviderConfig,
    document: SharedDocument,
    store: Arc<dyn RowStore>,
    transport: Arc<dyn Transport>,
    presence: Option<Presence>,
    host: Option<Arc<dyn HostLifecycle>>,
    auto_connect: bool,
    events: EventDispatcher,
}

impl ProviderBuilder {
    pub fn new(
        config: ProviderConfig,
        document: SharedDocument,
        store: Arc<dyn RowStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            document,
            store,
            transport,
            presence: None,
            host: None,
            auto_connect: true,
            events: EventDispatcher::new(),
        }
    }

    /// Share an existing presence map (default: a fresh one for the document).
    pub fn presence(mut self, presence: Presence) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Register an exit hook on `host`.
    pub fn host(mut self, host: Arc<dyn HostLifecycle>) -> Self {
        self.host = Some(host);
        self
    }

    /// Connect right after spawning (default: true).
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Register a listener before the first event can fire.
    pub fn on<F>(self, kind: EventKind, listener: F) -> Self
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener);
        self
    }

    /// Start the provider task. Must be called within a tokio runtime.
    pub fn spawn(self) -> Result<SyncProvider, ProviderError> {
        let id = Uuid::new_v4();
        let origin = OriginTag::new(format!("logos-sync/provider/{id}"));
        let presence = self
            .presence
            .unwrap_or_else(|| Presence::for_document(&self.document));
        let quiescence = self.config.quiescence();
        let config = SharedConfig::new(self.config);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (doc_tx, doc_rx) = mpsc::unbounded_channel();
        let (net_tx, net_rx) = mpsc::unbounded_channel();

        let doc_subscription = self.document.observe(move |update| {
            let _ = doc_tx.send(update);
        })?;
        let presence_rx = presence.subscribe();

        let host = self.host.map(|host| {
            // Weak so the hook does not keep the task alive.
            let weak = commands.downgrade();
            let hook_id = host.subscribe(Arc::new(move || {
                if let Some(tx) = weak.upgrade() {
                    let _ = tx.send(Command::HostExit);
                }
            }));
            (host, hook_id)
        });

        let status = Arc::new(RwLock::new(ConnectionStatus::Disconnected));
        let apply_count = Arc::new(AtomicU64::new(0));
        let save_count = Arc::new(AtomicU64::new(0));

        let task = ProviderTask {
            guard: LoopGuard::new(origin.clone()),
            document: self.document.clone(),
            presence: presence.clone(),
            config: config.clone(),
            events: self.events.clone(),
            persistence: PersistenceBridge::new(self.store, config.clone()),
            bridge: BroadcastBridge::new(self.transport),
            status: status.clone(),
            apply_count: apply_count.clone(),
            save_count: save_count.clone(),
            generation: 0,
            net_tx,
            doc_batch: Debouncer::new(quiescence),
            presence_batch: Debouncer::new(quiescence),
            host,
            doc_subscription: Some(doc_subscription),
        };
        let handle = tokio::spawn(task.run(command_rx, doc_rx, presence_rx, net_rx));

        if self.auto_connect {
            let _ = commands.send(Command::Connect);
        }
        log::debug!("provider {id} started");

        Ok(SyncProvider {
            id,
            origin,
            document: self.document,
            presence,
            config,
            events: self.events,
            status,
            apply_count,
            save_count,
            commands,
            task: handle,
        })
    }
}

/// Handle to a running provider.
///
/// Dropping the handle tears the provider down like [`SyncProvider::destroy`]
/// (without waiting for it).
pub struct SyncProvider {
    id: Uuid,
    origin: OriginTag,
    document: SharedDocument,
    presence: Presence,
    config: SharedConfig,
    events: EventDispatcher,
    status: Arc<RwLock<ConnectionStatus>>,
    apply_count: Arc<AtomicU64>,
    save_count: Arc<AtomicU64>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SyncProvider {
    /// Shorthand for [`ProviderBuilder::new`].
    pub fn builder(
        config: ProviderConfig,
        document: SharedDocument,
        store: Arc<dyn RowStore>,
        transport: Arc<dyn Transport>,
    ) -> ProviderBuilder {
        ProviderBuilder::new(config, document, store, transport)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Origin attached to every merge this provider performs.
    pub fn origin(&self) -> &OriginTag {
        &self.origin
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    /// Remote states merged in the current session (initial fetch
    /// included). Reset by every connect.
    pub fn apply_count(&self) -> u64 {
        self.apply_count.load(Ordering::SeqCst)
    }

    /// Successful persists so far.
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }

    pub fn configuration(&self) -> ProviderConfig {
        self.config.snapshot()
    }

    /// Merge a partial configuration. An active session is not
    /// reconnected; a new quiescence window applies from the next edit.
    pub fn set_configuration(&self, update: ConfigUpdate) -> Result<(), ProviderError> {
        self.config.update(update);
        self.send(Command::Reconfigure)
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        self.events.on_any(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }

    /// Every subsequent event, as a stream.
    pub fn event_stream(&self) -> mpsc::UnboundedReceiver<ProviderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events.on_any(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Start connecting. No-op unless disconnected.
    pub fn connect(&self) -> Result<(), ProviderError> {
        self.send(Command::Connect)
    }

    /// Leave the channel. The provider can connect again later.
    pub fn disconnect(&self) -> Result<(), ProviderError> {
        self.send(Command::Disconnect)
    }

    /// Tear down: listeners, channel, observers, exit hook, timers, task.
    /// The document and presence map are left to their owner.
    pub async fn destroy(self) {
        self.events.clear();
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Destroy(ack)).is_ok() {
            let _ = done.await;
        }
        let _ = self.task.await;
        log::debug!("provider {} destroyed", self.id);
    }

    fn send(&self, command: Command) -> Result<(), ProviderError> {
        self.commands.send(command).map_err(|_| ProviderError::Stopped)
    }
}

impl std::fmt::Debug for SyncProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProvider")
            .field("id", &self.id)
            .field("name", &self.config.snapshot().name)
            .finish_non_exhaustive()
    }
}

// ───────────────────────────────────────────────────────────────────
// Provider task
// ───────────────────────────────────────────────────────────────────

struct ProviderTask {
    guard: LoopGuard,
    document: SharedDocument,
    presence: Presence,
    config: SharedConfig,
    events: EventDispatcher,
    persistence: PersistenceBridge,
    bridge: BroadcastBridge,
    status: Arc<RwLock<ConnectionStatus>>,
    apply_count: Arc<AtomicU64>,
    save_count: Arc<AtomicU64>,
    /// Current channel session; bumped whenever a channel is abandoned
    generation: u64,
    net_tx: mpsc::UnboundedSender<NetworkEvent>,
    doc_batch: Debouncer<DocumentBatch>,
    presence_batch: Debouncer<PresenceBatch>,
    host: Option<(Arc<dyn HostLifecycle>, HookId)>,
    doc_subscription: Option<DocumentSubscription>,
}

impl ProviderTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut doc_rx: mpsc::UnboundedReceiver<DocumentUpdate>,
        mut presence_rx: mpsc::UnboundedReceiver<PresenceChange>,
        mut net_rx: mpsc::UnboundedReceiver<NetworkEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Destroy(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Every handle is gone.
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = net_rx.recv() => self.handle_network(event).await,
                Some(update) = doc_rx.recv() => self.on_document_update(update),
                Some(change) = presence_rx.recv() => self.on_presence_change(change),
                _ = batcher::until(self.doc_batch.deadline()) => self.flush_document().await,
                _ = batcher::until(self.presence_batch.deadline()) => self.flush_presence().await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect().await,
            Command::Disconnect => self.disconnect().await,
            Command::Reconfigure => {
                let window = self.config.snapshot().quiescence();
                self.doc_batch.set_window(window);
                self.presence_batch.set_window(window);
            }
            Command::HostExit => self.on_host_exit().await,
            Command::Destroy(_) => {}
        }
    }

    async fn current_status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    async fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().await = status;
        self.events.emit(&ProviderEvent::Status(status));
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    async fn connect(&mut self) {
        let status = self.current_status().await;
        if status != ConnectionStatus::Disconnected {
            log::debug!("connect ignored: already {status}");
            return;
        }
        let config = self.config.snapshot();
        if let Err(e) = config.validate() {
            log::warn!("refusing to connect: {e}");
            self.events.emit(&ProviderEvent::Error(e.into()));
            return;
        }

        self.generation += 1;
        self.apply_count.store(0, Ordering::SeqCst);
        let generation = self.generation;
        let inbound = move |tx: mpsc::UnboundedSender<NetworkEvent>| -> BroadcastHandler {
            Arc::new(move |message| {
                let _ = tx.send(NetworkEvent {
                    generation,
                    kind: NetworkEventKind::Inbound(message),
                });
            })
        };
        let status_tx = self.net_tx.clone();
        let on_status: StatusCallback = Arc::new(move |status| {
            let _ = status_tx.send(NetworkEvent {
                generation,
                kind: NetworkEventKind::Status(status),
            });
        });

        log::info!("connecting to {}", config.name);
        self.bridge.connect(
            &config.name,
            inbound(self.net_tx.clone()),
            inbound(self.net_tx.clone()),
            on_status,
        );
        self.set_status(ConnectionStatus::Connecting).await;
    }

    async fn on_subscribed(&mut self) {
        if let Some(state) = self.persistence.fetch_initial().await {
            self.merge_remote_state(&state);
        }

        *self.status.write().await = ConnectionStatus::Connected;
        self.events.emit(&ProviderEvent::Connect);
        self.events.emit(&ProviderEvent::Status(ConnectionStatus::Connected));
        log::info!("connected to {}", self.config.snapshot().name);

        if self.presence.local_state().is_some() {
            let local = self.presence.local_id();
            match self.presence.encode_delta(&[local]) {
                Ok(delta) => {
                    self.bridge.send_presence(&delta).await;
                    self.events.emit(&ProviderEvent::Awareness(delta));
                }
                Err(e) => log::warn!("cannot encode local presence: {e}"),
            }
        }

        if self.doc_batch.is_held() {
            self.flush_document().await;
        }
    }

    /// Abandon the channel after it reported a terminal status.
    async fn on_channel_lost(&mut self, status: ChannelStatus) {
        if self.current_status().await == ConnectionStatus::Disconnected {
            return;
        }
        log::info!("channel {status}, disconnecting");
        self.generation += 1;
        self.bridge.disconnect().await;
        self.enter_disconnected().await;
    }

    async fn disconnect(&mut self) {
        self.generation += 1;
        self.bridge.disconnect().await;
        if self.current_status().await != ConnectionStatus::Disconnected {
            self.enter_disconnected().await;
        }
    }

    async fn enter_disconnected(&mut self) {
        *self.status.write().await = ConnectionStatus::Disconnected;

        let local = self.presence.local_id();
        let remote: Vec<_> = self
            .presence
            .states()
            .into_keys()
            .filter(|id| *id != local)
            .collect();
        if !remote.is_empty() {
            log::debug!("dropping {} remote presence entries", remote.len());
            self.presence.remove_entries(&remote, self.guard.origin());
        }

        self.events.emit(&ProviderEvent::Disconnect);
        self.events.emit(&ProviderEvent::Status(ConnectionStatus::Disconnected));
    }

    async fn shutdown(&mut self) {
        self.events.clear();
        self.generation += 1;
        self.bridge.disconnect().await;
        self.doc_subscription.take();
        if self.doc_batch.is_held() {
            log::warn!("discarding edits that were never stored");
        }
        self.doc_batch.cancel();
        self.presence_batch.cancel();
        if let Some((host, hook_id)) = self.host.take() {
            host.unsubscribe(hook_id);
        }
        *self.status.write().await = ConnectionStatus::Disconnected;
    }

    async fn on_host_exit(&mut self) {
        let local = self.presence.local_id();
        let change = self.presence.remove_entries(&[local], &OriginTag::host_exit());
        if change.is_empty() {
            return;
        }
        match self.presence.encode_delta(&[local]) {
            Ok(delta) => {
                if self.bridge.send_presence(&delta).await {
                    self.events.emit(&ProviderEvent::Awareness(delta));
                }
            }
            Err(e) => log::warn!("cannot encode presence removal: {e}"),
        }
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    async fn handle_network(&mut self, event: NetworkEvent) {
        if event.generation != self.generation {
            log::trace!("dropping callback from stale session {}", event.generation);
            return;
        }
        match event.kind {
            NetworkEventKind::Inbound(message) => self.on_inbound(message),
            NetworkEventKind::Status(ChannelStatus::Subscribed) => {
                if self.current_status().await == ConnectionStatus::Connecting {
                    self.on_subscribed().await;
                }
            }
            NetworkEventKind::Status(status) => {
                if status == ChannelStatus::ChannelError {
                    let topic = self.bridge.topic().unwrap_or_default().to_string();
                    self.events
                        .emit(&ProviderEvent::Error(ProviderError::Channel { topic, status }));
                }
                self.on_channel_lost(status).await;
            }
        }
    }

    fn on_inbound(&mut self, message: BroadcastMessage) {
        let payload = match message.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("discarding {} broadcast: {e}", message.event.as_str());
                return;
            }
        };
        match message.event {
            BroadcastEvent::Update => self.merge_remote_state(&payload),
            BroadcastEvent::Presence => {
                if let Err(e) = self.presence.apply_delta(&payload, self.guard.origin()) {
                    log::warn!("discarding presence delta: {e}");
                }
            }
        }
    }

    fn merge_remote_state(&mut self, state: &[u8]) {
        match self.document.apply_encoded_update(state, self.guard.origin()) {
            Ok(()) => {
                self.apply_count.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => log::warn!("discarding remote state: {e}"),
        }
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    fn on_document_update(&mut self, update: DocumentUpdate) {
        let echo = self.guard.is_echo(&update);
        self.doc_batch.push(|batch| {
            if echo {
                batch.echoed += 1;
            } else {
                batch.local += 1;
            }
        });
    }

    fn on_presence_change(&mut self, change: PresenceChange) {
        // Provider merges are not re-broadcast; host-exit removals were sent already.
        if self.guard.is_own(&change) || change.origin == OriginTag::host_exit() {
            return;
        }
        self.presence_batch.push(|batch| batch.record(&change));
    }

    async fn flush_document(&mut self) {
        // The stored row is a full snapshot: writing before this session
        // merged it would drop whatever peers stored meanwhile.
        if self.current_status().await != ConnectionStatus::Connected {
            self.doc_batch.hold();
            log::debug!("holding document flush until the stored state is merged");
            return;
        }
        let Some(batch) = self.doc_batch.take() else {
            return;
        };
        if !batch.has_local_changes() {
            log::trace!("skipping flush of {} echoed updates", batch.echoed);
            return;
        }
        log::debug!("flushing {} local updates", batch.local);

        let state = self.document.encode_full_state();
        match self.persistence.persist(&state).await {
            Ok(_) => {
                let saves = self.save_count.fetch_add(1, Ordering::SeqCst) + 1;
                self.events.emit(&ProviderEvent::Save(saves));
                self.bridge.send_update(&state).await;
            }
            Err(e) => {
                log::error!("{e}");
                self.events.emit(&ProviderEvent::Error(e.into()));
            }
        }
    }

    async fn flush_presence(&mut self) {
        let Some(batch) = self.presence_batch.take() else {
            return;
        };
        if batch.is_empty() {
            return;
        }
        let ids = batch.changed_ids();
        match self.presence.encode_delta(&ids) {
            Ok(delta) => {
                if self.bridge.send_presence(&delta).await {
                    self.events.emit(&ProviderEvent::Awareness(delta));
                }
            }
            Err(e) => log::warn!("cannot encode presence delta: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_payload;
    use crate::host::HostSignal;
    use crate::storage::{MemoryStore, Row, TableRef};
    use crate::transport::LocalHub;
    use std::time::Duration;

    fn spawn(name: &str, hub: &LocalHub, store: &Arc<MemoryStore>) -> SyncProvider {
        SyncProvider::builder(
            ProviderConfig::named(name),
            SharedDocument::new(),
            store.clone(),
            Arc::new(hub.clone()),
        )
        .spawn()
        .unwrap()
    }

    async fn wait_for(events: &mut mpsc::UnboundedReceiver<ProviderEvent>, wanted: &ProviderEvent) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if &event == wanted {
                    return;
                }
            }
            panic!("event stream ended before {wanted:?}");
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_connects_and_reports_status() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryStore::new());
        let provider = SyncProvider::builder(
            ProviderConfig::named("doc"),
            SharedDocument::new(),
            store,
            Arc::new(hub.clone()),
        )
        .auto_connect(false)
        .spawn()
        .unwrap();

        let mut events = provider.event_stream();
        assert_eq!(provider.status().await, ConnectionStatus::Disconnected);
        provider.connect().unwrap();

        wait_for(&mut events, &ProviderEvent::Status(ConnectionStatus::Connecting)).await;
        wait_for(&mut events, &ProviderEvent::Status(ConnectionStatus::Connected)).await;
        assert_eq!(provider.status().await, ConnectionStatus::Connected);
        assert_eq!(hub.member_count("doc").await, 1);

        provider.destroy().await;
        assert_eq!(hub.member_count("doc").await, 0);
    }

    #[tokio::test]
    async fn test_empty_name_refuses_to_connect() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryStore::new());
        let provider = SyncProvider::builder(
            ProviderConfig::default(),
            SharedDocument::new(),
            store,
            Arc::new(hub.clone()),
        )
        .auto_connect(false)
        .spawn()
        .unwrap();

        let mut events = provider.event_stream();
        provider.connect().unwrap();
        wait_for(
            &mut events,
            &ProviderEvent::Error(ProviderError::Config(ConfigError::EmptyName)),
        )
        .await;
        assert_eq!(provider.status().await, ConnectionStatus::Disconnected);
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_cleans_presence() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryStore::new());
        let provider = spawn("doc", &hub, &store);
        let mut events = provider.event_stream();
        wait_for(&mut events, &ProviderEvent::Connect).await;

        provider.presence().set_local_field("name", "me".into());
        let peer = Presence::new(99);
        peer.set_local_field("name", "peer".into());
        let delta = peer.encode_delta(&[99]).unwrap();
        provider.presence().apply_delta(&delta, &OriginTag::new("test")).unwrap();
        assert_eq!(provider.presence().states().len(), 2);

        provider.disconnect().unwrap();
        wait_for(&mut events, &ProviderEvent::Disconnect).await;
        let states = provider.presence().states();
        assert_eq!(states.len(), 1);
        assert!(states.contains_key(&provider.presence().local_id()));
        assert_eq!(hub.member_count("doc").await, 0);

        // Reconnect is allowed.
        provider.connect().unwrap();
        wait_for(&mut events, &ProviderEvent::Connect).await;
    }

    #[tokio::test]
    async fn test_destroy_removes_hook_and_listeners() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryStore::new());
        let host = HostSignal::new();
        let provider = SyncProvider::builder(
            ProviderConfig::named("doc"),
            SharedDocument::new(),
            store,
            Arc::new(hub.clone()),
        )
        .host(Arc::new(host.clone()))
        .on(EventKind::Save, |_| {})
        .spawn()
        .unwrap();

        assert_eq!(host.hook_count(), 1);
        assert_eq!(provider.listener_count(), 1);
        let events = provider.events.clone();

        provider.destroy().await;
        assert_eq!(host.hook_count(), 0);
        assert_eq!(events.listener_count(), 0);
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_apply_count_is_per_session() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryStore::new());
        let seed = SharedDocument::with_replica_id(7);
        seed.push_text("content", "stored");
        let row = Row::from([
            ("name".to_string(), "doc".to_string()),
            ("content".to_string(), encode_payload(&seed.encode_full_state())),
        ]);
        store
            .upsert(&TableRef::new("public", "documents"), row, Some("name"))
            .await
            .unwrap();

        let provider = spawn("doc", &hub, &store);
        let mut events = provider.event_stream();
        wait_for(&mut events, &ProviderEvent::Connect).await;
        assert_eq!(provider.apply_count(), 1);

        provider.disconnect().unwrap();
        wait_for(&mut events, &ProviderEvent::Disconnect).await;
        provider.connect().unwrap();
        wait_for(&mut events, &ProviderEvent::Connect).await;
        assert_eq!(provider.apply_count(), 1);
        assert_eq!(provider.document().text("content"), "stored");
    }

    #[tokio::test]
    async fn test_commands_after_destroy_fail() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryStore::new());
        let provider = spawn("doc", &hub, &store);
        let commands = provider.commands.clone();
        provider.destroy().await;
        assert!(commands.send(Command::Connect).is_err());
    }
}
