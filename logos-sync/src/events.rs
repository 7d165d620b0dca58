//! Typed provider event surface.
//!
//! Listeners are observation only: they run synchronously on the provider
//! task, in registration order, and cannot influence the protocol.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::provider::ProviderError;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Channel subscribed and initial state merged
    Connect,
    /// Channel lost or closed
    Disconnect,
    Status(ConnectionStatus),
    /// Successful persists so far
    Save(u64),
    /// Presence delta the provider broadcast
    Awareness(Vec<u8>),
    Error(ProviderError),
}

impl ProviderEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProviderEvent::Connect => EventKind::Connect,
            ProviderEvent::Disconnect => EventKind::Disconnect,
            ProviderEvent::Status(_) => EventKind::Status,
            ProviderEvent::Save(_) => EventKind::Save,
            ProviderEvent::Awareness(_) => EventKind::Awareness,
            ProviderEvent::Error(_) => EventKind::Error,
        }
    }
}

/// Event filter for [`EventDispatcher::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Status,
    Save,
    Awareness,
    Error,
}

pub type Listener = Arc<dyn Fn(&ProviderEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Option<EventKind>, Listener)>,
}

/// Listener registry. Clones share the same registry.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Arc<Mutex<Listeners>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        let mut listeners = self.lock();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, kind, listener));
        id
    }

    /// Listen to one kind of event.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Listen to every event.
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry, _, _)| *entry != id);
        listeners.entries.len() != before
    }

    /// Deliver `event` to matching listeners.
    ///
    /// The registry is not locked while listeners run, so a listener may
    /// call `on`/`off` without deadlocking.
    pub fn emit(&self, event: &ProviderEvent) {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, filter, _)| filter.is_none() || *filter == Some(kind))
            .map(|(_, _, listener)| listener.clone())
            .collect();
        for listener in matching {
            listener(event);
        }
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.lock().entries.len()
    }
}
