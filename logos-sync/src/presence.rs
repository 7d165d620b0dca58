//! Presence: ephemeral per-replica state (cursor, user, online status).
//!
//! Each replica owns one entry keyed by its [`ReplicaId`]. Entries carry a
//! monotonically increasing clock; a remote delta only wins over the local
//! copy when its clock is newer, or when it is a removal at the same clock.
//!
//! ```text
//! set_local_state()           apply_delta(bytes)          remove_entries(ids)
//!        │                           │                           │
//!        └──────────────┬────────────┴───────────────────────────┘
//!                       ▼
//!        PresenceChange { added, updated, removed, origin }
//!                       │
//!                       ▼
//!             every subscribe() receiver
//! ```
//!
//! Nothing here is ever persisted. Wire deltas are bincode-encoded; the
//! presence payload itself travels as JSON text so any
//! `serde_json::Value` round-trips.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::document::{OriginTag, ReplicaId, SharedDocument};

// ───────────────────────────────────────────────────────────────────
// Change events
// ───────────────────────────────────────────────────────────────────

/// Ids touched by one presence mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<ReplicaId>,
    pub updated: Vec<ReplicaId>,
    pub removed: Vec<ReplicaId>,
    pub origin: OriginTag,
}

impl PresenceChange {
    fn empty(origin: OriginTag) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire format
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireEntry {
    replica: ReplicaId,
    clock: u32,
    /// JSON text; `None` marks a removal
    state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireDelta {
    entries: Vec<WireEntry>,
}

// ───────────────────────────────────────────────────────────────────
// Presence map
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    clock: u32,
    last_updated: Instant,
}

struct PresenceInner {
    local_id: ReplicaId,
    states: HashMap<ReplicaId, Value>,
    /// Clock memory, kept after removal for staleness checks
    meta: HashMap<ReplicaId, EntryMeta>,
    observers: Vec<mpsc::UnboundedSender<PresenceChange>>,
}

impl PresenceInner {
    fn notify(&mut self, change: &PresenceChange) {
        if change.is_empty() {
            return;
        }
        self.observers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn bump_clock(&mut self, id: ReplicaId) -> u32 {
        let clock = self.meta.get(&id).map_or(0, |m| m.clock) + 1;
        self.meta.insert(
            id,
            EntryMeta {
                clock,
                last_updated: Instant::now(),
            },
        );
        clock
    }
}

/// Shared presence state. Clones refer to the same map.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<Mutex<PresenceInner>>,
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Presence")
            .field("local_id", &inner.local_id)
            .field("entries", &inner.states.len())
            .finish()
    }
}

impl Presence {
    /// Create an empty presence map for the given local replica.
    pub fn new(local_id: ReplicaId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PresenceInner {
                local_id,
                states: HashMap::new(),
                meta: HashMap::new(),
                observers: Vec::new(),
            })),
        }
    }

    /// Presence sharing the document's replica id space.
    pub fn for_document(document: &SharedDocument) -> Self {
        Self::new(document.replica_id())
    }

    fn lock(&self) -> MutexGuard<'_, PresenceInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn local_id(&self) -> ReplicaId {
        self.lock().local_id
    }

    /// Set (or clear, with `None`) the local entry.
    pub fn set_local_state(&self, state: Option<Value>) {
        let mut inner = self.lock();
        let id = inner.local_id;
        let previous = match state {
            Some(value) => inner.states.insert(id, value),
            None => inner.states.remove(&id),
        };
        let present = inner.states.contains_key(&id);
        inner.bump_clock(id);

        let mut change = PresenceChange::empty(OriginTag::local());
        match (previous.is_some(), present) {
            (false, true) => change.added.push(id),
            (true, true) => change.updated.push(id),
            (true, false) => change.removed.push(id),
            (false, false) => {}
        }
        inner.notify(&change);
    }

    /// Set one field of the local entry, creating the entry if needed.
    pub fn set_local_field(&self, field: &str, value: Value) {
        let mut state = match self.local_state() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        state.insert(field.to_string(), value);
        self.set_local_state(Some(Value::Object(state)));
    }

    pub fn local_state(&self) -> Option<Value> {
        let inner = self.lock();
        inner.states.get(&inner.local_id).cloned()
    }

    /// Snapshot of every live entry.
    pub fn states(&self) -> HashMap<ReplicaId, Value> {
        self.lock().states.clone()
    }

    /// Current clock for a replica (also known after removal).
    pub fn clock(&self, id: ReplicaId) -> Option<u32> {
        self.lock().meta.get(&id).map(|m| m.clock)
    }

    /// Encode the current state of `ids` as a wire delta.
    ///
    /// Ids without a live entry are encoded as removals; ids never seen
    /// are skipped.
    pub fn encode_delta(&self, ids: &[ReplicaId]) -> Result<Vec<u8>, PresenceError> {
        let inner = self.lock();
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(meta) = inner.meta.get(id) else {
                continue;
            };
            let state = match inner.states.get(id) {
                Some(value) => Some(
                    serde_json::to_string(value)
                        .map_err(|e| PresenceError::Serialization(e.to_string()))?,
                ),
                None => None,
            };
            entries.push(WireEntry {
                replica: *id,
                clock: meta.clock,
                state,
            });
        }
        bincode::serde::encode_to_vec(&WireDelta { entries }, bincode::config::standard())
            .map_err(|e| PresenceError::Serialization(e.to_string()))
    }

    /// Merge a wire delta produced by a remote [`Presence::encode_delta`].
    ///
    /// The whole delta is decoded before anything is applied, so a
    /// malformed delta leaves the map untouched.
    pub fn apply_delta(&self, bytes: &[u8], origin: &OriginTag) -> Result<PresenceChange, PresenceError> {
        let (delta, _): (WireDelta, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| PresenceError::Deserialization(e.to_string()))?;
        let mut decoded = Vec::with_capacity(delta.entries.len());
        for entry in delta.entries {
            let state = match entry.state {
                Some(text) => Some(
                    serde_json::from_str::<Value>(&text)
                        .map_err(|e| PresenceError::Deserialization(e.to_string()))?,
                ),
                None => None,
            };
            decoded.push((entry.replica, entry.clock, state));
        }

        let mut inner = self.lock();
        let now = Instant::now();
        let mut change = PresenceChange::empty(origin.clone());
        let mut renewed = false;

        for (id, clock, state) in decoded {
            let current_clock = inner.meta.get(&id).map_or(0, |m| m.clock);
            let exists = inner.states.contains_key(&id);
            let newer = current_clock < clock;
            let removal_at_same_clock = current_clock == clock && state.is_none() && exists;
            if !(newer || removal_at_same_clock) {
                continue;
            }

            match state {
                None if id == inner.local_id && exists => {
                    // A peer cannot remove us: outbid its clock and re-announce.
                    inner.meta.insert(
                        id,
                        EntryMeta {
                            clock: clock.saturating_add(1),
                            last_updated: now,
                        },
                    );
                    renewed = true;
                    continue;
                }
                None => {
                    inner.states.remove(&id);
                    if exists {
                        change.removed.push(id);
                    }
                }
                Some(value) => {
                    inner.states.insert(id, value);
                    if exists {
                        change.updated.push(id);
                    } else {
                        change.added.push(id);
                    }
                }
            }
            inner.meta.insert(
                id,
                EntryMeta {
                    clock,
                    last_updated: now,
                },
            );
        }

        inner.notify(&change);
        if renewed {
            let mut renewal = PresenceChange::empty(OriginTag::local());
            renewal.updated.push(inner.local_id);
            inner.notify(&renewal);
        }
        Ok(change)
    }

    /// Remove entries locally. Removing the local entry bumps its clock so
    /// the removal wins when broadcast.
    pub fn remove_entries(&self, ids: &[ReplicaId], origin: &OriginTag) -> PresenceChange {
        let mut inner = self.lock();
        let mut change = PresenceChange::empty(origin.clone());
        for id in ids {
            if inner.states.remove(id).is_some() {
                if *id == inner.local_id {
                    inner.bump_clock(*id);
                }
                change.removed.push(*id);
            }
        }
        inner.notify(&change);
        change
    }

    /// Time since an entry last changed.
    pub fn last_updated(&self, id: ReplicaId) -> Option<std::time::Duration> {
        self.lock().meta.get(&id).map(|m| m.last_updated.elapsed())
    }

    /// Stream of every subsequent change. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PresenceChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().observers.push(tx);
        rx
    }
}

/// Presence errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("presence serialization error: {0}")]
    Serialization(String),
    #[error("presence deserialization error: {0}")]
    Deserialization(String),
}
