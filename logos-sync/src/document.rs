//! Replicated document collaborator backed by a Yrs `Doc`.
//!
//! The embedding application owns the document; the provider only keeps a
//! cloned handle and an update observer. Every update the provider merges
//! in is applied under an [`OriginTag`] so its own observer can tell
//! echoes from local edits.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Text, Transact, Update};

/// Stable per-session replica identifier (the Yrs client id).
pub type ReplicaId = u64;

/// Marker attached to a merge identifying its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginTag(String);

impl OriginTag {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Origin of edits made directly by the embedding application.
    pub fn local() -> Self {
        Self::new("local")
    }

    /// Origin of presence removals triggered by host shutdown.
    pub fn host_exit() -> Self {
        Self::new("host exit")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_origin(&self) -> Origin {
        Origin::from(self.0.as_str())
    }
}

impl std::fmt::Display for OriginTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the document mutation stream.
#[derive(Debug, Clone)]
pub struct DocumentUpdate {
    /// Encoded (v1) delta of the committed transaction
    pub update: Vec<u8>,
    /// Transaction origin, if any
    pub origin: Option<Origin>,
}

/// Keeps an update observer alive; dropping it detaches the observer.
pub struct DocumentSubscription {
    _inner: Subscription,
}

impl std::fmt::Debug for DocumentSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSubscription").finish_non_exhaustive()
    }
}

/// Cloneable handle to a shared Yrs document.
#[derive(Clone)]
pub struct SharedDocument {
    doc: Doc,
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDocument {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create with an explicit replica id (for testing).
    pub fn with_replica_id(id: ReplicaId) -> Self {
        Self {
            doc: Doc::with_client_id(id),
        }
    }

    pub fn from_doc(doc: Doc) -> Self {
        Self { doc }
    }

    /// The underlying Yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.doc.client_id()
    }

    /// Full document state as a v1 update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge an encoded v1 update under `origin`.
    ///
    /// Malformed input leaves the document untouched.
    pub fn apply_encoded_update(&self, update: &[u8], origin: &OriginTag) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update).map_err(|e| DocumentError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin.to_origin());
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    /// Observe every committed transaction.
    pub fn observe<F>(&self, f: F) -> Result<DocumentSubscription, DocumentError>
    where
        F: Fn(DocumentUpdate) + Send + Sync + 'static,
    {
        let inner = self
            .doc
            .observe_update_v1(move |txn, event| {
                f(DocumentUpdate {
                    update: event.update.clone(),
                    origin: txn.origin().cloned(),
                });
            })
            .map_err(|e| DocumentError::Observe(e.to_string()))?;
        Ok(DocumentSubscription { _inner: inner })
    }

    /// Insert text into a root-level text field.
    pub fn insert_text(&self, field: &str, index: u32, chunk: &str) {
        let text = self.doc.get_or_insert_text(field);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, chunk);
    }

    /// Append text to a root-level text field.
    pub fn push_text(&self, field: &str, chunk: &str) {
        let text = self.doc.get_or_insert_text(field);
        let mut txn = self.doc.transact_mut();
        text.push(&mut txn, chunk);
    }

    /// Current string content of a root-level text field ("" if absent).
    pub fn text(&self, field: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(field)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }
}

/// Document collaborator errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("update decode error: {0}")]
    Decode(String),
    #[error("update apply error: {0}")]
    Apply(String),
    #[error("cannot observe document: {0}")]
    Observe(String),
}
