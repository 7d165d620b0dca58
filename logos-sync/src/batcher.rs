//! Change batcher: per-stream debounce.
//!
//! Every mutation re-arms a deadline `window` in the future. When the
//! deadline passes with no further mutation the accumulated batch is
//! handed out exactly once:
//!
//! ```text
//! edit edit edit ──────────── (window) ──► flush(batch of 3)
//!  │    │    └─ re-arm
//!  │    └────── re-arm
//!  └─────────── arm
//! ```
//!
//! Timers use `tokio::time::Instant` so tests can drive them with a
//! paused clock.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::document::ReplicaId;
use crate::presence::PresenceChange;

/// Debounce timer plus the batch it guards.
#[derive(Debug)]
pub struct Debouncer<B> {
    window: Duration,
    deadline: Option<Instant>,
    /// Disarmed but still owed a flush
    held: bool,
    batch: B,
}

impl<B: Default> Debouncer<B> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            held: false,
            batch: B::default(),
        }
    }

    /// Record a mutation into the batch and re-arm the deadline.
    pub fn push(&mut self, record: impl FnOnce(&mut B)) {
        record(&mut self.batch);
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarm the timer but keep the batch for a later [`take`](Self::take).
    pub fn hold(&mut self) {
        if self.deadline.take().is_some() {
            self.held = true;
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Take the batch if armed or held, disarming the timer.
    pub fn take(&mut self) -> Option<B> {
        let armed = self.deadline.take().is_some();
        let held = std::mem::take(&mut self.held);
        (armed || held).then(|| std::mem::take(&mut self.batch))
    }

    /// Drop the pending batch without flushing it.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.held = false;
        self.batch = B::default();
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Takes effect from the next mutation.
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }
}

/// Wait until `deadline`, or forever when disarmed.
pub async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Document mutations seen during one window.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DocumentBatch {
    /// Mutations made by the embedding application
    pub local: usize,
    /// Mutations this provider merged in itself
    pub echoed: usize,
}

impl DocumentBatch {
    pub fn has_local_changes(&self) -> bool {
        self.local > 0
    }
}

/// Presence ids touched during one window.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PresenceBatch {
    pub added: BTreeSet<ReplicaId>,
    pub updated: BTreeSet<ReplicaId>,
    pub removed: BTreeSet<ReplicaId>,
}

impl PresenceBatch {
    pub fn record(&mut self, change: &PresenceChange) {
        self.added.extend(change.added.iter().copied());
        self.updated.extend(change.updated.iter().copied());
        self.removed.extend(change.removed.iter().copied());
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Union of added, updated and removed ids.
    pub fn changed_ids(&self) -> Vec<ReplicaId> {
        let mut ids: BTreeSet<ReplicaId> = self.added.clone();
        ids.extend(self.updated.iter().copied());
        ids.extend(self.removed.iter().copied());
        ids.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::OriginTag;

    #[tokio::test(start_paused = true)]
    async fn test_rapid_pushes_coalesce() {
        let mut debouncer: Debouncer<DocumentBatch> = Debouncer::new(Duration::from_millis(100));
        assert!(!debouncer.is_pending());

        for _ in 0..5 {
            debouncer.push(|b| b.local += 1);
            tokio::time::advance(Duration::from_millis(20)).await;
        }

        // Last push re-armed the deadline 100ms after itself.
        let deadline = debouncer.deadline().unwrap();
        assert!(deadline > Instant::now());

        until(debouncer.deadline()).await;
        let batch = debouncer.take().unwrap();
        assert_eq!(batch.local, 5);
        assert!(debouncer.take().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_extends_on_push() {
        let mut debouncer: Debouncer<DocumentBatch> = Debouncer::new(Duration::from_millis(100));
        debouncer.push(|b| b.local += 1);
        let first = debouncer.deadline().unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        debouncer.push(|b| b.echoed += 1);
        let second = debouncer.deadline().unwrap();
        assert_eq!(second - first, Duration::from_millis(60));
    }

    #[test]
    fn test_cancel_discards_batch() {
        let mut debouncer: Debouncer<DocumentBatch> = Debouncer::new(Duration::from_millis(10));
        debouncer.push(|b| b.local += 1);
        debouncer.cancel();
        assert!(!debouncer.is_pending());
        assert!(debouncer.take().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_batch_survives_until_taken() {
        let mut debouncer: Debouncer<DocumentBatch> = Debouncer::new(Duration::from_millis(100));
        debouncer.hold();
        assert!(!debouncer.is_held());

        debouncer.push(|b| b.local += 1);
        until(debouncer.deadline()).await;
        debouncer.hold();
        assert!(debouncer.is_held());
        assert!(!debouncer.is_pending());

        // Later pushes join the held batch.
        debouncer.push(|b| b.local += 1);
        let batch = debouncer.take().unwrap();
        assert_eq!(batch.local, 2);
        assert!(!debouncer.is_held());
        assert!(debouncer.take().is_none());
    }

    #[test]
    fn test_document_batch_echo_only() {
        let batch = DocumentBatch { local: 0, echoed: 3 };
        assert!(!batch.has_local_changes());
    }

    #[test]
    fn test_presence_batch_union() {
        let mut batch = PresenceBatch::default();
        batch.record(&PresenceChange {
            added: vec![1],
            updated: vec![2],
            removed: vec![],
            origin: OriginTag::local(),
        });
        batch.record(&PresenceChange {
            added: vec![],
            updated: vec![2, 3],
            removed: vec![1],
            origin: OriginTag::local(),
        });
        assert_eq!(batch.changed_ids(), vec![1, 2, 3]);
        assert!(!batch.is_empty());
    }
}
