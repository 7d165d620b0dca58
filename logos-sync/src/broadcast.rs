//! Topic rooms with fan-out to every member.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! member gets an independent receiver buffering up to `capacity` items;
//! members that fall further behind lose the oldest items (reported via
//! [`BroadcastGroup::record_dropped`]).
//!
//! Both the in-process [`LocalHub`](crate::transport::LocalHub) and the
//! WebSocket [`RelayServer`](crate::relay::RelayServer) route through these
//! rooms. Filtering out a member's own sends is the receiver's job.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Snapshot of a room's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters on the send path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single topic.
pub struct BroadcastGroup<T> {
    sender: broadcast::Sender<T>,
    members: RwLock<HashSet<Uuid>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl<T: Clone + Send + 'static> BroadcastGroup<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a member and return its receiver.
    pub async fn join(&self, member: Uuid) -> broadcast::Receiver<T> {
        let mut members = self.members.write().await;
        members.insert(member);
        self.sender.subscribe()
    }

    /// Returns whether the member was present.
    pub async fn leave(&self, member: &Uuid) -> bool {
        self.members.write().await.remove(member)
    }

    /// Send to every receiver, the sender's own included.
    ///
    /// Returns the number of receivers reached (0 for an empty room).
    pub fn send(&self, item: T) -> usize {
        let count = self.sender.send(item).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for items a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, member: &Uuid) -> bool {
        self.members.read().await.contains(member)
    }

    pub async fn members(&self) -> Vec<Uuid> {
        self.members.read().await.iter().copied().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps topics to broadcast groups so traffic stays isolated per topic.
pub struct RoomManager<T> {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup<T>>>>,
    default_capacity: usize,
}

impl<T: Clone + Send + 'static> RoomManager<T> {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for `topic`.
    pub async fn get_or_create(&self, topic: &str) -> Arc<BroadcastGroup<T>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(topic) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(topic) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(topic.to_string(), room.clone());
        room
    }

    /// Join `member` to the room for `topic`, creating it if needed.
    ///
    /// Membership is registered under the rooms lock, so a concurrent
    /// [`remove_if_empty`](Self::remove_if_empty) cannot drop the room
    /// between lookup and join.
    pub async fn join(
        &self,
        topic: &str,
        member: Uuid,
    ) -> (Arc<BroadcastGroup<T>>, broadcast::Receiver<T>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();
        let rx = room.join(member).await;
        (room, rx)
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<BroadcastGroup<T>>> {
        self.rooms.read().await.get(topic).cloned()
    }

    /// Remove the room if it has no members left.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(topic) {
            if room.member_count().await == 0 {
                rooms.remove(topic);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_leave() {
        let group: BroadcastGroup<u32> = BroadcastGroup::new(16);
        let member = Uuid::new_v4();

        let _rx = group.join(member).await;
        assert_eq!(group.member_count().await, 1);
        assert!(group.has_member(&member).await);

        assert!(group.leave(&member).await);
        assert!(!group.leave(&member).await);
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_receiver() {
        let group: BroadcastGroup<Arc<Vec<u8>>> = BroadcastGroup::new(16);
        let mut rx1 = group.join(Uuid::new_v4()).await;
        let mut rx2 = group.join(Uuid::new_v4()).await;
        let mut rx3 = group.join(Uuid::new_v4()).await;

        let count = group.send(Arc::new(vec![1, 2, 3]));
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            assert_eq!(*rx.recv().await.unwrap(), vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_send_to_empty_room() {
        let group: BroadcastGroup<u8> = BroadcastGroup::new(4);
        assert_eq!(group.send(1), 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group: BroadcastGroup<u32> = BroadcastGroup::new(2);
        let mut rx = group.join(Uuid::new_v4()).await;
        for i in 0..5 {
            group.send(i);
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => group.record_dropped(skipped),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(rx.recv().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager: RoomManager<u8> = RoomManager::new(16);
        let room1 = manager.get_or_create("doc-1").await;
        let room2 = manager.get_or_create("doc-1").await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.get("doc-2").await.is_none());
    }

    #[tokio::test]
    async fn test_room_manager_isolation() {
        let manager: RoomManager<u8> = RoomManager::new(16);
        let a = manager.get_or_create("a").await;
        let b = manager.get_or_create("b").await;
        let mut rx_b = b.join(Uuid::new_v4()).await;

        assert_eq!(a.send(7), 0);
        assert!(rx_b.try_recv().is_err());

        let mut topics = manager.active_topics().await;
        topics.sort();
        assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager: RoomManager<u8> = RoomManager::new(16);
        let room = manager.get_or_create("doc").await;
        let member = Uuid::new_v4();
        let _rx = room.join(member).await;

        assert!(!manager.remove_if_empty("doc").await);
        assert_eq!(manager.room_count().await, 1);

        room.leave(&member).await;
        assert!(manager.remove_if_empty("doc").await);
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_never_lands_in_removed_room() {
        let manager: Arc<RoomManager<u8>> = Arc::new(RoomManager::new(16));
        for _ in 0..200 {
            let leaver = Uuid::new_v4();
            let (room, _rx) = manager.join("doc", leaver).await;

            let cleanup = {
                let manager = manager.clone();
                tokio::spawn(async move {
                    room.leave(&leaver).await;
                    manager.remove_if_empty("doc").await;
                })
            };
            let joiner = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.join("doc", Uuid::new_v4()).await })
            };
            cleanup.await.unwrap();
            let (joined, mut rx) = joiner.await.unwrap();

            let registered = manager.get("doc").await.expect("room of a live member");
            assert!(Arc::ptr_eq(&registered, &joined));
            registered.send(9);
            assert_eq!(rx.recv().await.unwrap(), 9);

            for member in joined.members().await {
                joined.leave(&member).await;
            }
            assert!(manager.remove_if_empty("doc").await);
        }
    }
}
