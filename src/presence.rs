//! Presence store: last-known pose per peer
//!
//! Holds the local peer's pose and the latest pose reported for every remote
//! peer. Written by the external presence feed, read by the spatial audio
//! synchronizer on every tick. Updates are last-write-wins with strict
//! stale-timestamp rejection: an update older than the stored record is
//! ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Sub;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

/// 3-component vector for positions and orientations
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
}

impl Vec3 {
    /// Create a new vector
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// Latest known pose for one peer
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Position in world coordinates
    pub position: Vec3,

    /// Orientation (forward vector)
    pub orientation: Vec3,

    /// Millisecond timestamp assigned by the presence feed; used only for
    /// stale-update rejection, not for ordering against audio ticks
    pub updated_at_ms: u64,
}

impl PresenceRecord {
    /// Create a record with the given pose and timestamp
    pub fn new(position: Vec3, orientation: Vec3, updated_at_ms: u64) -> Self {
        Self {
            position,
            orientation,
            updated_at_ms,
        }
    }
}

/// Per-world presence state
///
/// One store per [`WorldConnection`](crate::world::WorldConnection); stores
/// of independent worlds share nothing.
pub struct PresenceStore {
    local: RwLock<Option<PresenceRecord>>,
    peers: RwLock<HashMap<String, PresenceRecord>>,
}

impl PresenceStore {
    /// Create an empty store; the local pose is unknown until first set
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Current local pose, if one has been reported
    pub async fn local(&self) -> Option<PresenceRecord> {
        *self.local.read().await
    }

    /// Update the local peer's pose
    pub async fn set_local(&self, record: PresenceRecord) {
        *self.local.write().await = Some(record);
    }

    /// Latest known pose for a remote peer, if any has arrived
    pub async fn peer(&self, peer_id: &str) -> Option<PresenceRecord> {
        self.peers.read().await.get(peer_id).copied()
    }

    /// Apply a presence update for a remote peer
    ///
    /// Returns `false` when the update is older than the stored record and
    /// was discarded.
    pub async fn apply(&self, peer_id: &str, record: PresenceRecord) -> bool {
        let mut peers = self.peers.write().await;

        if let Some(existing) = peers.get(peer_id) {
            if record.updated_at_ms < existing.updated_at_ms {
                trace!(
                    peer_id,
                    stored = existing.updated_at_ms,
                    received = record.updated_at_ms,
                    "Discarding stale presence update"
                );
                return false;
            }
        }

        peers.insert(peer_id.to_string(), record);
        true
    }

    /// Forget a remote peer's presence
    pub async fn remove(&self, peer_id: &str) {
        self.peers.write().await.remove(peer_id);
    }

    /// Peer IDs with a known pose
    pub async fn known_peers(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(x: f32, ts: u64) -> PresenceRecord {
        PresenceRecord::new(Vec3::new(x, 0.0, 0.0), Vec3::default(), ts)
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = PresenceStore::new();

        assert!(store.apply("peer-a", record(1.0, 3)).await);
        assert!(store.apply("peer-a", record(2.0, 5)).await);

        let stored = store.peer("peer-a").await.unwrap();
        assert_eq!(stored.position.x, 2.0);
        assert_eq!(stored.updated_at_ms, 5);
    }

    #[tokio::test]
    async fn test_stale_update_rejected() {
        let store = PresenceStore::new();

        // Out-of-order delivery: t=5 then t=3 keeps t=5.
        assert!(store.apply("peer-a", record(5.0, 5)).await);
        assert!(!store.apply("peer-a", record(3.0, 3)).await);

        let stored = store.peer("peer-a").await.unwrap();
        assert_eq!(stored.updated_at_ms, 5);
        assert_eq!(stored.position.x, 5.0);
    }

    #[tokio::test]
    async fn test_equal_timestamp_overwrites() {
        let store = PresenceStore::new();

        assert!(store.apply("peer-a", record(1.0, 5)).await);
        assert!(store.apply("peer-a", record(2.0, 5)).await);
        assert_eq!(store.peer("peer-a").await.unwrap().position.x, 2.0);
    }

    #[tokio::test]
    async fn test_remove_and_roster() {
        let store = PresenceStore::new();

        store.apply("peer-a", record(1.0, 1)).await;
        store.apply("peer-b", record(1.0, 1)).await;
        let mut roster = store.known_peers().await;
        roster.sort();
        assert_eq!(roster, vec!["peer-a".to_string(), "peer-b".to_string()]);

        store.remove("peer-a").await;
        assert!(store.peer("peer-a").await.is_none());
        assert_eq!(store.known_peers().await.len(), 1);
    }

    #[test]
    fn test_vec3_sub() {
        let a = Vec3::new(3.0, 2.0, 1.0);
        let b = Vec3::new(1.0, 1.0, 1.0);
        assert_eq!(a - b, Vec3::new(2.0, 1.0, 0.0));
    }
}
