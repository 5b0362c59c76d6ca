//! Server-wide fan-out of presence and save messages.
//!
//! Every connection subscribes to one tokio broadcast channel and skips
//! messages whose `peer_id` is its own user. Receivers buffer up to
//! `capacity` messages; a lagging connection loses the oldest ones, which
//! is harmless for last-write-wins presence.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a connection and hand back its receiver.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.peers.write().await.insert(peer_id);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to every subscriber. Returns how many receivers
    /// got it (the sender's own connection included; filtering is the
    /// receiver's job).
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
