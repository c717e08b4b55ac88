use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::peer::{PeerHandle, PeerLink, PeerState};

#[derive(Clone, Debug, Serialize)]
pub struct PeerInfo {
    pub id: u64,
    pub state: PeerState,
    pub height: u32,
    pub idle_ms: u64,
}

/// Connected peers by id. Ids come from a monotonic counter and are never handed out twice.
pub struct PeerRegistry {
    next_id: AtomicU64,
    peers: RwLock<HashMap<u64, Arc<PeerHandle>>>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            peers: RwLock::new(HashMap::new()),
        }
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a fresh id without registering anything under it.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, link: Arc<dyn PeerLink>) -> Arc<PeerHandle> {
        let peer = Arc::new(PeerHandle::new(self.next_id(), link));
        self.insert(Arc::clone(&peer));
        peer
    }

    /// Adds a handle built around an id from [`PeerRegistry::next_id`]. Returns false if the id is
    /// already registered.
    pub fn insert(&self, peer: Arc<PeerHandle>) -> bool {
        let Ok(mut peers) = self.peers.write() else {
            return false;
        };
        if peers.contains_key(&peer.id()) {
            return false;
        }
        peers.insert(peer.id(), peer);
        true
    }

    pub fn get(&self, id: u64) -> Option<Arc<PeerHandle>> {
        self.peers.read().ok()?.get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<PeerHandle>> {
        self.peers.write().ok()?.remove(&id)
    }

    /// Another registered peer that announced `nonce`.
    pub fn find_by_nonce(&self, nonce: u64, except: u64) -> Option<Arc<PeerHandle>> {
        let peers = self.peers.read().ok()?;
        peers
            .values()
            .find(|peer| peer.id() != except && peer.nonce() == Some(nonce))
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.peers.read().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn established_count(&self) -> usize {
        self.peers
            .read()
            .map(|peers| peers.values().filter(|peer| peer.is_established()).count())
            .unwrap_or(0)
    }

    pub fn peers(&self) -> Vec<Arc<PeerHandle>> {
        self.peers
            .read()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let now = Instant::now();
        let mut out: Vec<PeerInfo> = self
            .peers()
            .iter()
            .map(|peer| PeerInfo {
                id: peer.id(),
                state: peer.state(),
                height: peer.height(),
                idle_ms: now
                    .saturating_duration_since(peer.last_contact())
                    .as_millis()
                    .try_into()
                    .unwrap_or(u64::MAX),
            })
            .collect();
        out.sort_by_key(|info| info.id);
        out
    }
}
