use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::flight::FlightInfo;
use crate::peer::PeerHandle;
use crate::registry::PeerRegistry;

#[derive(Clone, Copy, Debug, Default)]
struct NodeStats {
    timeouts: u32,
    error_responses: u32,
}

#[derive(Default)]
struct Inner {
    order: Vec<u64>,
    stats: HashMap<u64, NodeStats>,
    cursor: usize,
}

/// Peers usable as sync sources, polled round-robin from a rotating cursor.
#[derive(Default)]
pub struct NodeList {
    inner: RwLock<Inner>,
}

fn eligible(peer: &PeerHandle, min_height: u32) -> bool {
    peer.is_established() && peer.height() > min_height
}

impl NodeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: u64) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };
        if inner.stats.contains_key(&id) {
            return false;
        }
        inner.order.push(id);
        inner.stats.insert(id, NodeStats::default());
        true
    }

    pub fn remove(&self, id: u64) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };
        if inner.stats.remove(&id).is_none() {
            return false;
        }
        if let Some(pos) = inner.order.iter().position(|member| *member == id) {
            inner.order.remove(pos);
            if pos < inner.cursor {
                inner.cursor -= 1;
            }
        }
        true
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner
            .read()
            .map(|inner| inner.stats.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.order.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<u64> {
        self.inner
            .read()
            .map(|inner| inner.order.clone())
            .unwrap_or_default()
    }

    pub fn record_timeout(&self, id: u64) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(stats) = inner.stats.get_mut(&id) {
                stats.timeouts = stats.timeouts.saturating_add(1);
            }
        }
    }

    /// Counts a rejected response and returns the peer's new total (zero for non-members).
    pub fn record_error(&self, id: u64) -> u32 {
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };
        match inner.stats.get_mut(&id) {
            Some(stats) => {
                stats.error_responses = stats.error_responses.saturating_add(1);
                stats.error_responses
            }
            None => 0,
        }
    }

    pub fn timeouts(&self, id: u64) -> u32 {
        self.stat(id, |stats| stats.timeouts)
    }

    pub fn error_responses(&self, id: u64) -> u32 {
        self.stat(id, |stats| stats.error_responses)
    }

    fn stat(&self, id: u64, field: impl Fn(&NodeStats) -> u32) -> u32 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.stats.get(&id).map(&field))
            .unwrap_or(0)
    }

    /// Members in polling order, starting at the cursor.
    fn rotation(&self) -> Vec<u64> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        if inner.order.is_empty() {
            return Vec::new();
        }
        let start = inner.cursor % inner.order.len();
        let mut ids = Vec::with_capacity(inner.order.len());
        ids.extend_from_slice(&inner.order[start..]);
        ids.extend_from_slice(&inner.order[..start]);
        ids
    }

    fn advance_past(&self, id: u64) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(pos) = inner.order.iter().position(|member| *member == id) {
                inner.cursor = pos + 1;
            }
        }
    }

    /// First established member, polling from the cursor, whose advertised height is above
    /// `min_height`. Each member is tried at most once per call.
    pub fn next_node(&self, registry: &PeerRegistry, min_height: u32) -> Option<Arc<PeerHandle>> {
        for id in self.rotation() {
            let Some(peer) = registry.get(id) else {
                continue;
            };
            if eligible(&peer, min_height) {
                self.advance_past(id);
                return Some(peer);
            }
        }
        None
    }

    /// Like [`NodeList::next_node`] but prefers peers `flight` has not seen fail: the first
    /// candidate with no recorded failures wins, otherwise the first one with the fewest.
    pub fn node_with_min_failures(
        &self,
        registry: &PeerRegistry,
        flight: &FlightInfo,
        min_height: u32,
    ) -> Option<Arc<PeerHandle>> {
        let mut best: Option<(u32, Arc<PeerHandle>)> = None;
        for id in self.rotation() {
            let Some(peer) = registry.get(id) else {
                continue;
            };
            if !eligible(&peer, min_height) {
                continue;
            }
            let failures = flight.failed_times(id);
            if failures == 0 {
                self.advance_past(id);
                return Some(peer);
            }
            if best.as_ref().map_or(true, |(least, _)| failures < *least) {
                best = Some((failures, peer));
            }
        }
        let (_, peer) = best?;
        self.advance_past(peer.id());
        Some(peer)
    }
}
