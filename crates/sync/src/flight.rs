//! Outstanding request bookkeeping: one entry per header height and one per block hash.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use ledgerd_primitives::Hash256;

/// One outstanding request and its retry history.
#[derive(Clone, Debug)]
pub struct FlightInfo {
    height: u32,
    peer_id: u64,
    started: Instant,
    failed: HashMap<u64, u32>,
    total_failed: u32,
}

impl FlightInfo {
    pub fn new(peer_id: u64, height: u32, now: Instant) -> Self {
        Self {
            height,
            peer_id,
            started: now,
            failed: HashMap::new(),
            total_failed: 0,
        }
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn assign(&mut self, peer_id: u64) {
        self.peer_id = peer_id;
    }

    pub fn reset_start(&mut self, now: Instant) {
        self.started = now;
    }

    /// Charges a failure to the peer currently responsible.
    pub fn mark_failed(&mut self) {
        let count = self.failed.entry(self.peer_id).or_insert(0);
        *count = count.saturating_add(1);
        self.total_failed = self.total_failed.saturating_add(1);
    }

    pub fn failed_times(&self, peer_id: u64) -> u32 {
        self.failed.get(&peer_id).copied().unwrap_or(0)
    }

    pub fn total_failed(&self) -> u32 {
        self.total_failed
    }

    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started) >= timeout
    }
}

#[derive(Default)]
pub struct FlightTracker {
    headers: RwLock<HashMap<u32, FlightInfo>>,
    blocks: RwLock<HashMap<Hash256, FlightInfo>>,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a header request for `height`, replacing any entry already there.
    pub fn add_header(&self, peer_id: u64, height: u32) {
        if let Ok(mut headers) = self.headers.write() {
            headers.insert(height, FlightInfo::new(peer_id, height, Instant::now()));
        }
    }

    /// Records a header request unless one is already out for `height` or `capacity` requests
    /// are outstanding.
    pub fn try_add_header(&self, peer_id: u64, height: u32, capacity: usize) -> bool {
        let Ok(mut headers) = self.headers.write() else {
            return false;
        };
        if headers.len() >= capacity || headers.contains_key(&height) {
            return false;
        }
        headers.insert(height, FlightInfo::new(peer_id, height, Instant::now()));
        true
    }

    pub fn del_header(&self, height: u32) -> bool {
        self.headers
            .write()
            .map(|mut headers| headers.remove(&height).is_some())
            .unwrap_or(false)
    }

    pub fn is_header_on_flight(&self, height: u32) -> bool {
        self.headers
            .read()
            .map(|headers| headers.contains_key(&height))
            .unwrap_or(false)
    }

    pub fn header_flight(&self, height: u32) -> Option<FlightInfo> {
        self.headers.read().ok()?.get(&height).cloned()
    }

    pub fn header_count(&self) -> usize {
        self.headers.read().map(|headers| headers.len()).unwrap_or(0)
    }

    /// Records a block request for `hash`, replacing any entry already there.
    pub fn add_block(&self, peer_id: u64, height: u32, hash: Hash256) {
        if let Ok(mut blocks) = self.blocks.write() {
            blocks.insert(hash, FlightInfo::new(peer_id, height, Instant::now()));
        }
    }

    /// Stores `flight` for `hash` regardless of window occupancy, replacing any entry there.
    pub fn put_block(&self, hash: Hash256, flight: FlightInfo) {
        if let Ok(mut blocks) = self.blocks.write() {
            blocks.insert(hash, flight);
        }
    }

    /// Inserts `flight` for `hash` unless the hash is already in flight or `capacity` requests
    /// are outstanding.
    pub fn try_add_block(&self, hash: Hash256, flight: FlightInfo, capacity: usize) -> bool {
        let Ok(mut blocks) = self.blocks.write() else {
            return false;
        };
        if blocks.len() >= capacity || blocks.contains_key(&hash) {
            return false;
        }
        blocks.insert(hash, flight);
        true
    }

    pub fn del_block(&self, hash: &Hash256) -> bool {
        self.blocks
            .write()
            .map(|mut blocks| blocks.remove(hash).is_some())
            .unwrap_or(false)
    }

    pub fn is_block_on_flight(&self, hash: &Hash256) -> bool {
        self.blocks
            .read()
            .map(|blocks| blocks.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn block_flight(&self, hash: &Hash256) -> Option<FlightInfo> {
        self.blocks.read().ok()?.get(hash).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().map(|blocks| blocks.len()).unwrap_or(0)
    }

    /// Header flights at least `timeout` old, lowest height first.
    pub fn expired_headers(&self, now: Instant, timeout: Duration) -> Vec<(u32, FlightInfo)> {
        let Ok(headers) = self.headers.read() else {
            return Vec::new();
        };
        let mut out: Vec<(u32, FlightInfo)> = headers
            .iter()
            .filter(|(_, flight)| flight.expired(now, timeout))
            .map(|(height, flight)| (*height, flight.clone()))
            .collect();
        out.sort_by_key(|(height, _)| *height);
        out
    }

    /// Block flights at least `timeout` old, lowest height first.
    pub fn expired_blocks(&self, now: Instant, timeout: Duration) -> Vec<(Hash256, FlightInfo)> {
        let Ok(blocks) = self.blocks.read() else {
            return Vec::new();
        };
        let mut out: Vec<(Hash256, FlightInfo)> = blocks
            .iter()
            .filter(|(_, flight)| flight.expired(now, timeout))
            .map(|(hash, flight)| (*hash, flight.clone()))
            .collect();
        out.sort_by_key(|(_, flight)| flight.height());
        out
    }

    /// Restarts the clock on a timed-out header flight and charges its current peer. Returns the
    /// updated entry, or `None` if it was resolved in the meantime.
    pub fn retry_header(&self, height: u32, now: Instant) -> Option<FlightInfo> {
        let mut headers = self.headers.write().ok()?;
        let flight = headers.get_mut(&height)?;
        flight.reset_start(now);
        flight.mark_failed();
        Some(flight.clone())
    }

    pub fn retry_block(&self, hash: &Hash256, now: Instant) -> Option<FlightInfo> {
        let mut blocks = self.blocks.write().ok()?;
        let flight = blocks.get_mut(hash)?;
        flight.reset_start(now);
        flight.mark_failed();
        Some(flight.clone())
    }

    pub fn assign_header(&self, height: u32, peer_id: u64) -> bool {
        let Ok(mut headers) = self.headers.write() else {
            return false;
        };
        match headers.get_mut(&height) {
            Some(flight) => {
                flight.assign(peer_id);
                true
            }
            None => false,
        }
    }

    pub fn assign_block(&self, hash: &Hash256, peer_id: u64) -> bool {
        let Ok(mut blocks) = self.blocks.write() else {
            return false;
        };
        match blocks.get_mut(hash) {
            Some(flight) => {
                flight.assign(peer_id);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_add_overwrites_instead_of_duplicating() {
        let flights = FlightTracker::new();
        flights.add_header(1, 101);
        flights.add_header(2, 101);
        flights.add_header(3, 102);
        assert_eq!(flights.header_count(), 2);
        assert_eq!(flights.header_flight(101).map(|f| f.peer_id()), Some(2));
    }

    #[test]
    fn delete_reports_presence() {
        let flights = FlightTracker::new();
        flights.add_header(1, 7);
        assert!(flights.del_header(7));
        assert!(!flights.del_header(7));

        flights.add_block(1, 9, [9u8; 32]);
        assert!(flights.is_block_on_flight(&[9u8; 32]));
        assert!(flights.del_block(&[9u8; 32]));
        assert!(!flights.del_block(&[9u8; 32]));
        assert_eq!(flights.block_count(), 0);
    }

    #[test]
    fn try_add_respects_capacity_and_existing() {
        let flights = FlightTracker::new();
        assert!(flights.try_add_header(1, 5, 1));
        assert!(!flights.try_add_header(1, 6, 1));
        assert!(!flights.try_add_header(2, 5, 4));

        let now = Instant::now();
        assert!(flights.try_add_block([1u8; 32], FlightInfo::new(1, 1, now), 2));
        assert!(!flights.try_add_block([1u8; 32], FlightInfo::new(2, 1, now), 2));
        assert!(flights.try_add_block([2u8; 32], FlightInfo::new(1, 2, now), 2));
        assert!(!flights.try_add_block([3u8; 32], FlightInfo::new(1, 3, now), 2));
        assert_eq!(flights.block_count(), 2);
    }

    #[test]
    fn put_block_ignores_the_window() {
        let flights = FlightTracker::new();
        let now = Instant::now();
        assert!(flights.try_add_block([1u8; 32], FlightInfo::new(1, 1, now), 1));
        flights.put_block([2u8; 32], FlightInfo::new(2, 2, now));
        flights.put_block([1u8; 32], FlightInfo::new(3, 1, now));
        assert_eq!(flights.block_count(), 2);
        assert_eq!(flights.block_flight(&[1u8; 32]).map(|f| f.peer_id()), Some(3));
    }

    #[test]
    fn expiry_and_retry_accounting() {
        let flights = FlightTracker::new();
        flights.add_header(4, 50);
        flights.add_block(4, 51, [5u8; 32]);
        let now = Instant::now();
        assert!(flights
            .expired_headers(now, Duration::from_secs(10))
            .is_empty());

        let later = now + Duration::from_secs(16);
        let expired = flights.expired_blocks(later, Duration::from_secs(15));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1.height(), 51);

        let retried = flights.retry_block(&[5u8; 32], later).expect("present");
        assert_eq!(retried.failed_times(4), 1);
        assert_eq!(retried.total_failed(), 1);
        assert_eq!(retried.started(), later);
        assert!(flights.assign_block(&[5u8; 32], 8));
        assert!(flights
            .expired_blocks(later, Duration::from_secs(15))
            .is_empty());

        let header = flights.retry_header(50, later).expect("present");
        assert_eq!(header.failed_times(4), 1);
        assert!(flights.assign_header(50, 9));
        assert_eq!(flights.header_flight(50).map(|f| f.peer_id()), Some(9));
        assert!(flights.retry_header(51, later).is_none());
        assert!(!flights.assign_header(51, 9));
    }

    #[test]
    fn failures_are_charged_per_peer() {
        let mut flight = FlightInfo::new(1, 10, Instant::now());
        flight.mark_failed();
        flight.assign(2);
        flight.mark_failed();
        flight.mark_failed();
        assert_eq!(flight.failed_times(1), 1);
        assert_eq!(flight.failed_times(2), 2);
        assert_eq!(flight.failed_times(3), 0);
        assert_eq!(flight.total_failed(), 3);
    }
}
