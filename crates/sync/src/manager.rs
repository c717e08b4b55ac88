use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ledgerd_chainstate::LedgerAccessor;
use ledgerd_primitives::{short_hash, Block, BlockHeader};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

use crate::cache::BlockCache;
use crate::config::SyncConfig;
use crate::flight::{FlightInfo, FlightTracker};
use crate::message::Message;
use crate::peer::PeerHandle;
use crate::registry::PeerRegistry;
use crate::selection::NodeList;

#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncSnapshot {
    pub block_height: u32,
    pub header_height: u32,
    pub header_gap: u32,
    pub sync_peers: usize,
    pub header_flights: usize,
    pub block_flights: usize,
    pub cached_blocks: usize,
}

/// Clears a phase flag when the phase returns.
struct PhaseGuard<'a>(&'a AtomicBool);

impl<'a> PhaseGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives header and block download from the sync node list into the ledger.
///
/// Header sync, block sync and the commit pass each run at most once at a time; the ticker and
/// inbound message handlers may call into them concurrently.
pub struct SyncManager<L> {
    config: SyncConfig,
    ledger: Arc<L>,
    registry: Arc<PeerRegistry>,
    nodes: NodeList,
    flights: FlightTracker,
    cache: BlockCache,
    syncing_header: AtomicBool,
    syncing_block: AtomicBool,
    saving_block: AtomicBool,
    block_kick: Notify,
    exit: watch::Sender<bool>,
}

impl<L: LedgerAccessor> SyncManager<L> {
    pub fn new(config: SyncConfig, ledger: Arc<L>, registry: Arc<PeerRegistry>) -> Self {
        let (exit, _) = watch::channel(false);
        Self {
            config,
            ledger,
            registry,
            nodes: NodeList::new(),
            flights: FlightTracker::new(),
            cache: BlockCache::new(),
            syncing_header: AtomicBool::new(false),
            syncing_block: AtomicBool::new(false),
            saving_block: AtomicBool::new(false),
            block_kick: Notify::new(),
            exit,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn nodes(&self) -> &NodeList {
        &self.nodes
    }

    pub fn flights(&self) -> &FlightTracker {
        &self.flights
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Ticker loop. Returns once [`SyncManager::close`] has been called.
    pub async fn run(&self) {
        let mut exit = self.exit.subscribe();
        if *exit.borrow() {
            return;
        }
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ledgerd_log::log_info!(
            "Sync: started (tick {}ms, block window {}, cache {})",
            self.config.tick_interval.as_millis(),
            self.config.block_window,
            self.config.block_cache
        );
        loop {
            tokio::select! {
                _ = exit.changed() => break,
                _ = ticker.tick() => self.tick(),
                _ = self.block_kick.notified() => {
                    tokio::time::sleep(self.config.block_resync_delay).await;
                    self.sync_block();
                }
            }
        }
        ledgerd_log::log_info!("Sync: stopped");
    }

    pub fn close(&self) {
        self.exit.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.exit.borrow()
    }

    /// One ticker pass: timeout sweep, header sync, block sync, commit.
    pub fn tick(&self) {
        self.check_timeout_at(Instant::now());
        self.sync_header();
        self.sync_block();
        self.save_block();
    }

    pub fn on_add_node(&self, peer_id: u64) {
        if self.nodes.add(peer_id) {
            ledgerd_log::log_debug!("Sync: node {peer_id} added");
        }
    }

    pub fn on_del_node(&self, peer_id: u64) {
        if !self.nodes.remove(peer_id) {
            return;
        }
        ledgerd_log::log_info!("Sync: node {peer_id} removed");
        if self.nodes.is_empty() {
            ledgerd_log::log_warn!("Sync: no sync nodes");
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let block_height = self.ledger.current_block_height();
        let header_height = self.ledger.current_header_height();
        SyncSnapshot {
            block_height,
            header_height,
            header_gap: header_height.saturating_sub(block_height),
            sync_peers: self.sync_peer_count(),
            header_flights: self.flights.header_count(),
            block_flights: self.flights.block_count(),
            cached_blocks: self.cache.len(),
        }
    }

    fn sync_peer_count(&self) -> usize {
        self.nodes
            .ids()
            .into_iter()
            .filter_map(|id| self.registry.get(id))
            .filter(|peer| peer.is_established())
            .count()
    }

    fn has_quorum(&self) -> bool {
        self.sync_peer_count() >= self.config.min_peers
    }

    fn send_to(&self, peer: &PeerHandle, message: Message) -> bool {
        let command = message.command();
        match peer.send(message) {
            Ok(()) => true,
            Err(err) => {
                ledgerd_log::log_warn!("Sync: {command} to peer {} failed: {err}", peer.id());
                false
            }
        }
    }

    fn penalize(&self, peer_id: u64) {
        let errors = self.nodes.record_error(peer_id);
        if errors < self.config.max_error_responses {
            return;
        }
        if self.nodes.remove(peer_id) {
            ledgerd_log::log_warn!(
                "Sync: node {peer_id} dropped after {errors} rejected responses"
            );
        }
        if self.nodes.is_empty() {
            ledgerd_log::log_warn!("Sync: no sync nodes");
        }
    }

    /// Requests the next header batch unless the header window is full or headers already lead
    /// blocks by the forward limit.
    pub fn sync_header(&self) {
        if !self.has_quorum() {
            return;
        }
        let Some(_guard) = PhaseGuard::enter(&self.syncing_header) else {
            return;
        };
        if self.flights.header_count() >= self.config.header_window {
            return;
        }
        let block_height = self.ledger.current_block_height();
        let header_height = self.ledger.current_header_height();
        if header_height.saturating_sub(block_height) >= self.config.header_forward_limit {
            ledgerd_log::log_trace!(
                "Sync: headers {header_height} lead blocks {block_height}, waiting"
            );
            return;
        }
        let next = header_height.saturating_add(1);
        let Some(peer) = self.nodes.next_node(&self.registry, header_height) else {
            return;
        };
        if !self
            .flights
            .try_add_header(peer.id(), next, self.config.header_window)
        {
            return;
        }
        let locator = self.ledger.current_header_hash();
        if self.send_to(
            &peer,
            Message::GetHeaders {
                start_height: next,
                locator,
            },
        ) {
            ledgerd_log::log_info!("Header sync request height {next} (peer {})", peer.id());
        }
    }

    /// Requests bodies for headers not yet committed, bounded by the block window and the free
    /// cache space.
    pub fn sync_block(&self) {
        let Some(_guard) = PhaseGuard::enter(&self.syncing_block) else {
            return;
        };
        let available = self
            .config
            .block_window
            .saturating_sub(self.flights.block_count());
        if available == 0 {
            return;
        }
        let block_height = self.ledger.current_block_height();
        let header_height = self.ledger.current_header_height();
        let gap = header_height.saturating_sub(block_height) as usize;
        let cache_room = self.config.block_cache.saturating_sub(self.cache.len());
        let count = available.min(gap).min(cache_room);

        let mut issued = 0usize;
        let mut height = block_height;
        while issued < count && height < header_height {
            height += 1;
            let hash = match self.ledger.block_hash(height) {
                Ok(hash) => hash,
                Err(_) => break,
            };
            if self.flights.is_block_on_flight(&hash) || self.cache.contains(height) {
                continue;
            }
            let Some(peer) = self.nodes.next_node(&self.registry, height - 1) else {
                break;
            };
            let flight = FlightInfo::new(peer.id(), height, Instant::now());
            if !self
                .flights
                .try_add_block(hash, flight, self.config.block_window)
            {
                break;
            }
            if !self.send_to(&peer, Message::GetBlock { hash }) {
                break;
            }
            ledgerd_log::log_trace!(
                "Sync: block {height} {} requested from peer {}",
                short_hash(&hash),
                peer.id()
            );
            issued += 1;
        }
        if issued > 0 {
            ledgerd_log::log_debug!(
                "Sync: {issued} block requests issued above height {block_height}"
            );
        }
    }

    pub fn on_header_receive(&self, peer_id: u64, headers: Vec<BlockHeader>) {
        let (Some(first), Some(last)) = (headers.first(), headers.last()) else {
            ledgerd_log::log_warn!("Sync: empty header batch from peer {peer_id}");
            return;
        };
        let (low, high) = (first.height, last.height);
        if !self.flights.del_header(low) {
            ledgerd_log::log_debug!(
                "Sync: headers {low} - {high} from peer {peer_id} not requested, dropped"
            );
            return;
        }
        if let Err(err) = self.ledger.add_headers(&headers) {
            ledgerd_log::log_warn!("Sync: headers {low} - {high} from peer {peer_id}: {err}");
            self.penalize(peer_id);
            return;
        }
        ledgerd_log::log_info!("Header receive height {low} - {high}");
        self.sync_header();
    }

    pub fn on_block_receive(&self, peer_id: u64, block: Block) {
        let height = block.height();
        let hash = block.hash();
        if !self.flights.del_block(&hash) {
            ledgerd_log::log_debug!(
                "Sync: block {height} {} from peer {peer_id} not requested, dropped",
                short_hash(&hash)
            );
            return;
        }
        let header_height = self.ledger.current_header_height();
        if height > header_height.saturating_add(1) {
            ledgerd_log::log_warn!(
                "Sync: block {height} from peer {peer_id} is ahead of header tip {header_height}"
            );
            return;
        }
        let block_height = self.ledger.current_block_height();
        if height <= block_height {
            ledgerd_log::log_debug!("Sync: block {height} from peer {peer_id} already committed");
            return;
        }
        if !self.cache.add(peer_id, block, self.config.block_cache) {
            ledgerd_log::log_warn!("Sync: block cache full, block {height} dropped");
            return;
        }
        self.save_block();
        self.block_kick.notify_one();
    }

    /// Commits cached blocks in height order from the block tip, stopping at the first gap or
    /// the first block the ledger rejects.
    pub fn save_block(&self) {
        let Some(_guard) = PhaseGuard::enter(&self.saving_block) else {
            return;
        };
        let block_height = self.ledger.current_block_height();
        let purged = self.cache.purge(block_height);
        if purged > 0 {
            ledgerd_log::log_debug!("Sync: purged {purged} stale cached blocks");
        }

        let first = block_height.saturating_add(1);
        let mut saved = 0u32;
        for entry in self.cache.pop_contiguous(first) {
            let height = entry.block.height();
            if let Err(err) = self.ledger.add_block(&entry.block) {
                ledgerd_log::log_warn!(
                    "Sync: block {height} from peer {} rejected: {err}",
                    entry.from_peer
                );
                self.penalize(entry.from_peer);
                self.refetch_block(height, entry.from_peer);
                break;
            }
            saved += 1;
        }
        if saved > 0 {
            ledgerd_log::log_debug!("Sync: saved blocks {first} - {}", first + saved - 1);
        }
    }

    /// Re-requests the block at `height` from a peer other than `failed_peer` when possible.
    fn refetch_block(&self, height: u32, failed_peer: u64) {
        let hash = match self.ledger.block_hash(height) {
            Ok(hash) => hash,
            Err(err) => {
                ledgerd_log::log_warn!("Sync: cannot re-fetch block {height}: {err}");
                return;
            }
        };
        let mut flight = FlightInfo::new(failed_peer, height, Instant::now());
        flight.mark_failed();
        let Some(peer) =
            self.nodes
                .node_with_min_failures(&self.registry, &flight, height.saturating_sub(1))
        else {
            ledgerd_log::log_warn!("Sync: no peer to re-fetch block {height}");
            return;
        };
        flight.assign(peer.id());
        self.flights.put_block(hash, flight);
        if self.send_to(&peer, Message::GetBlock { hash }) {
            ledgerd_log::log_info!("Sync: re-fetching block {height} from peer {}", peer.id());
        }
    }

    pub fn check_timeout(&self) {
        self.check_timeout_at(Instant::now());
    }

    /// Timeout sweep against `now`: satisfied flights are dropped, the rest are charged to their
    /// peer and re-sent to the least-failed alternative.
    pub fn check_timeout_at(&self, now: Instant) {
        let header_height = self.ledger.current_header_height();
        let block_height = self.ledger.current_block_height();

        for (height, flight) in self
            .flights
            .expired_headers(now, self.config.header_timeout)
        {
if height <= header_height {
                self.flights.del_header(height);
                continue;
            }
            let Some(flight) = self.flights.retry_header(height, now) else {
                continue;
            };
            self.nodes.record_timeout(flight.peer_id());
            ledgerd_log::log_debug!(
                "Sync: headers {height} from peer {} timed out ({} failures)",
                flight.peer_id(),
                flight.total_failed()
            );
            let Some(peer) = self
                .nodes
                .node_with_min_failures(&self.registry, &flight, header_height)
            else {
                break;
            };
            if !self.flights.assign_header(height, peer.id()) {
                continue;
            }
            let locator = self.ledger.current_header_hash();
            self.send_to(
                &peer,
                Message::GetHeaders {
                    start_height: height,
                    locator,
                },
            );
        }

        for (hash, flight) in self.flights.expired_blocks(now, self.config.block_timeout) {
if flight.height() <= block_height {
                self.flights.del_block(&hash);
                continue;
            }
            let Some(flight) = self.flights.retry_block(&hash, now) else {
                continue;
            };
            self.nodes.record_timeout(flight.peer_id());
            ledgerd_log::log_debug!(
                "Sync: block {} {} from peer {} timed out ({} failures)",
                flight.height(),
                short_hash(&hash),
                flight.peer_id(),
                flight.total_failed()
            );
            let Some(peer) = self.nodes.node_with_min_failures(
                &self.registry,
                &flight,
                flight.height().saturating_sub(1),
            ) else {
                break;
            };
            if !self.flights.assign_block(&hash, peer.id()) {
                continue;
            }
            self.send_to(&peer, Message::GetBlock { hash });
        }
    }
}

impl<L: LedgerAccessor + 'static> SyncManager<L> {
    /// Runs [`SyncManager::run`] on the current tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run().await })
    }
}
