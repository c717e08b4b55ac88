//! In-process regtest network: source nodes serving a pre-built chain to one syncing node.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ledgerd_chainstate::regtest::{genesis_block, regtest_chain};
use ledgerd_chainstate::{ChainState, LedgerAccessor};
use ledgerd_sync::{
    ChannelLink, Inbound, LinkError, Message, MessageRouter, PeerHandle, PeerLink, PeerRegistry,
    SyncConfig, SyncManager,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::stats::{recent_warnings, snapshot_stats, RunReport, SourceReport};
use crate::Config;

const DISPATCH_POLL: Duration = Duration::from_millis(100);
const COMPLETION_POLL: Duration = Duration::from_millis(25);
pub(crate) const LOG_CAPTURE_LINES: usize = 512;
const REPORT_WARNINGS: usize = 20;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Faults {
    pub drop_percent: u8,
    pub corrupt: bool,
}

/// Outbound link of a misbehaving source: drops some responses and tampers with block bodies.
struct FaultyLink {
    inner: ChannelLink,
    faults: Faults,
    rng: Mutex<StdRng>,
}

impl FaultyLink {
    fn new(inner: ChannelLink, faults: Faults, seed: u64) -> Self {
        Self {
            inner,
            faults,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn should_drop(&self) -> bool {
        if self.faults.drop_percent == 0 {
            return false;
        }
        let Ok(mut rng) = self.rng.lock() else {
            return false;
        };
        rng.gen_range(0..100u8) < self.faults.drop_percent
    }
}

impl PeerLink for FaultyLink {
    fn send(&self, message: Message) -> Result<(), LinkError> {
        let message = match message {
            Message::Headers(_) | Message::Block(_) if self.should_drop() => {
                log_trace!("Regtest: dropped {} response", message.command());
                return Ok(());
            }
            Message::Block(mut block) if self.faults.corrupt => {
                block.transactions.push(b"tampered".to_vec());
                Message::Block(block)
            }
            other => other,
        };
        self.inner.send(message)
    }

    fn close(&self) {
        self.inner.close();
    }
}

pub(crate) struct NetNode {
    name: String,
    router: Arc<MessageRouter<ChainState>>,
    inbox_tx: Sender<Inbound>,
    inbox: Receiver<Inbound>,
}

impl NetNode {
    fn new(name: String, nonce: u64, ledger: ChainState, config: SyncConfig) -> Self {
        let sync = Arc::new(SyncManager::new(
            config,
            Arc::new(ledger),
            Arc::new(PeerRegistry::new()),
        ));
        let (inbox_tx, inbox) = crossbeam_channel::unbounded();
        Self {
            name,
            router: Arc::new(MessageRouter::new(nonce, sync)),
            inbox_tx,
            inbox,
        }
    }

    pub(crate) fn sync(&self) -> &Arc<SyncManager<ChainState>> {
        self.router.sync()
    }

    fn registry(&self) -> &Arc<PeerRegistry> {
        self.sync().registry()
    }
}

pub(crate) struct Source {
    node: NetNode,
    faults: Faults,
    /// Id the syncing node assigned to this source.
    peer_id: u64,
}

pub(crate) struct RegtestNetwork {
    local: NetNode,
    sources: Vec<Source>,
    target_height: u32,
}

impl RegtestNetwork {
    pub(crate) fn build(config: &Config) -> Result<Self, String> {
        let chain = regtest_chain(config.chain_length);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let local_nonce: u64 = rng.gen();
        let local = NetNode::new(
            "local".to_string(),
            local_nonce,
            ChainState::new(genesis_block()),
            config.sync.clone(),
        );

        let mut sources = Vec::with_capacity(config.peers);
        for index in 0..config.peers {
            let faults = Faults {
                drop_percent: if index >= config.peers - config.lossy_peers {
                    config.drop_percent
                } else {
                    0
                },
                corrupt: index < config.corrupt_peers,
            };
            let ledger = ChainState::from_blocks(chain.clone()).map_err(|err| err.to_string())?;
            let node = NetNode::new(
                format!("source-{}", index + 1),
                local_nonce.wrapping_add(index as u64 + 1),
                ledger,
                config.sync.clone(),
            );
            let peer_id = wire(&local, &node, faults, rng.gen());
            sources.push(Source {
                node,
                faults,
                peer_id,
            });
        }

        Ok(Self {
            local,
            sources,
            target_height: config.chain_length,
        })
    }

    pub(crate) fn local(&self) -> &NetNode {
        &self.local
    }

    fn nodes(&self) -> impl Iterator<Item = &NetNode> {
        std::iter::once(&self.local).chain(self.sources.iter().map(|source| &source.node))
    }

    fn is_synced(&self) -> bool {
        self.local.sync().ledger().current_block_height() >= self.target_height
    }

    fn source_reports(&self) -> Vec<SourceReport> {
        let local = self.local.sync();
        self.sources
            .iter()
            .map(|source| SourceReport {
                name: source.node.name.clone(),
                peer_id: source.peer_id,
                chain_height: source.node.sync().ledger().current_block_height(),
                drop_percent: source.faults.drop_percent,
                corrupt: source.faults.corrupt,
                connected: local.registry().get(source.peer_id).is_some(),
                sync_node: local.nodes().contains(source.peer_id),
                timeouts: local.nodes().timeouts(source.peer_id),
                error_responses: local.nodes().error_responses(source.peer_id),
            })
            .collect()
    }
}

/// Registers `local` and `source` with each other. Returns the id `local` uses for `source`.
fn wire(local: &NetNode, source: &NetNode, faults: Faults, seed: u64) -> u64 {
    let source_id = local.registry().next_id();
    let local_id = source.registry().next_id();
    let to_source = ChannelLink::new(local_id, source.inbox_tx.clone());
    let to_local = ChannelLink::new(source_id, local.inbox_tx.clone());
    local.registry().insert(Arc::new(PeerHandle::new(
        source_id,
        Arc::new(to_source),
    )));
    let to_local: Arc<dyn PeerLink> = if faults == Faults::default() {
        Arc::new(to_local)
    } else {
        Arc::new(FaultyLink::new(to_local, faults, seed))
    };
    source
        .registry()
        .insert(Arc::new(PeerHandle::new(local_id, to_local)));
    source_id
}

fn spawn_dispatcher(
    node: &NetNode,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<thread::JoinHandle<()>, String> {
    let router = Arc::clone(&node.router);
    let inbox = node.inbox.clone();
    thread::Builder::new()
        .name(format!("dispatch-{}", node.name))
        .spawn(move || loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match inbox.recv_timeout(DISPATCH_POLL) {
                Ok(inbound) => router.dispatch(inbound),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .map_err(|err| err.to_string())
}

fn spawn_heartbeat(
    routers: Vec<Arc<MessageRouter<ChainState>>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for router in &routers {
                        let expired = router.heartbeat(now);
                        if expired > 0 {
                            log_warn!("Regtest: {expired} peers expired");
                        }
                    }
                }
            }
        }
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Outcome {
    Completed,
    TimedOut,
    Interrupted,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::TimedOut => "timed out",
            Outcome::Interrupted => "interrupted",
        }
    }
}

async fn wait_for_outcome(
    network: &RegtestNetwork,
    max_runtime: Option<Duration>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Outcome {
    let deadline = max_runtime.map(|limit| Instant::now() + limit);
    let mut poll = tokio::time::interval(COMPLETION_POLL);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return Outcome::Interrupted,
            _ = poll.tick() => {
                if network.is_synced() {
                    return Outcome::Completed;
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Outcome::TimedOut;
                }
            }
        }
    }
}

/// Runs the network until the syncing node reaches the source tip, the runtime limit expires or
/// `shutdown_tx` fires.
pub(crate) async fn run_network(
    config: &Config,
    start_time: Instant,
    shutdown_tx: &watch::Sender<bool>,
) -> Result<RunReport, String> {
    let network = RegtestNetwork::build(config)?;
    log_info!(
        "Regtest: {} sources ({} lossy at {}%, {} corrupt), chain length {}",
        config.peers,
        config.lossy_peers,
        config.drop_percent,
        config.corrupt_peers,
        config.chain_length
    );

    let mut dispatchers = Vec::new();
    for node in network.nodes() {
        dispatchers.push(spawn_dispatcher(node, shutdown_tx.subscribe())?);
    }
    let sync_tasks: Vec<JoinHandle<()>> = network.nodes().map(|node| node.sync().spawn()).collect();
    let routers = network
        .nodes()
        .map(|node| Arc::clone(&node.router))
        .collect();
    let heartbeat = spawn_heartbeat(
        routers,
        config.sync.ping_interval,
        shutdown_tx.subscribe(),
    );
    crate::spawn_status_logger(
        Arc::clone(network.local().sync()),
        start_time,
        config.status_interval_secs,
        shutdown_tx.subscribe(),
    );

    for source in &network.sources {
        if let Err(err) = network.local.router.connect(source.peer_id) {
            log_warn!("Regtest: connect to {} failed: {err}", source.node.name);
        }
    }

    let sync_start = Instant::now();
    let max_runtime = config.max_runtime_secs.map(Duration::from_secs);
    let outcome = wait_for_outcome(&network, max_runtime, shutdown_tx.subscribe()).await;
    let elapsed_ms: u64 = sync_start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
    log_info!("Regtest: {} after {elapsed_ms}ms", outcome.as_str());

    shutdown_tx.send_replace(true);
    for node in network.nodes() {
        node.sync().close();
    }
    for task in sync_tasks {
        if let Err(err) = task.await {
            log_warn!("Regtest: sync task failed: {err}");
        }
    }
    if let Err(err) = heartbeat.await {
        log_warn!("Regtest: heartbeat task failed: {err}");
    }
    for dispatcher in dispatchers {
        if dispatcher.join().is_err() {
            log_warn!("Regtest: dispatcher thread panicked");
        }
    }
    log_debug!("Regtest: all nodes stopped");

    let local = network.local().sync();
    Ok(RunReport {
        outcome: outcome.as_str().to_string(),
        completed: outcome == Outcome::Completed,
        target_height: network.target_height,
        elapsed_ms,
        local: snapshot_stats(local, start_time)?,
        peers: local.registry().snapshot(),
        sources: network.source_reports(),
        recent_warnings: recent_warnings(LOG_CAPTURE_LINES, REPORT_WARNINGS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_link() -> (ChannelLink, Receiver<Inbound>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ChannelLink::new(7, tx), rx)
    }

    #[test]
    fn faulty_link_tampers_blocks_only() {
        let chain = regtest_chain(2);
        let (inner, rx) = channel_link();
        let link = FaultyLink::new(
            inner,
            Faults {
                drop_percent: 0,
                corrupt: true,
            },
            1,
        );
        link.send(Message::Block(Box::new(chain[2].clone())))
            .expect("send");
        link.send(Message::Ping { height: 2 }).expect("send");

        match rx.try_recv().expect("block").message {
            Message::Block(block) => {
                assert_eq!(block.hash(), chain[2].hash());
                assert_ne!(block.compute_merkle_root(), block.header.merkle_root);
            }
            other => panic!("unexpected {}", other.command()),
        }
        assert_eq!(rx.try_recv().expect("ping").message, Message::Ping { height: 2 });
    }

    #[test]
    fn faulty_link_drops_only_responses() {
        let chain = regtest_chain(1);
        let (inner, rx) = channel_link();
        let link = FaultyLink::new(
            inner,
            Faults {
                drop_percent: 100,
                corrupt: false,
            },
            1,
        );
        link.send(Message::Block(Box::new(chain[1].clone())))
            .expect("send");
        link.send(Message::Headers(vec![chain[1].header.clone()]))
            .expect("send");
        link.send(Message::Verack).expect("send");
        let delivered: Vec<Message> = rx.try_iter().map(|inbound| inbound.message).collect();
        assert_eq!(delivered, vec![Message::Verack]);
    }

    #[test]
    fn build_assigns_faults_to_sources() {
        let config = Config {
            peers: 4,
            chain_length: 10,
            lossy_peers: 2,
            drop_percent: 40,
            corrupt_peers: 1,
            ..Config::default()
        };
        let network = RegtestNetwork::build(&config).expect("network");
        let faults: Vec<Faults> = network.sources.iter().map(|source| source.faults).collect();
        assert_eq!(
            faults,
            vec![
                Faults {
                    drop_percent: 0,
                    corrupt: true
                },
                Faults::default(),
                Faults {
                    drop_percent: 40,
                    corrupt: false
                },
                Faults {
                    drop_percent: 40,
                    corrupt: false
                },
            ]
        );
        assert_eq!(network.local.registry().count(), 4);
        for source in &network.sources {
            assert_eq!(source.node.registry().count(), 1);
            assert_eq!(source.node.sync().ledger().current_block_height(), 10);
        }
        assert!(!network.is_synced());
    }

    #[test]
    fn regtest_network_syncs_despite_faulty_sources() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let mut config = Config {
            peers: 3,
            chain_length: 150,
            lossy_peers: 1,
            drop_percent: 30,
            corrupt_peers: 1,
            status_interval_secs: 0,
            max_runtime_secs: Some(60),
            ..Config::default()
        };
        config.sync.tick_interval = Duration::from_millis(10);
        config.sync.header_timeout = Duration::from_millis(200);
        config.sync.block_timeout = Duration::from_millis(200);

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let report = runtime
            .block_on(run_network(&config, Instant::now(), &shutdown_tx))
            .expect("run");
        assert!(report.completed, "{}", report.render_text());
        assert_eq!(report.local.best_block_height, 150);
        assert_eq!(report.local.best_header_height, 150);
        assert_eq!(report.sources.len(), 3);
        let corrupt = &report.sources[0];
        assert!(corrupt.corrupt);
        // Rejections are counted until the node list gives up on the peer.
        assert!(corrupt.error_responses > 0 || !corrupt.sync_node);
    }
}
