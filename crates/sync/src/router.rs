//! Per-node message dispatch: handshake, heartbeat, serving, and hand-off to the sync manager.

use std::sync::Arc;
use std::time::Instant;

use ledgerd_chainstate::LedgerAccessor;

use crate::manager::SyncManager;
use crate::message::Message;
use crate::peer::{Inbound, LinkError, PeerHandle, PeerState};

#[derive(Debug, Eq, PartialEq)]
pub enum RouteError {
    UnknownPeer(u64),
    SelfConnection,
    InvalidState {
        command: &'static str,
        state: PeerState,
    },
    Link(LinkError),
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::UnknownPeer(id) => write!(f, "unknown peer {id}"),
            RouteError::SelfConnection => write!(f, "connected to self"),
            RouteError::InvalidState { command, state } => {
                write!(f, "unexpected {command} in state {}", state.as_str())
            }
            RouteError::Link(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RouteError {}

impl From<LinkError> for RouteError {
    fn from(err: LinkError) -> Self {
        RouteError::Link(err)
    }
}

pub struct MessageRouter<L> {
    local_nonce: u64,
    sync: Arc<SyncManager<L>>,
}

impl<L: LedgerAccessor> MessageRouter<L> {
    pub fn new(local_nonce: u64, sync: Arc<SyncManager<L>>) -> Self {
        Self { local_nonce, sync }
    }

    pub fn local_nonce(&self) -> u64 {
        self.local_nonce
    }

    pub fn sync(&self) -> &Arc<SyncManager<L>> {
        &self.sync
    }

    fn peer(&self, peer_id: u64) -> Result<Arc<PeerHandle>, RouteError> {
        self.sync
            .registry()
            .get(peer_id)
            .ok_or(RouteError::UnknownPeer(peer_id))
    }

    fn version(&self) -> Message {
        Message::Version {
            nonce: self.local_nonce,
            start_height: self.sync.ledger().current_block_height(),
        }
    }

    /// Opens the handshake on an outbound connection.
    pub fn connect(&self, peer_id: u64) -> Result<(), RouteError> {
        let peer = self.peer(peer_id)?;
        if !peer.advance(PeerState::Init, PeerState::Hand) {
            return Err(RouteError::InvalidState {
                command: "version",
                state: peer.state(),
            });
        }
        peer.send(self.version())?;
        Ok(())
    }

    /// Handles one inbound message, disconnecting the peer on protocol or link errors.
    pub fn dispatch(&self, inbound: Inbound) {
        let Inbound { peer_id, message } = inbound;
        let command = message.command();
        match self.handle(peer_id, message) {
            Ok(()) => {}
            Err(RouteError::UnknownPeer(_)) => {
                ledgerd_log::log_debug!("P2P: {command} from unknown peer {peer_id} dropped");
            }
            Err(err) => {
                ledgerd_log::log_warn!("P2P: peer {peer_id} {command}: {err}");
                self.disconnect(peer_id);
            }
        }
    }

    pub fn handle(&self, peer_id: u64, message: Message) -> Result<(), RouteError> {
        let peer = self.peer(peer_id)?;
        peer.touch(Instant::now());
        match message {
            Message::Version {
                nonce,
                start_height,
            } => return self.on_version(&peer, nonce, start_height),
            Message::Verack => return self.on_verack(&peer),
            _ => {}
        }
        if !peer.is_established() {
            ledgerd_log::log_warn!(
                "P2P: {} from peer {peer_id} before handshake, dropped",
                message.command()
            );
            return Ok(());
        }

        let ledger = self.sync.ledger();
        match message {
            Message::Ping { height } => {
                peer.set_height(height);
                peer.send(Message::Pong {
                    height: ledger.current_block_height(),
                })?;
            }
            Message::Pong { height } => peer.set_height(height),
            Message::GetHeaders { locator, .. } => {
                let headers =
                    ledger.headers_after(&locator, self.sync.config().max_headers_per_reply);
                if !headers.is_empty() {
                    peer.send(Message::Headers(headers))?;
                }
            }
            Message::Headers(headers) => self.sync.on_header_receive(peer_id, headers),
            Message::GetBlock { hash } => match ledger.block_by_hash(&hash) {
                Some(block) => peer.send(Message::Block(Box::new(block)))?,
                None => ledgerd_log::log_trace!("P2P: peer {peer_id} asked for unknown block"),
            },
            Message::Block(block) => self.sync.on_block_receive(peer_id, *block),
            Message::Version { .. } | Message::Verack => {}
        }
        Ok(())
    }

    fn on_version(
        &self,
        peer: &PeerHandle,
        nonce: u64,
        start_height: u32,
    ) -> Result<(), RouteError> {
        if nonce == self.local_nonce {
            return Err(RouteError::SelfConnection);
        }
        if let Some(stale) = self.sync.registry().find_by_nonce(nonce, peer.id()) {
            ledgerd_log::log_info!(
                "P2P: peer {} reconnected as {}, dropping the old connection",
                stale.id(),
                peer.id()
            );
            self.disconnect(stale.id());
        }

        let state = peer.state();
        let (next, reply) = match state {
            PeerState::Init => (PeerState::HandShake, self.version()),
            PeerState::Hand => (PeerState::HandShaked, Message::Verack),
            _ => {
                return Err(RouteError::InvalidState {
                    command: "version",
                    state,
                })
            }
        };
        peer.set_nonce(nonce);
        peer.set_height(start_height);
        // The reply may be answered before this returns, so the state moves first.
        if !peer.advance(state, next) {
            return Err(RouteError::InvalidState {
                command: "version",
                state: peer.state(),
            });
        }
        peer.send(reply)?;
        Ok(())
    }

    fn on_verack(&self, peer: &PeerHandle) -> Result<(), RouteError> {
        let state = peer.state();
        let reply = match state {
            PeerState::HandShake => true,
            PeerState::HandShaked => false,
            _ => {
                return Err(RouteError::InvalidState {
                    command: "verack",
                    state,
                })
            }
        };
        if !peer.advance(state, PeerState::Established) {
            return Err(RouteError::InvalidState {
                command: "verack",
                state: peer.state(),
            });
        }
        if reply {
            peer.send(Message::Verack)?;
        }
        ledgerd_log::log_info!(
            "P2P: peer {} established (height {})",
            peer.id(),
            peer.height()
        );
        self.sync.on_add_node(peer.id());
        Ok(())
    }

    /// Removes the peer, closes its link and takes it out of the sync node list.
    pub fn disconnect(&self, peer_id: u64) {
        let Some(peer) = self.sync.registry().remove(peer_id) else {
            return;
        };
        peer.advance_to(PeerState::Inactivity);
        peer.close();
        self.sync.on_del_node(peer_id);
        ledgerd_log::log_info!("P2P: peer {peer_id} disconnected");
    }

    /// Pings established peers and drops any peer silent for longer than the keepalive timeout.
    /// Returns the number of peers dropped.
    pub fn heartbeat(&self, now: Instant) -> usize {
        let timeout = self.sync.config().keepalive_timeout;
        let height = self.sync.ledger().current_block_height();
        let mut expired = 0;
        for peer in self.sync.registry().peers() {
            if now.saturating_duration_since(peer.last_contact()) > timeout {
                ledgerd_log::log_warn!(
                    "P2P: peer {} silent for over {}s",
                    peer.id(),
                    timeout.as_secs()
                );
                self.disconnect(peer.id());
                expired += 1;
                continue;
            }
            if !peer.is_established() {
                continue;
            }
            if let Err(err) = peer.send(Message::Ping { height }) {
                ledgerd_log::log_debug!("P2P: ping to peer {} failed: {err}", peer.id());
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::peer::ChannelLink;
    use crate::registry::PeerRegistry;
    use crossbeam_channel::{Receiver, Sender};
    use ledgerd_chainstate::regtest::regtest_chain;
    use ledgerd_chainstate::ChainState;
    use ledgerd_primitives::Block;
    use std::time::Duration;

    struct TestNode {
        router: MessageRouter<ChainState>,
        tx: Sender<Inbound>,
        inbox: Receiver<Inbound>,
    }

    impl TestNode {
        fn new(nonce: u64, blocks: Vec<Block>) -> Self {
            let ledger = Arc::new(ChainState::from_blocks(blocks).expect("chain"));
            let registry = Arc::new(PeerRegistry::new());
            let sync = Arc::new(SyncManager::new(SyncConfig::default(), ledger, registry));
            let (tx, inbox) = crossbeam_channel::unbounded();
            Self {
                router: MessageRouter::new(nonce, sync),
                tx,
                inbox,
            }
        }

        fn registry(&self) -> &Arc<PeerRegistry> {
            self.router.sync().registry()
        }

        fn peer(&self, id: u64) -> Arc<PeerHandle> {
            self.registry().get(id).expect("peer")
        }
    }

    /// Registers each side with the other. Returns (id of `b` at `a`, id of `a` at `b`).
    fn wire(a: &TestNode, b: &TestNode) -> (u64, u64) {
        let b_at_a = a.registry().next_id();
        let a_at_b = b.registry().next_id();
        a.registry().insert(Arc::new(PeerHandle::new(
            b_at_a,
            Arc::new(ChannelLink::new(a_at_b, b.tx.clone())),
        )));
        b.registry().insert(Arc::new(PeerHandle::new(
            a_at_b,
            Arc::new(ChannelLink::new(b_at_a, a.tx.clone())),
        )));
        (b_at_a, a_at_b)
    }

    fn pump(nodes: &[&TestNode]) {
        loop {
            let mut moved = false;
            for node in nodes {
                while let Ok(inbound) = node.inbox.try_recv() {
                    node.router.dispatch(inbound);
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let chain = regtest_chain(12);
        let local = TestNode::new(1, chain[..1].to_vec());
        let remote = TestNode::new(2, chain.clone());
        let (remote_id, local_id) = wire(&local, &remote);

        local.router.connect(remote_id).expect("connect");
        assert_eq!(local.peer(remote_id).state(), PeerState::Hand);
        pump(&[&local, &remote]);

        let remote_at_local = local.peer(remote_id);
        let local_at_remote = remote.peer(local_id);
        assert_eq!(remote_at_local.state(), PeerState::Established);
        assert_eq!(local_at_remote.state(), PeerState::Established);
        assert_eq!(remote_at_local.height(), 12);
        assert_eq!(remote_at_local.nonce(), Some(2));
        assert_eq!(local_at_remote.height(), 0);
        assert!(local.router.sync().nodes().contains(remote_id));
        assert!(remote.router.sync().nodes().contains(local_id));
    }

    #[test]
    fn self_connection_is_dropped() {
        let chain = regtest_chain(1);
        let a = TestNode::new(5, chain.clone());
        let b = TestNode::new(5, chain);
        let (b_at_a, a_at_b) = wire(&a, &b);
        a.router.connect(b_at_a).expect("connect");
        pump(&[&a, &b]);
        assert!(b.registry().get(a_at_b).is_none());
    }

    #[test]
    fn version_after_handshake_disconnects() {
        let chain = regtest_chain(3);
        let a = TestNode::new(1, chain.clone());
        let b = TestNode::new(2, chain);
        let (b_at_a, a_at_b) = wire(&a, &b);
        a.router.connect(b_at_a).expect("connect");
        pump(&[&a, &b]);

        let err = b
            .router
            .handle(
                a_at_b,
                Message::Version {
                    nonce: 1,
                    start_height: 3,
                },
            )
            .unwrap_err();
        assert!(matches!(err, RouteError::InvalidState { command: "version", .. }));

        b.router.dispatch(Inbound {
            peer_id: a_at_b,
            message: Message::Verack,
        });
        assert!(b.registry().get(a_at_b).is_none());
        assert!(!b.router.sync().nodes().contains(a_at_b));
    }

    #[test]
    fn messages_before_handshake_are_ignored() {
        let chain = regtest_chain(3);
        let a = TestNode::new(1, chain.clone());
        let b = TestNode::new(2, chain.clone());
        let (_, a_at_b) = wire(&a, &b);
        b.router
            .handle(a_at_b, Message::GetBlock { hash: chain[1].hash() })
            .expect("ignored");
        assert!(a.inbox.try_recv().is_err());
        assert!(b.registry().get(a_at_b).is_some());
    }

    #[test]
    fn reconnect_with_same_nonce_replaces_old_peer() {
        let chain = regtest_chain(2);
        let a = TestNode::new(1, chain.clone());
        let b = TestNode::new(2, chain);
        let (first, _) = wire(&a, &b);
        a.router.connect(first).expect("connect");
        pump(&[&a, &b]);
        assert!(a.router.sync().nodes().contains(first));

        let (second, _) = wire(&a, &b);
        a.router.connect(second).expect("connect");
        pump(&[&a, &b]);
        assert!(a.registry().get(first).is_none());
        assert_eq!(a.peer(second).state(), PeerState::Established);
        assert_eq!(a.router.sync().nodes().ids(), vec![second]);
    }

    #[test]
    fn version_nonce_only_matches_announced_peers() {
        let chain = regtest_chain(2);
        let a = TestNode::new(1, chain.clone());
        let b = TestNode::new(2, chain.clone());
        let c = TestNode::new(3, chain);
        let (b_at_a, _) = wire(&a, &b);
        let (c_at_a, _) = wire(&a, &c);

        // Neither peer has announced a nonce yet, so zero matches nothing.
        a.router
            .handle(c_at_a, Message::Version { nonce: 0, start_height: 2 })
            .expect("version");
        assert!(a.registry().get(b_at_a).is_some());
        assert_eq!(a.peer(b_at_a).nonce(), None);
        assert_eq!(a.peer(c_at_a).nonce(), Some(0));
        assert_eq!(a.peer(c_at_a).state(), PeerState::HandShake);
    }

    #[test]
    fn ping_updates_height_and_is_answered() {
        let chain = regtest_chain(4);
        let a = TestNode::new(1, chain.clone());
        let b = TestNode::new(2, chain);
        let (b_at_a, a_at_b) = wire(&a, &b);
        a.router.connect(b_at_a).expect("connect");
        pump(&[&a, &b]);

        b.router
            .handle(a_at_b, Message::Ping { height: 40 })
            .expect("ping");
        assert_eq!(b.peer(a_at_b).height(), 40);
        let reply = a.inbox.try_recv().expect("pong");
        assert_eq!(reply.message, Message::Pong { height: 4 });
    }

    #[test]
    fn serves_headers_and_blocks() {
        let chain = regtest_chain(8);
        let a = TestNode::new(1, chain[..1].to_vec());
        let b = TestNode::new(2, chain.clone());
        let (b_at_a, a_at_b) = wire(&a, &b);
        a.router.connect(b_at_a).expect("connect");
        pump(&[&a, &b]);

        b.router
            .handle(
                a_at_b,
                Message::GetHeaders {
                    start_height: 4,
                    locator: chain[3].hash(),
                },
            )
            .expect("getheaders");
        match a.inbox.try_recv().expect("headers").message {
            Message::Headers(headers) => {
                let heights: Vec<u32> = headers.iter().map(|h| h.height).collect();
                assert_eq!(heights, vec![4, 5, 6, 7, 8]);
            }
            other => panic!("unexpected {}", other.command()),
        }

        b.router
            .handle(a_at_b, Message::GetBlock { hash: chain[6].hash() })
            .expect("getblock");
        let reply = a.inbox.try_recv().expect("block");
        assert_eq!(reply.message, Message::Block(Box::new(chain[6].clone())));

        b.router
            .handle(a_at_b, Message::GetBlock { hash: [3u8; 32] })
            .expect("unknown block");
        assert!(a.inbox.try_recv().is_err());
    }

    #[test]
    fn heartbeat_pings_and_expires() {
        let chain = regtest_chain(2);
        let a = TestNode::new(1, chain.clone());
        let b = TestNode::new(2, chain);
        let (b_at_a, _) = wire(&a, &b);
        a.router.connect(b_at_a).expect("connect");
        pump(&[&a, &b]);

        assert_eq!(a.router.heartbeat(Instant::now()), 0);
        let ping = b.inbox.try_recv().expect("ping");
        assert_eq!(ping.message, Message::Ping { height: 2 });

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(a.router.heartbeat(later), 1);
        assert!(a.registry().get(b_at_a).is_none());
        assert!(a.router.sync().nodes().is_empty());
    }

    #[test]
    fn ticks_and_pumping_sync_a_fresh_node() {
        let chain = regtest_chain(30);
        let local = TestNode::new(1, chain[..1].to_vec());
        let remote = TestNode::new(2, chain.clone());
        let (remote_id, _) = wire(&local, &remote);
        local.router.connect(remote_id).expect("connect");
        pump(&[&local, &remote]);

        for _ in 0..5 {
            local.router.sync().tick();
            pump(&[&local, &remote]);
        }
        let ledger = local.router.sync().ledger();
        assert_eq!(ledger.current_header_height(), 30);
        assert_eq!(ledger.current_block_height(), 30);
        assert_eq!(ledger.current_header_hash(), chain[30].hash());
    }
}
