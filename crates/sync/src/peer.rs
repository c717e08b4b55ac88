use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::Sender;
use serde::Serialize;

use crate::message::Message;

/// Handshake progress of one connection. Variants are ordered; a peer only ever moves to a later
/// state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Init,
    /// Version sent, none received.
    Hand,
    /// Version received and answered, waiting for verack.
    HandShake,
    /// Version sent and received, verack sent.
    HandShaked,
    Established,
    Inactivity,
}

impl PeerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Init => "init",
            PeerState::Hand => "hand",
            PeerState::HandShake => "handshake",
            PeerState::HandShaked => "handshaked",
            PeerState::Established => "established",
            PeerState::Inactivity => "inactivity",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkError {
    Closed,
    Disconnected,
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Closed => write!(f, "link closed locally"),
            LinkError::Disconnected => write!(f, "remote end disconnected"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Outbound half of a connection. Sending is fire-and-forget.
pub trait PeerLink: Send + Sync {
    fn send(&self, message: Message) -> Result<(), LinkError>;

    fn close(&self);
}

/// Message delivered to a node's dispatcher, tagged with the sender's id on the receiving side.
#[derive(Debug)]
pub struct Inbound {
    pub peer_id: u64,
    pub message: Message,
}

/// In-process link backed by the remote node's inbox channel.
pub struct ChannelLink {
    remote_id: u64,
    tx: Sender<Inbound>,
    closed: AtomicBool,
}

impl ChannelLink {
    /// `remote_id` is the id the receiving node assigned to this side of the connection.
    pub fn new(remote_id: u64, tx: Sender<Inbound>) -> Self {
        Self {
            remote_id,
            tx,
            closed: AtomicBool::new(false),
        }
    }
}

impl PeerLink for ChannelLink {
    fn send(&self, message: Message) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        self.tx
            .send(Inbound {
                peer_id: self.remote_id,
                message,
            })
            .map_err(|_| LinkError::Disconnected)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct PeerHandle {
    id: u64,
    state: Mutex<PeerState>,
    height: AtomicU32,
    nonce: Mutex<Option<u64>>,
    last_contact: Mutex<Instant>,
    link: Arc<dyn PeerLink>,
}

impl PeerHandle {
    pub fn new(id: u64, link: Arc<dyn PeerLink>) -> Self {
        Self {
            id,
            state: Mutex::new(PeerState::Init),
            height: AtomicU32::new(0),
            nonce: Mutex::new(None),
            last_contact: Mutex::new(Instant::now()),
            link,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> PeerState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(PeerState::Inactivity)
    }

    pub fn is_established(&self) -> bool {
        self.state() == PeerState::Established
    }

    /// Moves `from` -> `to` if the peer is currently in `from` and `to` is later.
    pub fn advance(&self, from: PeerState, to: PeerState) -> bool {
        if to <= from {
            return false;
        }
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    /// Moves to `to` from whatever earlier state the peer is in.
    pub fn advance_to(&self, to: PeerState) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if to <= *state {
            return false;
        }
        *state = to;
        true
    }

    /// Chain height the peer last advertised.
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::Relaxed);
    }

    /// Remote node nonce from its version message, `None` until one arrives.
    pub fn nonce(&self) -> Option<u64> {
        self.nonce.lock().ok().and_then(|nonce| *nonce)
    }

    pub fn set_nonce(&self, nonce: u64) {
        if let Ok(mut slot) = self.nonce.lock() {
            *slot = Some(nonce);
        }
    }

    pub fn touch(&self, now: Instant) {
        if let Ok(mut last) = self.last_contact.lock() {
            if now > *last {
                *last = now;
            }
        }
    }

    pub fn last_contact(&self) -> Instant {
        self.last_contact
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }

    pub fn send(&self, message: Message) -> Result<(), LinkError> {
        self.link.send(message)
    }

    pub fn close(&self) {
        self.link.close();
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("height", &self.height())
            .finish()
    }
}
