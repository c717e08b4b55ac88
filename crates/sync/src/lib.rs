//! Block synchronization engine.
//!
//! A [`SyncManager`] pulls headers and then block bodies from established peers, keeping at most
//! one outstanding request per header height and per block hash, retrying stuck requests on other
//! peers, and committing received blocks to the ledger strictly in height order. The
//! [`MessageRouter`] runs the peer handshake, heartbeat and request serving around it.

pub mod cache;
pub mod config;
pub mod flight;
pub mod manager;
pub mod message;
pub mod peer;
pub mod registry;
pub mod router;
pub mod selection;

pub use cache::{BlockCache, CachedBlock};
pub use config::SyncConfig;
pub use flight::{FlightInfo, FlightTracker};
pub use manager::{SyncManager, SyncSnapshot};
pub use message::Message;
pub use peer::{ChannelLink, Inbound, LinkError, PeerHandle, PeerLink, PeerState};
pub use registry::{PeerInfo, PeerRegistry};
pub use router::{MessageRouter, RouteError};
pub use selection::NodeList;
