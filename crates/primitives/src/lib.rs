//! Hash, header and block types shared by the ledger and the sync engine.

pub mod block;
pub mod encoding;
pub mod hash;

pub type Hash256 = [u8; 32];

pub use block::{merkle_root, Block, BlockHeader, CURRENT_VERSION};
pub use hash::{hash256_to_hex, sha256, sha256d, short_hash};
