//! Ledger accessor contract consumed by the sync engine, plus an in-memory implementation.

pub mod regtest;
pub mod state;

use ledgerd_primitives::{Block, BlockHeader, Hash256};

pub use state::ChainState;

/// Height and append surface of the local chain.
///
/// The ledger is the single source of truth for the current block and header heights; callers
/// re-read them instead of caching.
pub trait LedgerAccessor: Send + Sync {
    fn current_block_height(&self) -> u32;

    fn current_header_height(&self) -> u32;

    fn current_header_hash(&self) -> Hash256;

    /// Hash of the header at `height`; `NotFound` past the header tip.
    fn block_hash(&self, height: u32) -> Result<Hash256, LedgerError>;

    fn add_headers(&self, headers: &[BlockHeader]) -> Result<(), LedgerError>;

    /// Appends the block at `current_block_height() + 1`.
    fn add_block(&self, block: &Block) -> Result<(), LedgerError>;

    /// Up to `limit` headers following the header identified by `locator`.
    fn headers_after(&self, locator: &Hash256, limit: usize) -> Vec<BlockHeader>;

    fn block_by_hash(&self, hash: &Hash256) -> Option<Block>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerError {
    NotFound { height: u32 },
    EmptyChain,
    HeaderGap { expected: u32, got: u32 },
    NonContiguous { height: u32 },
    PrevMismatch { height: u32 },
    HeaderConflict { height: u32 },
    UnexpectedBlockHeight { expected: u32, got: u32 },
    BlockHashMismatch { height: u32 },
    MerkleMismatch { height: u32 },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::NotFound { height } => write!(f, "no header at height {height}"),
            LedgerError::EmptyChain => write!(f, "chain has no genesis block"),
            LedgerError::HeaderGap { expected, got } => {
                write!(f, "header batch starts at {got}, next expected {expected}")
            }
            LedgerError::NonContiguous { height } => {
                write!(f, "header batch is not contiguous at height {height}")
            }
            LedgerError::PrevMismatch { height } => {
                write!(f, "header at height {height} does not link to its parent")
            }
            LedgerError::HeaderConflict { height } => {
                write!(f, "header at height {height} conflicts with the known chain")
            }
            LedgerError::UnexpectedBlockHeight { expected, got } => {
                write!(f, "block height {got} is not the next height {expected}")
            }
            LedgerError::BlockHashMismatch { height } => {
                write!(f, "block at height {height} does not match the known header")
            }
            LedgerError::MerkleMismatch { height } => {
                write!(f, "block at height {height} has a bad merkle root")
            }
        }
    }
}

impl std::error::Error for LedgerError {}
