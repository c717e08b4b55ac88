use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ledgerd_primitives::{short_hash, Block, BlockHeader, Hash256};

use crate::{LedgerAccessor, LedgerError};

#[derive(Clone, Debug)]
struct HeaderEntry {
    header: BlockHeader,
    hash: Hash256,
}

struct Inner {
    headers: Vec<HeaderEntry>,
    by_hash: HashMap<Hash256, u32>,
    blocks: Vec<Block>,
}

impl Inner {
    fn header_tip(&self) -> u32 {
        self.headers.len().saturating_sub(1) as u32
    }

    fn block_tip(&self) -> u32 {
        self.blocks.len().saturating_sub(1) as u32
    }
}

/// In-memory chain: a header index running ahead of the committed blocks.
pub struct ChainState {
    inner: RwLock<Inner>,
}

impl ChainState {
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, 0);
        Self {
            inner: RwLock::new(Inner {
                headers: vec![HeaderEntry {
                    header: genesis.header.clone(),
                    hash,
                }],
                by_hash,
                blocks: vec![genesis],
            }),
        }
    }

    /// Builds a fully committed chain from `blocks`, the first of which is genesis.
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self, LedgerError> {
        let mut iter = blocks.into_iter();
        let genesis = iter.next().ok_or(LedgerError::EmptyChain)?;
        let state = Self::new(genesis);
        let rest: Vec<Block> = iter.collect();
        let headers: Vec<BlockHeader> = rest.iter().map(|block| block.header.clone()).collect();
        state.add_headers(&headers)?;
        for block in &rest {
            state.add_block(block)?;
        }
        Ok(state)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LedgerAccessor for ChainState {
    fn current_block_height(&self) -> u32 {
        self.read().block_tip()
    }

    fn current_header_height(&self) -> u32 {
        self.read().header_tip()
    }

    fn current_header_hash(&self) -> Hash256 {
        let inner = self.read();
        inner
            .headers
            .last()
            .map(|entry| entry.hash)
            .unwrap_or_default()
    }

    fn block_hash(&self, height: u32) -> Result<Hash256, LedgerError> {
        self.read()
            .headers
            .get(height as usize)
            .map(|entry| entry.hash)
            .ok_or(LedgerError::NotFound { height })
    }

    fn add_headers(&self, headers: &[BlockHeader]) -> Result<(), LedgerError> {
        let Some(first) = headers.first() else {
            return Ok(());
        };
        let mut inner = self.write();
        let tip = inner.header_tip();
        let start = first.height;
        if start > tip + 1 {
            return Err(LedgerError::HeaderGap {
                expected: tip + 1,
                got: start,
            });
        }

        let mut prev = match start.checked_sub(1) {
            Some(parent) => inner.headers[parent as usize].hash,
            None => [0u8; 32],
        };
        let mut staged = Vec::new();
        for (offset, header) in headers.iter().enumerate() {
            let height = start + offset as u32;
            if header.height != height {
                return Err(LedgerError::NonContiguous { height });
            }
            let hash = header.hash();
            if height <= tip {
                if inner.headers[height as usize].hash != hash {
                    return Err(LedgerError::HeaderConflict { height });
                }
                prev = hash;
                continue;
            }
            if header.prev_block != prev {
                return Err(LedgerError::PrevMismatch { height });
            }
            staged.push(HeaderEntry {
                header: header.clone(),
                hash,
            });
            prev = hash;
        }

        if let (Some(low), Some(high)) = (staged.first(), staged.last()) {
            ledgerd_log::log_debug!(
                "headers {}..{} accepted (tip {})",
                low.header.height,
                high.header.height,
                short_hash(&high.hash)
            );
        }
        for entry in staged {
            inner.by_hash.insert(entry.hash, entry.header.height);
            inner.headers.push(entry);
        }
        Ok(())
    }

    fn add_block(&self, block: &Block) -> Result<(), LedgerError> {
        let mut inner = self.write();
        let expected = inner.blocks.len() as u32;
        let height = block.height();
        if height != expected {
            return Err(LedgerError::UnexpectedBlockHeight {
                expected,
                got: height,
            });
        }
        let entry = inner
            .headers
            .get(height as usize)
            .ok_or(LedgerError::NotFound { height })?;
        if block.hash() != entry.hash {
            return Err(LedgerError::BlockHashMismatch { height });
        }
        if block.compute_merkle_root() != block.header.merkle_root {
            return Err(LedgerError::MerkleMismatch { height });
        }
        inner.blocks.push(block.clone());
        Ok(())
    }

    fn headers_after(&self, locator: &Hash256, limit: usize) -> Vec<BlockHeader> {
        let inner = self.read();
        let Some(&height) = inner.by_hash.get(locator) else {
            return Vec::new();
        };
        inner
            .headers
            .iter()
            .skip(height as usize + 1)
            .take(limit)
            .map(|entry| entry.header.clone())
            .collect()
    }

    fn block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        let inner = self.read();
        let height = *inner.by_hash.get(hash)?;
        inner.blocks.get(height as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regtest::regtest_chain;

    #[test]
    fn genesis_only_chain() {
        let chain = regtest_chain(0);
        let state = ChainState::new(chain[0].clone());
        assert_eq!(state.current_block_height(), 0);
        assert_eq!(state.current_header_height(), 0);
        assert_eq!(state.current_header_hash(), chain[0].hash());
        assert_eq!(state.block_hash(0), Ok(chain[0].hash()));
        assert_eq!(state.block_hash(1), Err(LedgerError::NotFound { height: 1 }));
    }

    #[test]
    fn from_blocks_commits_everything() {
        let chain = regtest_chain(20);
        let state = ChainState::from_blocks(chain.clone()).expect("chain");
        assert_eq!(state.current_block_height(), 20);
        assert_eq!(state.current_header_height(), 20);
        assert_eq!(state.block_by_hash(&chain[7].hash()), Some(chain[7].clone()));
        assert!(ChainState::from_blocks(Vec::new()).is_err());
    }

    #[test]
    fn empty_header_batch_is_a_no_op() {
        let chain = regtest_chain(2);
        let state = ChainState::new(chain[0].clone());
        state.add_headers(&[]).expect("empty");
        assert_eq!(state.current_header_height(), 0);
    }
}
