//! Deterministic chains for local networks and tests.

use ledgerd_primitives::{Block, BlockHeader, CURRENT_VERSION};

const GENESIS_TIME: u32 = 1_700_000_000;
const BLOCK_SPACING_SECS: u32 = 30;

pub fn genesis_block() -> Block {
    Block::new(
        BlockHeader {
            version: CURRENT_VERSION,
            height: 0,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: GENESIS_TIME,
            nonce: 0,
        },
        vec![b"ledgerd regtest genesis".to_vec()],
    )
}

/// Builds `child` on top of `parent`, committing to a coinbase-like body tagged with `tag`.
pub fn next_block(parent: &Block, tag: u64) -> Block {
    let height = parent.height() + 1;
    let mut coinbase = height.to_le_bytes().to_vec();
    coinbase.extend_from_slice(&tag.to_le_bytes());
    let mut body = vec![coinbase];
    if height % 3 == 0 {
        body.push(format!("tx-{height}").into_bytes());
    }
    Block::new(
        BlockHeader {
            version: CURRENT_VERSION,
            height,
            prev_block: parent.hash(),
            merkle_root: [0u8; 32],
            time: parent.header.time + BLOCK_SPACING_SECS,
            nonce: tag ^ u64::from(height),
        },
        body,
    )
}

/// Chain from genesis through height `tip`, inclusive.
pub fn regtest_chain(tip: u32) -> Vec<Block> {
    let mut chain = Vec::with_capacity(tip as usize + 1);
    chain.push(genesis_block());
    for _ in 0..tip {
        if let Some(parent) = chain.last() {
            let block = next_block(parent, 0);
            chain.push(block);
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_and_counts() {
        let chain = regtest_chain(10);
        assert_eq!(chain.len(), 11);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].header.prev_block, pair[0].hash());
            assert_eq!(pair[1].height(), pair[0].height() + 1);
        }
        assert_eq!(regtest_chain(10), chain);
    }

    #[test]
    fn tags_fork_the_chain() {
        let genesis = genesis_block();
        assert_ne!(next_block(&genesis, 1).hash(), next_block(&genesis, 2).hash());
    }
}
