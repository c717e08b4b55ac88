//! Block header and block types.

use crate::encoding::Encoder;
use crate::hash::sha256d;
use crate::Hash256;

pub const CURRENT_VERSION: u32 = 1;

const HEADER_PREIMAGE_LEN: usize = 4 + 4 + 32 + 32 + 4 + 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub height: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn encode_for_hash(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_PREIMAGE_LEN);
        encoder.write_u32_le(self.version);
        encoder.write_u32_le(self.height);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u64_le(self.nonce);
        encoder.into_inner()
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.encode_for_hash())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    /// Builds a block whose header commits to `transactions`.
    pub fn new(mut header: BlockHeader, transactions: Vec<Vec<u8>>) -> Self {
        header.merkle_root = merkle_root(&tx_hashes(&transactions));
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(&tx_hashes(&self.transactions))
    }
}

fn tx_hashes(transactions: &[Vec<u8>]) -> Vec<Hash256> {
    transactions.iter().map(|tx| sha256d(tx)).collect()
}

/// Pairwise double-SHA256 tree; an odd layer repeats its last element.
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    let mut layer = hashes.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&pair[0]);
            buf[32..].copy_from_slice(right);
            next.push(sha256d(&buf));
        }
        layer = next;
    }
    layer[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u32) -> BlockHeader {
        BlockHeader {
            version: CURRENT_VERSION,
            height,
            prev_block: [7u8; 32],
            merkle_root: [0u8; 32],
            time: 1_600_000_000,
            nonce: 9,
        }
    }

    #[test]
    fn header_preimage_length() {
        assert_eq!(header(1).encode_for_hash().len(), HEADER_PREIMAGE_LEN);
    }

    #[test]
    fn block_hash_is_header_hash() {
        let block = Block::new(header(3), vec![b"coinbase".to_vec()]);
        assert_eq!(block.hash(), block.header.hash());
        assert_eq!(block.height(), 3);
        assert_eq!(block.compute_merkle_root(), block.header.merkle_root);
    }

    #[test]
    fn merkle_single_and_odd() {
        let a = sha256d(b"a");
        let b = sha256d(b"b");
        let c = sha256d(b"c");
        assert_eq!(merkle_root(&[]), [0u8; 32]);
        assert_eq!(merkle_root(&[a]), a);
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[a, b, c, c]));
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn tampered_body_breaks_commitment() {
        let mut block = Block::new(header(5), vec![b"x".to_vec(), b"y".to_vec()]);
        block.transactions[1] = b"z".to_vec();
        assert_ne!(block.compute_merkle_root(), block.header.merkle_root);
    }
}
