use ledgerd_primitives::{merkle_root, sha256d, Block, BlockHeader, Hash256, CURRENT_VERSION};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }
}

fn random_hash(rng: &mut Lcg) -> Hash256 {
    std::array::from_fn(|_| rng.next_u64() as u8)
}

fn random_header(rng: &mut Lcg) -> BlockHeader {
    BlockHeader {
        version: CURRENT_VERSION,
        height: rng.next_u32(),
        prev_block: random_hash(rng),
        merkle_root: random_hash(rng),
        time: rng.next_u32(),
        nonce: rng.next_u64(),
    }
}

fn random_body(rng: &mut Lcg) -> Vec<Vec<u8>> {
    let count = 1 + rng.gen_range(9);
    (0..count)
        .map(|_| {
            let len = 1 + rng.gen_range(40);
            (0..len).map(|_| rng.next_u64() as u8).collect()
        })
        .collect()
}

#[test]
fn every_header_field_is_committed() {
    let mut rng = Lcg::new(0x5eed_0001);
    for _ in 0..200 {
        let header = random_header(&mut rng);
        let base = header.hash();

        let mut changed = header.clone();
        changed.height = changed.height.wrapping_add(1);
        assert_ne!(changed.hash(), base);

        let mut changed = header.clone();
        changed.prev_block[rng.gen_range(32)] ^= 0x01;
        assert_ne!(changed.hash(), base);

        let mut changed = header.clone();
        changed.merkle_root[rng.gen_range(32)] ^= 0x80;
        assert_ne!(changed.hash(), base);

        let mut changed = header.clone();
        changed.nonce ^= 1 << rng.gen_range(64);
        assert_ne!(changed.hash(), base);

        let mut changed = header;
        changed.time = changed.time.wrapping_add(1);
        assert_ne!(changed.hash(), base);
    }
}

#[test]
fn block_constructor_commits_to_body() {
    let mut rng = Lcg::new(0x5eed_0002);
    for _ in 0..100 {
        let body = random_body(&mut rng);
        let block = Block::new(random_header(&mut rng), body.clone());
        let hashes: Vec<Hash256> = body.iter().map(|tx| sha256d(tx)).collect();
        assert_eq!(block.header.merkle_root, merkle_root(&hashes));
        assert_eq!(block.compute_merkle_root(), block.header.merkle_root);
    }
}

#[test]
fn swapping_transactions_changes_root() {
    let mut rng = Lcg::new(0x5eed_0003);
    for _ in 0..100 {
        let mut body = random_body(&mut rng);
        if body.len() < 2 || body[0] == body[1] {
            continue;
        }
        let block = Block::new(random_header(&mut rng), body.clone());
        body.swap(0, 1);
        let swapped = Block {
            header: block.header.clone(),
            transactions: body,
        };
        assert_ne!(swapped.compute_merkle_root(), block.header.merkle_root);
    }
}
