use crate::secret::blake2b256;

/// Deterministic nonce sequence derived from a 32-byte seed.
///
/// Each nonce is 4 seed bytes at the cursor followed by a big-endian
/// 64-bit counter. When the cursor exhausts the seed, the seed is replaced
/// by its own blake2b-256 hash and the cursor resets; the counter is never
/// reset, so nonces stay unique across reseeds. Both sides of a record
/// stream run an identical generator from the same seed.
#[derive(Debug)]
pub(crate) struct Noncer {
    seed: [u8; 32],
    p: usize,
    counter: u64,
}

impl Noncer {
    pub(crate) fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            p: 0,
            counter: 0,
        }
    }

    pub(crate) fn next(&mut self) -> [u8; 12] {
        if self.p == self.seed.len() {
            self.seed = blake2b256(&self.seed);
            self.p = 0;
        }
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.seed[self.p..self.p + 4]);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.p += 4;
        self.counter += 1;
        nonce
    }
}
