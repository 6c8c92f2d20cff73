use rand::RngCore;

use crate::constants::selection::TIE_BREAK_SEED_OFFSET;

/// splitmix64 generator behind selection tie-breaking.
///
/// Draws depend only on the seed, so a seed recorded in a DemoSet replays the
/// same ordering on any `rand` release.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

    /// Generator seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generator used to order exact composite ties under selection seed `seed`.
    pub fn for_tie_breaks(seed: u64) -> Self {
        Self::new(seed ^ TIE_BREAK_SEED_OFFSET)
    }

    /// Current state.
    pub fn state(&self) -> u64 {
        self.state
    }

    fn advance(&mut self) -> u64 {
        self.state = self.state.wrapping_add(Self::GOLDEN_GAMMA);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        (self.advance() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.advance()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.advance().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}
