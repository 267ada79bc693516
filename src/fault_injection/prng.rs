/// Seed used when a zero seed is requested. Zero is a fixed point of xorshift.
pub const FALLBACK_SEED: u32 = 0xA5A5_A5A5;

/// Deterministic 32 bit xorshift generator.
///
/// The output is a pure function of the seed and the number of draws, which is
/// what makes a fault campaign replayable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Xorshift32 {
    state: u32,
}

impl Xorshift32 {
    /// Creates a generator seeded with `seed`.
    pub fn new(seed: u32) -> Self {
        let mut rng = Self { state: FALLBACK_SEED };
        rng.seed(seed);
        rng
    }

    /// Resets the internal state. A zero seed is replaced by [`FALLBACK_SEED`].
    pub fn seed(&mut self, seed: u32) {
        self.state = if seed == 0 { FALLBACK_SEED } else { seed };
    }

    /// Advances the state and returns it.
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Current internal state (never zero).
    pub fn state(&self) -> u32 {
        self.state
    }
}

impl Default for Xorshift32 {
    fn default() -> Self {
        Self::new(FALLBACK_SEED)
    }
}
