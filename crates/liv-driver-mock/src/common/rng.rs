//! Seeded RNG wrapper for reproducible noise and failures.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seed used when the caller does not pick one, so runs are reproducible.
pub const DEFAULT_SEED: u64 = 0x4c49_5644;

/// Thread-safe seeded random number generator
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG. `None` seeds from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// Returns true with probability `rate` (clamped to 0.0..=1.0).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Uniform value in `[-amplitude, amplitude)`. Zero amplitude yields zero.
    pub fn symmetric(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        self.inner.lock().gen_range(-amplitude..amplitude)
    }

    /// Uniform value in `[0.0, 1.0)`.
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().gen()
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(Some(DEFAULT_SEED))
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}
