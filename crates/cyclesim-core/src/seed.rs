//! Per-iteration seeding of the shared random source.
//!
//! Iteration `n` of a run with base seed `b` always draws from a generator
//! seeded with `b + n` (wrapping). The controller reseeds twice per
//! iteration: once before the iteration-start listeners and once right
//! before the mobsim, so the mobsim sees the same stream regardless of how
//! much randomness re-planning consumed.
//!
//! After every reseed the first draw is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use cyclesim_types::IterationIndex;

/// Seed used for `iteration` given the run's base seed.
pub fn seed_for(base_seed: u64, iteration: IterationIndex) -> u64 {
    base_seed.wrapping_add(u64::from(iteration))
}

/// The random source shared by the controller, phases, and listeners.
///
/// Cloning is cheap and every clone draws from the same generator, so a
/// reseed by the controller is observed by all holders.
#[derive(Debug, Clone)]
pub struct SimRandom {
    inner: Arc<Mutex<StdRng>>,
}

impl SimRandom {
    /// Create a source seeded with `seed` (no draw is discarded).
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Re-initialize the generator with `seed` and discard its first draw.
    pub fn reseed(&self, seed: u64) {
        let mut rng = self.lock();
        *rng = StdRng::seed_from_u64(seed);
        let _discarded: f64 = rng.random();
    }

    /// Draw a uniform `f64` in `[0, 1)`.
    pub fn next_f64(&self) -> f64 {
        self.lock().random()
    }

    /// Draw a uniform index in `0..upper`. Returns 0 when `upper` is 0.
    pub fn next_index(&self, upper: usize) -> usize {
        if upper == 0 {
            return 0;
        }
        self.lock().random_range(0..upper)
    }

    /// Run `f` with exclusive access to the generator.
    ///
    /// Use this for bulk draws so the lock is taken once.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, StdRng> {
        // A panicking holder cannot leave the generator in an invalid state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Applies the per-iteration seeding rule to a [`SimRandom`].
#[derive(Debug, Clone)]
pub struct RandomSeedManager {
    base_seed: u64,
    random: SimRandom,
    last_seed: Option<u64>,
}

impl RandomSeedManager {
    /// Create a manager for `base_seed`. The source starts seeded with the
    /// base seed itself until the first reseed.
    pub fn new(base_seed: u64) -> Self {
        Self {
            base_seed,
            random: SimRandom::new(base_seed),
            last_seed: None,
        }
    }

    /// The configured base seed.
    pub const fn base_seed(&self) -> u64 {
        self.base_seed
    }

    /// The seed applied by the most recent [`reseed`](Self::reseed).
    pub const fn last_seed(&self) -> Option<u64> {
        self.last_seed
    }

    /// A handle to the shared random source.
    pub fn random(&self) -> SimRandom {
        self.random.clone()
    }

    /// Reseed the shared source for `iteration`. Returns the applied seed.
    pub fn reseed(&mut self, iteration: IterationIndex) -> u64 {
        let seed = seed_for(self.base_seed, iteration);
        self.random.reseed(seed);
        self.last_seed = Some(seed);
        trace!(iteration, seed, "random source reseeded");
        seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_base_plus_iteration() {
        assert_eq!(seed_for(100, 3), 103);
        assert_eq!(seed_for(0, 0), 0);
        assert_eq!(seed_for(u64::MAX, 1), 0);
    }

    #[test]
    fn reseed_reproduces_stream() {
        let mut manager = RandomSeedManager::new(100);
        let random = manager.random();

        assert_eq!(manager.reseed(3), 103);
        let first: Vec<f64> = (0..4).map(|_| random.next_f64()).collect();

        random.next_f64();
        assert_eq!(manager.reseed(3), 103);
        let second: Vec<f64> = (0..4).map(|_| random.next_f64()).collect();

        assert_eq!(first, second);
        assert_eq!(manager.last_seed(), Some(103));
    }

    #[test]
    fn first_draw_after_reseed_is_discarded() {
        let random = SimRandom::new(1);
        random.reseed(103);
        let after_reseed = random.next_f64();

        let mut reference = StdRng::seed_from_u64(103);
        let discarded: f64 = reference.random();
        let kept: f64 = reference.random();

        assert_eq!(after_reseed.to_bits(), kept.to_bits());
        assert_ne!(after_reseed.to_bits(), discarded.to_bits());
    }

    #[test]
    fn different_iterations_differ() {
        let mut manager = RandomSeedManager::new(42);
        let random = manager.random();
        manager.reseed(0);
        let a = random.next_f64();
        manager.reseed(1);
        let b = random.next_f64();
        assert_ne!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn clones_share_the_generator() {
        let manager_random = SimRandom::new(9);
        let other = manager_random.clone();
        manager_random.reseed(5);
        let from_other = other.next_f64();

        let fresh = SimRandom::new(0);
        fresh.reseed(5);
        assert_eq!(from_other.to_bits(), fresh.next_f64().to_bits());
    }

    #[test]
    fn next_index_handles_empty_range() {
        let random = SimRandom::new(3);
        assert_eq!(random.next_index(0), 0);
        for _ in 0..50 {
            assert!(random.next_index(4) < 4);
        }
    }
}
