//! Deterministic random number generation for synthetic datasets.
//!
//! RULE: The demo seeder never calls a platform RNG.
//! All randomness flows through DemoRng streams derived from one
//! master seed, so the same seed always produces the same database.
//!
//! Each stream is seeded from (master_seed XOR stream_index), so adding
//! a stream never shifts the values an existing stream produces.

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG stream.
pub struct DemoRng {
    pub name: &'static str,
    inner:    Pcg64Mcg,
}

impl DemoRng {
    pub fn new(master_seed: u64, stream_index: u64) -> Self {
        let derived_seed = master_seed ^ stream_index.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self { name: "unnamed", inner: Pcg64Mcg::seed_from_u64(derived_seed) }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Uniform in `[lo, hi)`. Returns `lo` for an empty range.
    pub fn between(&mut self, lo: i64, hi: i64) -> i64 {
        if hi <= lo {
            return lo;
        }
        self.inner.gen_range(lo..hi)
    }

    /// Bernoulli trial: true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.inner.gen_bool(p.clamp(0.0, 1.0))
    }

    /// Multiplier in `[1 - spread, 1]`, for amounts billed at or under tariff.
    pub fn discount(&mut self, spread: f64) -> f64 {
        1.0 - self.inner.gen::<f64>() * spread.clamp(0.0, 1.0)
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut self.inner)
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.inner);
    }
}

/// All streams for one seed, indexed by stable slot.
pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn stream(&self, slot: StreamSlot) -> DemoRng {
        DemoRng::new(self.master_seed, slot as u64).with_name(slot.name())
    }
}

/// Stable stream assignments.
/// NEVER reorder or remove entries, only append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum StreamSlot {
    Reference = 0,
    Claims    = 1,
    Planted   = 2,
}

impl StreamSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Claims    => "claims",
            Self::Planted   => "planted",
        }
    }
}
