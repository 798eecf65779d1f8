//! Capacity sampling policy.
//!
//! The registry only ever sees a unit count; how that count is produced is
//! decided here so another policy (for example a probing one) can replace the
//! random sampler without touching rebuild or allocation.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tracing::warn;

use crate::core::error::EntropyUnavailable;
use crate::core::types::MIB;

/// Decides how many units exist at a refresh tick.
pub trait CapacitySampler: Send + Sync + fmt::Debug {
    /// Number of whole units that can be granted right now.
    fn sample(&self) -> u64;
}

/// Source of uniformly distributed integers.
pub trait EntropySource: Send + Sync + fmt::Debug {
    /// Uniform integer in `[0, bound)`. `bound` is never zero.
    fn below(&self, bound: u64) -> Result<u64, EntropyUnavailable>;
}

/// Cryptographically secure generator seeded from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn below(&self, bound: u64) -> Result<u64, EntropyUnavailable> {
        let mut rng = StdRng::try_from_os_rng().map_err(|e| EntropyUnavailable {
            reason: e.to_string(),
        })?;
        Ok(rng.random_range(0..bound))
    }
}

/// Pool capacity bounds in MiB, `[min_mib, max_mib)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityRange {
    pub min_mib: u64,
    pub max_mib: u64,
}

impl CapacityRange {
    /// 512 GiB to 1 TiB.
    pub const DEFAULT: CapacityRange = CapacityRange {
        min_mib: 512 * 1024,
        max_mib: 1024 * 1024,
    };

    pub fn span_mib(&self) -> u64 {
        self.max_mib.saturating_sub(self.min_mib)
    }

    /// Value used when no entropy is available.
    pub fn midpoint_mib(&self) -> u64 {
        self.min_mib + (self.span_mib() >> 1)
    }
}

impl Default for CapacityRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Samples a random capacity inside a [`CapacityRange`] and converts it into units.
#[derive(Debug)]
pub struct RandomCapacitySampler {
    range: CapacityRange,
    unit_size: u64,
    entropy: Box<dyn EntropySource>,
    fallbacks: AtomicU64,
}

impl RandomCapacitySampler {
    pub fn new(range: CapacityRange, unit_size: u64) -> Self {
        Self::with_entropy(range, unit_size, Box::new(OsEntropy))
    }

    pub fn with_entropy(
        range: CapacityRange,
        unit_size: u64,
        entropy: Box<dyn EntropySource>,
    ) -> Self {
        Self {
            range,
            unit_size,
            entropy,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Pool capacity in bytes. Never fails: without entropy the range midpoint is used.
    pub fn sample_bytes(&self) -> u64 {
        let span = self.range.span_mib();
        let mib = if span == 0 {
            self.range.min_mib
        } else {
            match self.entropy.below(span) {
                Ok(offset) => self.range.min_mib + offset,
                Err(e) => {
                    let total = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        error = %e,
                        fallbacks = total,
                        "falling back to capacity midpoint"
                    );
                    self.range.midpoint_mib()
                }
            }
        };
        mib.saturating_mul(MIB)
    }

    /// Whole units contained in `bytes`; any remainder is dropped.
    pub fn units_for(&self, bytes: u64) -> u64 {
        bytes.checked_div(self.unit_size).unwrap_or(0)
    }

    /// How many samples had to use the midpoint fallback.
    pub fn entropy_fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

impl CapacitySampler for RandomCapacitySampler {
    fn sample(&self) -> u64 {
        self.units_for(self.sample_bytes())
    }
}

/// Always reports the same number of units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedCapacitySampler {
    units: u64,
}

impl FixedCapacitySampler {
    pub fn new(units: u64) -> Self {
        Self { units }
    }
}

impl CapacitySampler for FixedCapacitySampler {
    fn sample(&self) -> u64 {
        self.units
    }
}
