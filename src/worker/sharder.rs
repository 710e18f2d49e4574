//! Deterministic role and partition assignment, plus the probabilistic event
//! sampler each worker applies to its feed.

use anyhow::{anyhow, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::types::{Ordinal, PartitionKey, Role};

/// Role and partition a worker derives from its ordinal at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub role: Role,
    pub partition_index: usize,
    pub partition_key: PartitionKey,
}

impl Assignment {
    pub fn for_ordinal(
        ordinal: Ordinal,
        role_table: &[Role],
        partitions: &[PartitionKey],
    ) -> Result<Self> {
        if role_table.is_empty() {
            return Err(anyhow!("Role table is empty"));
        }
        if partitions.is_empty() {
            return Err(anyhow!("No partitions configured"));
        }

        let role = role_table[assign_role(ordinal, role_table.len())];
        let partition_index = assign_partition(ordinal, partitions.len());

        Ok(Self {
            role,
            partition_index,
            partition_key: partitions[partition_index].clone(),
        })
    }
}

/// Index into an ordered role table. `role_table_size` must be non-zero.
pub fn assign_role(ordinal: Ordinal, role_table_size: usize) -> usize {
    (ordinal % role_table_size as u64) as usize
}

/// Round-robin partition index. `partition_count` must be non-zero.
pub fn assign_partition(ordinal: Ordinal, partition_count: usize) -> usize {
    (ordinal % partition_count as u64) as usize
}

/// Probability that at least one of `fleet_size` independent samplers retains
/// an event broadcast to all of them.
pub fn fleet_detection_probability(probability: f64, fleet_size: usize) -> f64 {
    let p = probability.clamp(0.0, 1.0);
    1.0 - (1.0 - p).powi(fleet_size as i32)
}

pub struct SampleFilter {
    probability: f64,
    rng: StdRng,
}

impl SampleFilter {
    pub fn new(probability: f64) -> Self {
        Self::with_rng(probability, StdRng::from_os_rng())
    }

    pub fn seeded(probability: f64, seed: u64) -> Self {
        Self::with_rng(probability, StdRng::seed_from_u64(seed))
    }

    fn with_rng(probability: f64, rng: StdRng) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        Self { probability, rng }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn retain(&mut self) -> bool {
        if self.probability >= 1.0 {
            return true;
        }
        if self.probability <= 0.0 {
            return false;
        }
        self.rng.random_bool(self.probability)
    }
}
