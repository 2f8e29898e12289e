//! Weighted pool selection
//!
//! Each candidate's probability of selection is proportional to its weight
//! among the current candidates. Zero-weight pools stay registered but are
//! never picked, which is how operators drain a pool without moving the
//! queues already on it.

use rand::Rng;

use crate::backend::PoolRecord;

pub(crate) fn weighted(pools: &[PoolRecord]) -> Option<&PoolRecord> {
    weighted_with(pools, &mut rand::thread_rng())
}

pub(crate) fn weighted_with<'a, R: Rng>(
    pools: &'a [PoolRecord],
    rng: &mut R,
) -> Option<&'a PoolRecord> {
    // Build the cumulative spectrum, skipping unselectable pools.
    let mut spectrum = Vec::with_capacity(pools.len());
    let mut total: u64 = 0;
    for pool in pools {
        if pool.weight == 0 {
            continue;
        }
        total += u64::from(pool.weight);
        spectrum.push((pool, total));
    }

    if spectrum.is_empty() {
        return None;
    }

    // The selector lands in exactly one [lower, upper) interval.
    let selector = rng.gen_range(0..total);
    let mut lower = 0;
    for (pool, upper) in spectrum {
        if (lower..upper).contains(&selector) {
            return Some(pool);
        }
        lower = upper;
    }
    None
}
