//! Backend selection strategies.
//!
//! A selector is a pure function from blob ref to shard index. The uniform
//! selector spreads refs evenly; the size-weighted selector partitions the
//! 64-bit hash space into contiguous sub-ranges proportional to each
//! backend's byte capacity, so backends fill at the same relative rate.

use std::sync::Arc;

use blobcask_core::BlobRef;
use blobcask_core::BlobStore;
use blobcask_limit::LimitStorage;

/// Chooses which shard a blob ref belongs to.
pub trait BackendSelector: Send + Sync {
    /// The shard index for `br`. Always in `0..backend_count`.
    fn select_backend(&self, br: &BlobRef) -> u32;
}

/// Spreads refs uniformly across a fixed number of backends.
pub struct UniformSelector {
    backends: u32,
}

impl UniformSelector {
    /// Select among `backend_count` backends.
    pub fn new(backend_count: usize) -> Self {
        assert!(backend_count > 0, "need at least one backend");
        Self {
            backends: backend_count as u32,
        }
    }
}

impl BackendSelector for UniformSelector {
    fn select_backend(&self, br: &BlobRef) -> u32 {
        br.sum32() % self.backends
    }
}

/// Routes refs proportionally to each backend's byte capacity.
///
/// Backends own contiguous sub-ranges of the hash space in list order, so
/// appending a backend only reshuffles refs in the suffix of the space.
pub struct SizeWeightedSelector {
    backends: Vec<Arc<LimitStorage>>,
}

impl SizeWeightedSelector {
    /// Select among already-capped backends.
    pub fn new(backends: Vec<Arc<LimitStorage>>) -> Self {
        let selector = Self { backends };
        assert!(
            selector.total_capacity() > 0,
            "size-weighted selection needs a nonzero total capacity"
        );
        selector
    }

    /// Wrap each backend in a fresh [`LimitStorage`] of the given capacity.
    ///
    /// The pair order is captured here and used consistently for the
    /// hash-space partition.
    pub fn with_capacities(backends: Vec<(Arc<dyn BlobStore>, u64)>) -> Self {
        Self::new(
            backends
                .into_iter()
                .map(|(sto, capacity)| Arc::new(LimitStorage::new(capacity, sto)))
                .collect(),
        )
    }

    /// Sum of all backend capacities.
    pub fn total_capacity(&self) -> u64 {
        self.backends.iter().map(|b| b.capacity()).sum()
    }
}

impl BackendSelector for SizeWeightedSelector {
    fn select_backend(&self, br: &BlobRef) -> u32 {
        let total = self.total_capacity() as f64;
        let sum_pct = br.sum64() as f64 / u64::MAX as f64;

        let mut end: u64 = 0;
        for (i, backend) in self.backends.iter().enumerate() {
            // cumulative capacity through this backend, as a fraction of
            // the total
            end += backend.capacity();
            let cap_pct = end as f64 / total;

            if sum_pct <= cap_pct {
                return i as u32;
            }
        }

        // the cumulative fraction reaches 1.0 at the last backend, so the
        // sweep cannot fall through unless the capacity state is corrupt
        panic!("size-weighted selector: no shard selected for {br}");
    }
}

#[cfg(test)]
mod tests {
    use blobcask_core::MemoryStorage;

    use super::*;

    fn weighted(capacities: &[u64]) -> SizeWeightedSelector {
        SizeWeightedSelector::with_capacities(
            capacities
                .iter()
                .map(|&c| (Arc::new(MemoryStorage::new()) as Arc<dyn BlobStore>, c))
                .collect(),
        )
    }

    /// The cumulative-capacity rule, restated independently of the sweep.
    fn expected_shard(br: &BlobRef, capacities: &[u64]) -> u32 {
        let total: u64 = capacities.iter().sum();
        let sum_pct = br.sum64() as f64 / u64::MAX as f64;
        let mut end = 0u64;
        for (i, &c) in capacities.iter().enumerate() {
            end += c;
            if sum_pct <= end as f64 / total as f64 {
                return i as u32;
            }
        }
        unreachable!()
    }

    #[test]
    fn uniform_is_sum32_mod_n() {
        let sel = UniformSelector::new(3);
        for i in 0u8..32 {
            let br = BlobRef::for_bytes(&[i]);
            assert_eq!(sel.select_backend(&br), br.sum32() % 3);
        }
    }

    #[test]
    fn weighted_follows_cumulative_partition() {
        let capacities = [1u64 << 16, 1 << 15];
        let sel = weighted(&capacities);
        for blob in [&b"something"[..], b"something else", b"again something else."] {
            let br = BlobRef::for_bytes(blob);
            assert_eq!(sel.select_backend(&br), expected_shard(&br, &capacities));
        }
    }

    #[test]
    fn weighted_is_deterministic() {
        let sel = weighted(&[1 << 16, 1 << 15, 1 << 14]);
        let br = BlobRef::for_bytes(b"stable");
        let first = sel.select_backend(&br);
        for _ in 0..100 {
            assert_eq!(sel.select_backend(&br), first);
        }
    }

    #[test]
    fn hash_space_extremes_are_covered() {
        let sel = weighted(&[1 << 16, 1 << 15]);
        let low = BlobRef::from_digest([0u8; 32]);
        let high = BlobRef::from_digest([0xff; 32]);
        assert_eq!(sel.select_backend(&low), 0);
        assert_eq!(sel.select_backend(&high), 1);
    }

    #[test]
    fn weighted_distribution_tracks_capacity() {
        use rand::RngCore;

        let sel = weighted(&[2 << 20, 1 << 20]);
        let mut rng = rand::thread_rng();
        let mut counts = [0u32; 2];
        for _ in 0..3000 {
            let mut digest = [0u8; 32];
            rng.fill_bytes(&mut digest);
            counts[sel.select_backend(&BlobRef::from_digest(digest)) as usize] += 1;
        }
        // expectation is 2000 / 1000; leave a wide margin
        assert!(counts[0] > counts[1], "counts: {counts:?}");
        assert!(counts[1] > 500, "counts: {counts:?}");
    }

    #[test]
    fn equal_capacities_match_uniform_spread() {
        use rand::RngCore;

        let sel = weighted(&[1 << 20, 1 << 20]);
        let mut rng = rand::thread_rng();
        let mut counts = [0u32; 2];
        for _ in 0..2000 {
            let mut digest = [0u8; 32];
            rng.fill_bytes(&mut digest);
            counts[sel.select_backend(&BlobRef::from_digest(digest)) as usize] += 1;
        }
        // both halves of the hash space should see roughly half the refs
        assert!(counts[0] > 700, "counts: {counts:?}");
        assert!(counts[1] > 700, "counts: {counts:?}");
    }
}
