//! Sharded blob storage.
//!
//! [`ShardedStorage`] distributes blobs across a fixed list of sub-stores.
//! A [`BackendSelector`] maps each ref to its shard; single-blob operations
//! route to that shard alone, while stat and remove partition their ref
//! lists and fan out per shard. Enumeration merges every shard's ascending
//! stream into one bounded, ordered result.
//!
//! ```text
//! ShardedStorage
//!     |
//!     +-- BackendSelector (ref -> shard index)
//!     |
//!     +-- shards[0] -> BlobStore
//!     +-- shards[1] -> BlobStore
//!     +-- ...
//! ```

pub mod selectors;

use std::sync::Arc;

use async_trait::async_trait;
use blobcask_core::BlobRead;
use blobcask_core::BlobRef;
use blobcask_core::BlobSource;
use blobcask_core::BlobStore;
use blobcask_core::BlobStoreError;
use blobcask_core::SizedRef;
use blobcask_core::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use crate::selectors::BackendSelector;
pub use crate::selectors::SizeWeightedSelector;
pub use crate::selectors::UniformSelector;

/// A blob store that routes each ref to one of several sub-stores.
pub struct ShardedStorage {
    shards: Vec<Arc<dyn BlobStore>>,
    selector: Arc<dyn BackendSelector>,
}

impl ShardedStorage {
    /// Shard across `shards` using `selector`.
    pub fn new(shards: Vec<Arc<dyn BlobStore>>, selector: Arc<dyn BackendSelector>) -> Self {
        assert!(!shards.is_empty(), "need at least one shard");
        Self { shards, selector }
    }

    /// Shard uniformly by ref hash.
    pub fn uniform(shards: Vec<Arc<dyn BlobStore>>) -> Self {
        let selector = Arc::new(UniformSelector::new(shards.len()));
        Self::new(shards, selector)
    }

    /// Shard proportionally to the given byte capacities.
    pub fn size_weighted(backends: Vec<(Arc<dyn BlobStore>, u64)>) -> Self {
        let shards = backends.iter().map(|(sto, _)| Arc::clone(sto)).collect();
        let selector = Arc::new(SizeWeightedSelector::with_capacities(backends));
        Self::new(shards, selector)
    }

    /// The selector in use.
    pub fn selector(&self) -> &dyn BackendSelector {
        self.selector.as_ref()
    }

    fn shard_for(&self, br: &BlobRef) -> &Arc<dyn BlobStore> {
        &self.shards[self.selector.select_backend(br) as usize]
    }

    /// Split `blobs` into per-shard ref lists.
    fn partition(&self, blobs: &[BlobRef]) -> Vec<Vec<BlobRef>> {
        let mut parts = vec![Vec::new(); self.shards.len()];
        for br in blobs {
            parts[self.selector.select_backend(br) as usize].push(*br);
        }
        parts
    }
}

#[async_trait]
impl BlobStore for ShardedStorage {
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobRead, u32), BlobStoreError> {
        self.shard_for(br).fetch(br).await
    }

    async fn receive_blob(
        &self,
        br: &BlobRef,
        source: BlobSource<'_>,
    ) -> Result<SizedRef, BlobStoreError> {
        self.shard_for(br).receive_blob(br, source).await
    }

    async fn stat_blobs(
        &self,
        dest: mpsc::Sender<SizedRef>,
        blobs: &[BlobRef],
    ) -> Result<(), BlobStoreError> {
        let mut tasks = JoinSet::new();
        for (shard, part) in self.shards.iter().zip(self.partition(blobs)) {
            if part.is_empty() {
                continue;
            }
            let shard = Arc::clone(shard);
            let dest = dest.clone();
            tasks.spawn(async move { shard.stat_blobs(dest, &part).await });
        }
        drop(dest);
        join_all(tasks).await
    }

    async fn remove_blobs(&self, blobs: &[BlobRef]) -> Result<(), BlobStoreError> {
        let mut tasks = JoinSet::new();
        for (shard, part) in self.shards.iter().zip(self.partition(blobs)) {
            if part.is_empty() {
                continue;
            }
            let shard = Arc::clone(shard);
            tasks.spawn(async move { shard.remove_blobs(&part).await });
        }
        join_all(tasks).await
    }

    async fn enumerate_blobs(
        &self,
        cancel: CancellationToken,
        dest: mpsc::Sender<SizedRef>,
        after: &str,
        limit: usize,
    ) -> Result<(), BlobStoreError> {
        // every shard contributes at most `limit` refs past `after`, so the
        // merged candidate set is bounded by shards * limit
        let (tx, mut rx) = mpsc::channel(64);
        let mut tasks = JoinSet::new();
        for shard in &self.shards {
            let shard = Arc::clone(shard);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let after = after.to_string();
            tasks.spawn(async move { shard.enumerate_blobs(cancel, tx, &after, limit).await });
        }
        drop(tx);

        let mut merged = Vec::new();
        while let Some(sb) = rx.recv().await {
            merged.push(sb);
        }
        join_all(tasks).await?;

        merged.sort_by(|a, b| a.blob_ref.cmp(&b.blob_ref));
        merged.truncate(limit);

        for sb in merged {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BlobStoreError::Canceled),
                res = dest.send(sb) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use blobcask_core::MemoryStorage;
    use blobcask_core::receive_bytes;

    use super::*;

    struct Harness {
        sto: ShardedStorage,
        shards: Vec<MemoryStorage>,
    }

    fn uniform_harness(n: usize) -> Harness {
        let shards: Vec<MemoryStorage> = (0..n).map(|_| MemoryStorage::new()).collect();
        let sto = ShardedStorage::uniform(
            shards
                .iter()
                .map(|s| Arc::new(s.clone()) as Arc<dyn BlobStore>)
                .collect(),
        );
        Harness { sto, shards }
    }

    fn weighted_harness(capacities: &[u64]) -> Harness {
        let shards: Vec<MemoryStorage> =
            capacities.iter().map(|_| MemoryStorage::new()).collect();
        let sto = ShardedStorage::size_weighted(
            shards
                .iter()
                .zip(capacities)
                .map(|(s, &c)| (Arc::new(s.clone()) as Arc<dyn BlobStore>, c))
                .collect(),
        );
        Harness { sto, shards }
    }

    impl Harness {
        /// The blob must live on exactly the shard the selector names.
        async fn check_shard(&self, sb: &SizedRef) {
            let expect = self.sto.selector().select_backend(&sb.blob_ref) as usize;
            for (i, shard) in self.shards.iter().enumerate() {
                let found = shard.fetch(&sb.blob_ref).await.is_ok();
                assert_eq!(
                    found,
                    i == expect,
                    "blob {} on shard {i}, expected only on {expect}",
                    sb.blob_ref
                );
            }
        }
    }

    #[tokio::test]
    async fn uniform_routing_places_blobs_by_selector() {
        let h = uniform_harness(2);
        let a = receive_bytes(&h.sto, b"something").await.unwrap();
        let b = receive_bytes(&h.sto, b"something else").await.unwrap();
        h.check_shard(&a).await;
        h.check_shard(&b).await;

        // reads route back through the same selector
        let (_, size) = h.sto.fetch(&a.blob_ref).await.unwrap();
        assert_eq!(size, a.size);
    }

    #[tokio::test]
    async fn weighted_routing_places_blobs_by_selector() {
        let h = weighted_harness(&[1 << 16, 1 << 15]);
        for body in [&b"something"[..], b"something else", b"again something else."] {
            let sb = receive_bytes(&h.sto, body).await.unwrap();
            h.check_shard(&sb).await;
        }
    }

    #[tokio::test]
    async fn stat_fans_out_across_shards() {
        let h = uniform_harness(3);
        let mut want = Vec::new();
        for i in 0u8..6 {
            want.push(receive_bytes(&h.sto, &[i; 4]).await.unwrap());
        }

        let refs: Vec<BlobRef> = want.iter().map(|sb| sb.blob_ref).collect();
        let (tx, mut rx) = mpsc::channel(8);
        h.sto.stat_blobs(tx, &refs).await.unwrap();

        let mut got = Vec::new();
        while let Some(sb) = rx.recv().await {
            got.push(sb);
        }
        assert_eq!(got.len(), want.len());
        for sb in want {
            assert!(got.contains(&sb), "missing {sb}");
        }
    }

    #[tokio::test]
    async fn remove_fans_out_across_shards() {
        let h = uniform_harness(2);
        let a = receive_bytes(&h.sto, b"first").await.unwrap();
        let b = receive_bytes(&h.sto, b"second").await.unwrap();

        h.sto.remove_blobs(&[a.blob_ref, b.blob_ref]).await.unwrap();
        assert!(h.sto.fetch(&a.blob_ref).await.err().unwrap().is_not_found());
        assert!(h.sto.fetch(&b.blob_ref).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn enumerate_merges_shards_in_ref_order() {
        let h = uniform_harness(3);
        let mut refs = Vec::new();
        for i in 0u8..9 {
            refs.push(receive_bytes(&h.sto, &[i; 5]).await.unwrap().blob_ref);
        }
        refs.sort();

        let (tx, mut rx) = mpsc::channel(16);
        h.sto
            .enumerate_blobs(CancellationToken::new(), tx, "", 100)
            .await
            .unwrap();
        let mut got = Vec::new();
        while let Some(sb) = rx.recv().await {
            got.push(sb.blob_ref);
        }
        assert_eq!(got, refs);

        // after + limit apply to the merged stream
        let (tx, mut rx) = mpsc::channel(16);
        h.sto
            .enumerate_blobs(CancellationToken::new(), tx, &refs[0].to_string(), 3)
            .await
            .unwrap();
        let mut got = Vec::new();
        while let Some(sb) = rx.recv().await {
            got.push(sb.blob_ref);
        }
        assert_eq!(got, refs[1..4].to_vec());
    }
}
