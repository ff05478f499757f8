//! Size-only blob statistics receiver.
//!
//! A [`StatsReceiver`] records which refs it has seen and how large they
//! are, without keeping any blob bodies. The proxy cache uses one as its
//! warm shadow index: stat queries against it answer from memory what the
//! cache is known to contain.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::blobref::BlobRef;
use crate::blobref::SizedRef;
use crate::error::BlobStoreError;
use crate::storage::BlobRead;
use crate::storage::BlobSource;
use crate::storage::BlobStore;

/// Records blob sizes without storing bodies.
///
/// Received content is counted and discarded; `fetch` always reports
/// not-found.
#[derive(Default)]
pub struct StatsReceiver {
    blobs: Mutex<HashMap<BlobRef, u32>>,
}

impl StatsReceiver {
    /// Create an empty receiver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a ref and its size directly, without a body.
    pub fn receive_ref(&self, br: &BlobRef, size: u32) -> SizedRef {
        self.blobs.lock().unwrap().insert(*br, size);
        SizedRef::new(*br, size)
    }

    /// Number of refs recorded.
    pub fn num_blobs(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    /// All recorded sizes, ascending.
    pub fn sizes(&self) -> Vec<u32> {
        let mut sizes: Vec<u32> = self.blobs.lock().unwrap().values().copied().collect();
        sizes.sort_unstable();
        sizes
    }

    /// Sum of all recorded sizes.
    pub fn sum_blob_size(&self) -> u64 {
        self.blobs
            .lock()
            .unwrap()
            .values()
            .map(|&size| u64::from(size))
            .sum()
    }
}

#[async_trait]
impl BlobStore for StatsReceiver {
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobRead, u32), BlobStoreError> {
        // sizes only, never bodies
        Err(BlobStoreError::NotFound {
            blob_ref: br.to_string(),
        })
    }

    async fn receive_blob(
        &self,
        br: &BlobRef,
        source: BlobSource<'_>,
    ) -> Result<SizedRef, BlobStoreError> {
        let mut total: u64 = 0;
        let mut buf = [0u8; 8192];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
        }
        Ok(self.receive_ref(br, total as u32))
    }

    async fn stat_blobs(
        &self,
        dest: mpsc::Sender<SizedRef>,
        blobs: &[BlobRef],
    ) -> Result<(), BlobStoreError> {
        let hits: Vec<SizedRef> = {
            let recorded = self.blobs.lock().unwrap();
            blobs
                .iter()
                .filter_map(|br| recorded.get(br).map(|&size| SizedRef::new(*br, size)))
                .collect()
        };
        for sb in hits {
            if dest.send(sb).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn remove_blobs(&self, blobs: &[BlobRef]) -> Result<(), BlobStoreError> {
        let mut recorded = self.blobs.lock().unwrap();
        for br in blobs {
            recorded.remove(br);
        }
        Ok(())
    }

    async fn enumerate_blobs(
        &self,
        cancel: CancellationToken,
        dest: mpsc::Sender<SizedRef>,
        after: &str,
        limit: usize,
    ) -> Result<(), BlobStoreError> {
        let mut entries: Vec<SizedRef> = {
            let recorded = self.blobs.lock().unwrap();
            recorded
                .iter()
                .map(|(br, &size)| SizedRef::new(*br, size))
                .collect()
        };
        entries.sort_by(|a, b| a.blob_ref.cmp(&b.blob_ref));

        let mut sent = 0;
        for sb in entries {
            if sent == limit {
                break;
            }
            if sb.blob_ref.to_string().as_str() <= after {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BlobStoreError::Canceled),
                res = dest.send(sb) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
            sent += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::receive_bytes;

    #[tokio::test]
    async fn counts_sizes_and_sums() {
        let st = StatsReceiver::new();
        let foo = receive_bytes(&st, b"foo").await.unwrap();
        let bar = receive_bytes(&st, b"bar").await.unwrap();
        let foobar = receive_bytes(&st, b"foobar").await.unwrap();

        assert_eq!(st.num_blobs(), 3);
        assert_eq!(st.sizes(), vec![3, 3, 6]);
        assert_eq!(st.sum_blob_size(), 12);

        // stat returns each requested ref exactly once
        let (tx, mut rx) = mpsc::channel(5);
        st.stat_blobs(tx, &[foo.blob_ref, bar.blob_ref, foobar.blob_ref])
            .await
            .unwrap();
        let mut got = Vec::new();
        while let Some(sb) = rx.recv().await {
            got.push(sb);
        }
        assert_eq!(got.len(), 3);
        for want in [foo, bar, foobar] {
            assert!(got.contains(&want), "missing {want}");
        }
    }

    #[tokio::test]
    async fn bodies_are_not_kept() {
        let st = StatsReceiver::new();
        let sb = receive_bytes(&st, b"ephemeral").await.unwrap();
        assert!(st.fetch(&sb.blob_ref).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn enumerate_after_and_limit() {
        let st = StatsReceiver::new();
        let mut refs = vec![
            receive_bytes(&st, b"foo").await.unwrap(),
            receive_bytes(&st, b"bar").await.unwrap(),
            receive_bytes(&st, b"foobar").await.unwrap(),
        ];
        refs.sort_by(|a, b| a.blob_ref.cmp(&b.blob_ref));

        let (tx, mut rx) = mpsc::channel(2);
        st.enumerate_blobs(
            CancellationToken::new(),
            tx,
            &refs[1].blob_ref.to_string(),
            2,
        )
        .await
        .unwrap();
        assert_eq!(rx.recv().await, Some(refs[2]));
        // channel closes once the sender is dropped
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn remove_forgets_refs() {
        let st = StatsReceiver::new();
        let foo = receive_bytes(&st, b"foo").await.unwrap();
        let bar = receive_bytes(&st, b"bar").await.unwrap();
        st.remove_blobs(&[foo.blob_ref, bar.blob_ref]).await.unwrap();
        assert_eq!(st.num_blobs(), 0);
    }

    #[tokio::test]
    async fn receive_ref_records_without_body() {
        let st = StatsReceiver::new();
        let br = BlobRef::for_bytes(b"seen via stat only");
        let sb = st.receive_ref(&br, 18);
        assert_eq!(sb, SizedRef::new(br, 18));
        assert_eq!(st.num_blobs(), 1);
        assert_eq!(st.sum_blob_size(), 18);
    }
}
