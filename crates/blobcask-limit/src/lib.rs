//! Byte-limited blob storage decorator.
//!
//! [`LimitStorage`] wraps an inner [`BlobStore`] with a fixed byte
//! capacity. Receives are admitted only if the blob's full byte count fits
//! in the remaining space; everything else delegates to the inner store.
//!
//! Admission feeds the inner store a reader truncated to the available
//! space. A truncated reader cannot report overflow itself, so when the
//! inner store consumed exactly the truncation limit (or nothing at all)
//! the original source is probed for one more byte; any byte or non-EOF
//! error means the blob did not fit and the receive fails with
//! [`BlobStoreError::TooBig`].

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use blobcask_core::BlobRead;
use blobcask_core::BlobRef;
use blobcask_core::BlobSource;
use blobcask_core::BlobStore;
use blobcask_core::BlobStoreError;
use blobcask_core::SizedRef;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// A blob store with a byte capacity.
pub struct LimitStorage {
    capacity: u64,
    consumed: AtomicU64,
    inner: Arc<dyn BlobStore>,
}

impl LimitStorage {
    /// Cap `inner` at `capacity` bytes.
    pub fn new(capacity: u64, inner: Arc<dyn BlobStore>) -> Self {
        Self {
            capacity,
            consumed: AtomicU64::new(0),
            inner,
        }
    }

    /// The configured byte ceiling.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently stored.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.consumed())
    }
}

#[async_trait]
impl BlobStore for LimitStorage {
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobRead, u32), BlobStoreError> {
        self.inner.fetch(br).await
    }

    /// Admit the blob iff it fits in the space available at call time.
    ///
    /// Admission is check-then-write: concurrent receives may race past the
    /// same `available` reading. Serialize receives externally if the
    /// capacity must hold exactly.
    async fn receive_blob(
        &self,
        br: &BlobRef,
        source: BlobSource<'_>,
    ) -> Result<SizedRef, BlobStoreError> {
        let limit = self.available();

        // only let the inner store read up to the limit
        let res = {
            let mut limited = (&mut *source).take(limit);
            self.inner.receive_blob(br, &mut limited).await
        };

        // if the inner store consumed nothing or exactly the limit, probe
        // the original source for one more byte to tell "fit exactly" from
        // "was truncated"
        let n = match &res {
            Ok(sb) => u64::from(sb.size),
            Err(_) => 0,
        };
        if n == limit || n == 0 {
            let mut probe = [0u8; 1];
            match source.read(&mut probe).await {
                Ok(0) => {}
                Ok(_) | Err(_) => {
                    debug!(blob_ref = %br, limit, "blob rejected: exceeds available space");
                    return Err(BlobStoreError::TooBig);
                }
            }
        }

        let sb = res?;
        self.consumed.fetch_add(u64::from(sb.size), Ordering::AcqRel);
        Ok(sb)
    }

    async fn stat_blobs(
        &self,
        dest: mpsc::Sender<SizedRef>,
        blobs: &[BlobRef],
    ) -> Result<(), BlobStoreError> {
        self.inner.stat_blobs(dest, blobs).await
    }

    async fn remove_blobs(&self, blobs: &[BlobRef]) -> Result<(), BlobStoreError> {
        // stat first so the consumed counter can be credited for whatever
        // the inner store actually holds
        let mut freed: u64 = 0;
        let (tx, mut rx) = mpsc::channel(blobs.len().max(1));
        match self.inner.stat_blobs(tx, blobs).await {
            Ok(()) => {
                while let Some(sb) = rx.recv().await {
                    freed += u64::from(sb.size);
                }
            }
            Err(error) => {
                warn!(%error, "stat before remove failed; consumed counter not adjusted");
            }
        }

        self.inner.remove_blobs(blobs).await?;

        if freed > 0 {
            // never dip below zero, even if a stat raced a concurrent receive
            let _ = self
                .consumed
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                    Some(c.saturating_sub(freed))
                });
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
        self.inner.enumerate_blobs(cancel, dest, after, limit).await
    }
}
