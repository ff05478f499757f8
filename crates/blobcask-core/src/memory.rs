//! In-memory blob storage.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blobref::BlobRef;
use crate::blobref::SizedRef;
use crate::constants::MAX_BLOB_SIZE;
use crate::error::BlobStoreError;
use crate::storage::BlobRead;
use crate::storage::BlobSource;
use crate::storage::BlobStore;

/// Thread-safe in-memory blob store.
///
/// Verifies on receive that the content hashes to the ref it is stored
/// under. Clones share the same underlying storage.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    blobs: Arc<RwLock<HashMap<BlobRef, Bytes>>>,
}

impl MemoryStorage {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored.
    pub fn blob_count(&self) -> usize {
        self.blobs.read().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryStorage {
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobRead, u32), BlobStoreError> {
        let blobs = self.blobs.read().unwrap();
        match blobs.get(br) {
            Some(body) => {
                let size = body.len() as u32;
                Ok((Box::new(Cursor::new(body.clone())) as BlobRead, size))
            }
            None => Err(BlobStoreError::NotFound {
                blob_ref: br.to_string(),
            }),
        }
    }

    async fn receive_blob(
        &self,
        br: &BlobRef,
        source: BlobSource<'_>,
    ) -> Result<SizedRef, BlobStoreError> {
        let mut data = Vec::new();
        (&mut *source)
            .take(MAX_BLOB_SIZE + 1)
            .read_to_end(&mut data)
            .await?;
        if data.len() as u64 > MAX_BLOB_SIZE {
            return Err(BlobStoreError::TooBig);
        }
        if BlobRef::for_bytes(&data) != *br {
            return Err(BlobStoreError::Storage {
                message: format!("content does not match ref {br}"),
            });
        }
        let size = data.len() as u32;
        self.blobs.write().unwrap().insert(*br, Bytes::from(data));
        debug!(blob_ref = %br, size, "blob stored");
        Ok(SizedRef::new(*br, size))
    }

    async fn stat_blobs(
        &self,
        dest: mpsc::Sender<SizedRef>,
        blobs: &[BlobRef],
    ) -> Result<(), BlobStoreError> {
        let hits: Vec<SizedRef> = {
            let stored = self.blobs.read().unwrap();
            blobs
                .iter()
                .filter_map(|br| stored.get(br).map(|body| SizedRef::new(*br, body.len() as u32)))
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
        let mut stored = self.blobs.write().unwrap();
        for br in blobs {
            stored.remove(br);
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
            let stored = self.blobs.read().unwrap();
            stored
                .iter()
                .map(|(br, body)| SizedRef::new(*br, body.len() as u32))
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
