//! The `BlobStore` trait: the interface every backend implements.

use std::fmt;
use std::io::Cursor;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::blobref::BlobRef;
use crate::blobref::SizedRef;
use crate::error::BlobStoreError;

/// Boxed reader over a blob's contents.
pub type BlobRead = Box<dyn AsyncRead + Send + Unpin>;

/// Source reader handed to [`BlobStore::receive_blob`].
pub type BlobSource<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

/// Content-addressed blob storage.
///
/// Backends are shared as `Arc<dyn BlobStore>` and are expected to be
/// internally thread-safe. Wrappers (byte limiting, sharding, proxy
/// caching) expose the same interface they consume.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob's contents and size.
    ///
    /// A missing blob is reported as [`BlobStoreError::NotFound`],
    /// distinguishable from I/O failures.
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobRead, u32), BlobStoreError>;

    /// Store the bytes read from `source` under `br`.
    async fn receive_blob(
        &self,
        br: &BlobRef,
        source: BlobSource<'_>,
    ) -> Result<SizedRef, BlobStoreError>;

    /// Send a sized ref to `dest` for each requested blob that exists.
    ///
    /// A dropped `dest` means the caller stopped listening; it is not an
    /// error.
    async fn stat_blobs(
        &self,
        dest: mpsc::Sender<SizedRef>,
        blobs: &[BlobRef],
    ) -> Result<(), BlobStoreError>;

    /// Remove the given blobs. Refs that do not exist are ignored.
    async fn remove_blobs(&self, blobs: &[BlobRef]) -> Result<(), BlobStoreError>;

    /// Send up to `limit` sized refs whose string form is strictly greater
    /// than `after`, in ascending ref order. The channel closes when the
    /// sender is dropped.
    async fn enumerate_blobs(
        &self,
        cancel: CancellationToken,
        dest: mpsc::Sender<SizedRef>,
        after: &str,
        limit: usize,
    ) -> Result<(), BlobStoreError>;
}

/// Hash `data`, store it, and return the sized ref.
pub async fn receive_bytes(
    store: &dyn BlobStore,
    data: &[u8],
) -> Result<SizedRef, BlobStoreError> {
    let br = BlobRef::for_bytes(data);
    let mut source = Cursor::new(data.to_vec());
    store.receive_blob(&br, &mut source).await
}

impl fmt::Debug for dyn BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn BlobStore")
    }
}

/// Join every spawned storage task, returning the first error seen.
pub async fn join_all(
    mut tasks: JoinSet<Result<(), BlobStoreError>>,
) -> Result<(), BlobStoreError> {
    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(join_error) => Err(BlobStoreError::Storage {
                message: join_error.to_string(),
            }),
        };
        if let Err(error) = result {
            if first_err.is_none() {
                first_err = Some(error);
            }
        }
    }
    match first_err {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
