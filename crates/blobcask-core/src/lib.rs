//! Core types for content-addressed blob storage.
//!
//! This crate defines the vocabulary the rest of blobcask is written in:
//!
//! - **Refs**: [`BlobRef`] is a BLAKE3 content address with derived 32- and
//!   64-bit uniform hashes; [`SizedRef`] pairs a ref with its byte size.
//! - **The storage trait**: [`BlobStore`] is the interface every backend
//!   implements and every wrapper exposes. Stat and enumerate results stream
//!   through `mpsc` channels; fetch hands back a boxed [`BlobRead`].
//! - **Backends**: [`MemoryStorage`] keeps whole blobs in memory;
//!   [`StatsReceiver`] records only sizes and answers stats without bodies.
//!
//! Higher layers (the byte-limit decorator, the shard router, the proxy
//! cache) compose backends through `Arc<dyn BlobStore>` and never care which
//! concrete store is underneath.

pub mod blobref;
pub mod constants;
pub mod error;
pub mod memory;
pub mod stats;
pub mod storage;

pub use blobref::BlobRef;
pub use blobref::SizedRef;
pub use error::BlobStoreError;
pub use memory::MemoryStorage;
pub use stats::StatsReceiver;
pub use storage::BlobRead;
pub use storage::BlobSource;
pub use storage::BlobStore;
pub use storage::join_all;
pub use storage::receive_bytes;
