//! Shared constants with fixed limits.

/// Maximum blob size accepted by backends (16 MiB).
///
/// Blobs are individually size-bounded by convention; in-memory staging in
/// the proxy cache relies on this bound.
pub const MAX_BLOB_SIZE: u64 = 16 * 1024 * 1024;

/// Default byte ceiling for the proxy cache (512 MiB).
pub const DEFAULT_MAX_CACHE_BYTES: i64 = 512 << 20;

// Compile-time bounds checks.
const _: () = assert!(MAX_BLOB_SIZE > 0);
const _: () = assert!(DEFAULT_MAX_CACHE_BYTES > 0);
// The default cache must be able to hold at least one maximum-size blob.
const _: () = assert!(DEFAULT_MAX_CACHE_BYTES as u64 >= MAX_BLOB_SIZE);
