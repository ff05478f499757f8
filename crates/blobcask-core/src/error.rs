//! Error types for blob store operations.

use snafu::Snafu;

/// Errors from blob store operations.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum BlobStoreError {
    /// Blob not found. Callers rely on distinguishing this from I/O
    /// failures, e.g. to trigger origin fallback.
    #[snafu(display("blob not found: {blob_ref}"))]
    NotFound {
        /// The ref of the blob that was not found.
        blob_ref: String,
    },

    /// Blob exceeds the store's byte limit. Durable rejection: retrying
    /// without freeing space will fail again.
    #[snafu(display("blob exceeds storage byte limit"))]
    TooBig,

    /// Underlying storage failure.
    #[snafu(display("storage error: {message}"))]
    Storage {
        /// Human-readable description of the failure.
        message: String,
    },

    /// A stat fan-out drained every source without finding all requested
    /// refs.
    #[snafu(display("unexpected end of blob stats: couldn't find all the stats"))]
    StatIncomplete,

    /// The operation was canceled by its caller.
    #[snafu(display("operation canceled"))]
    Canceled,
}

impl BlobStoreError {
    /// Whether this is the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobStoreError::NotFound { .. })
    }
}

impl From<std::io::Error> for BlobStoreError {
    fn from(e: std::io::Error) -> Self {
        BlobStoreError::Storage { message: e.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguishable() {
        let err = BlobStoreError::NotFound {
            blob_ref: "blake3-00".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!BlobStoreError::TooBig.is_not_found());
        assert!(
            !BlobStoreError::Storage {
                message: "disk on fire".to_string()
            }
            .is_not_found()
        );
    }

    #[test]
    fn stat_incomplete_display() {
        let err = BlobStoreError::StatIncomplete;
        assert!(err.to_string().contains("couldn't find all the stats"));
    }

    #[test]
    fn io_errors_become_storage_errors() {
        let io = std::io::Error::other("boom");
        let err = BlobStoreError::from(io);
        assert_eq!(
            err,
            BlobStoreError::Storage {
                message: "boom".to_string()
            }
        );
    }
}
