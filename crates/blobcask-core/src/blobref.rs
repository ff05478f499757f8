//! Blob references: BLAKE3 content addresses and their derived hashes.

use std::fmt;
use std::str::FromStr;

use snafu::Snafu;

/// Prefix of the canonical string form, e.g. `blake3-<64 hex chars>`.
const REF_PREFIX: &str = "blake3-";

/// Error parsing a blob ref from its string form.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("invalid blob ref: {input}"))]
pub struct ParseRefError {
    /// The string that failed to parse.
    pub input: String,
}

/// An immutable content address: the BLAKE3 digest of a blob's bytes.
///
/// Refs order by digest bytes, which is identical to ordering by the
/// canonical string form (lowercase hex under a fixed prefix).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobRef([u8; 32]);

impl BlobRef {
    /// Hash `data` and return its ref.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Construct from a raw digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    /// The raw digest bytes.
    pub fn digest(&self) -> &[u8; 32] {
        &self.0
    }

    /// A uniform 32-bit hash derived from the digest.
    pub fn sum32(&self) -> u32 {
        let [a, b, c, d, ..] = self.0;
        u32::from_be_bytes([a, b, c, d])
    }

    /// A uniform 64-bit hash derived from the digest.
    pub fn sum64(&self) -> u64 {
        let [a, b, c, d, e, f, g, h, ..] = self.0;
        u64::from_be_bytes([a, b, c, d, e, f, g, h])
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", REF_PREFIX, hex::encode(self.0))
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for BlobRef {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s.strip_prefix(REF_PREFIX).ok_or_else(|| ParseRefError {
            input: s.to_string(),
        })?;
        let mut digest = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut digest).map_err(|_| ParseRefError {
            input: s.to_string(),
        })?;
        Ok(Self(digest))
    }
}

/// A blob ref together with the blob's size in bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SizedRef {
    /// The blob's content address.
    pub blob_ref: BlobRef,
    /// The blob's size in bytes.
    pub size: u32,
}

impl SizedRef {
    /// Pair a ref with its size.
    pub fn new(blob_ref: BlobRef, size: u32) -> Self {
        Self { blob_ref, size }
    }
}

impl fmt::Display for SizedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.blob_ref, self.size)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn string_form_round_trips() {
        let br = BlobRef::for_bytes(b"hello world");
        let s = br.to_string();
        assert!(s.starts_with("blake3-"));
        assert_eq!(s.len(), "blake3-".len() + 64);
        assert_eq!(BlobRef::from_str(&s).unwrap(), br);
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(BlobRef::from_str("sha1-deadbeef").is_err());
        assert!(BlobRef::from_str("blake3-xyz").is_err());
        assert!(BlobRef::from_str("blake3-abcd").is_err());
        assert!(BlobRef::from_str("").is_err());
    }

    #[test]
    fn sums_are_digest_prefixes() {
        let mut digest = [0u8; 32];
        digest[..8].copy_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        let br = BlobRef::from_digest(digest);
        assert_eq!(br.sum32(), 0x0102_0304);
        assert_eq!(br.sum64(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn digest_order_matches_string_order() {
        let mut refs: Vec<BlobRef> = (0u8..20).map(|i| BlobRef::for_bytes(&[i])).collect();
        let mut by_string = refs.clone();
        refs.sort();
        by_string.sort_by_key(|r| r.to_string());
        assert_eq!(refs, by_string);
    }

    #[test]
    fn same_content_same_ref() {
        assert_eq!(BlobRef::for_bytes(b"foo"), BlobRef::for_bytes(b"foo"));
        assert_ne!(BlobRef::for_bytes(b"foo"), BlobRef::for_bytes(b"bar"));
    }
}
