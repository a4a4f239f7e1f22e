//! SHA-256 content hashing for duplicate suppression and shard routing.
//!
//! The standard library hasher is seeded per process, so it cannot be used
//! for routing decisions that independent workers must agree on.

use std::fmt::Write;

use sha2::{Digest, Sha256};

/// Hash raw bytes with SHA-256.
///
/// # Examples
///
/// ```
/// use stagewise_engine::hashing::digest;
///
/// assert_eq!(digest(b"row"), digest(b"row"));
/// assert_ne!(digest(b"row"), digest(b"other"));
/// ```
#[inline]
#[must_use]
pub fn digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of `data`, used as the dedup identity of a payload
/// or record.
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    digest(data)
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Map a shard key onto a replica index in `0..replicas`.
///
/// A pure function of the key bytes and the replica count. Zero replicas
/// map everything to index 0.
///
/// # Examples
///
/// ```
/// use stagewise_engine::hashing::shard_for;
///
/// let replica = shard_for(b"42", 3);
/// assert!(replica < 3);
/// assert_eq!(replica, shard_for(b"42", 3));
/// ```
#[must_use]
pub fn shard_for(key: &[u8], replicas: usize) -> usize {
    let hash = digest(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(hash.get(..8).unwrap_or(&[0u8; 8]));
    let value = u64::from_be_bytes(prefix);
    let replicas = u64::try_from(replicas).unwrap_or(u64::MAX);
    value
        .checked_rem(replicas)
        .and_then(|index| usize::try_from(index).ok())
        .unwrap_or(0)
}
