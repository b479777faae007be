//! Bucket identity: the storage lookup unit for one (key, window) pair.

use sha2::{Digest, Sha256};
use std::fmt;

use super::window::Window;

/// A stable digest of a rate limit key and a window start.
///
/// Both counter stores derive bucket identities through this type, so the
/// same request sequence lands in the same buckets whichever store is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(u64);

impl BucketId {
    /// Derive the bucket identity for `key` in `window`.
    pub fn new(key: &str, window: &Window) -> Self {
        Self::from_parts(key, window.start_unix())
    }

    /// Derive the bucket identity from a key and a window start in Unix seconds.
    pub fn from_parts(key: &str, window_start_unix: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(window_start_unix.to_string().as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        BucketId(u64::from_be_bytes(prefix))
    }

    /// The raw digest value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Namespaced key for use in a shared store.
    pub fn namespaced(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_id_is_stable() {
        let a = BucketId::from_parts("10.0.0.1", 1_700_000_000);
        let b = BucketId::from_parts("10.0.0.1", 1_700_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn test_bucket_id_depends_on_key_and_window() {
        let base = BucketId::from_parts("10.0.0.1", 1_700_000_000);
        assert_ne!(base, BucketId::from_parts("10.0.0.2", 1_700_000_000));
        assert_ne!(base, BucketId::from_parts("10.0.0.1", 1_700_000_010));
    }

    #[test]
    fn test_namespaced_key() {
        let id = BucketId::from_parts("*", 0);
        assert_eq!(id.namespaced("speedbump:"), format!("speedbump:{}", id.as_u64()));
    }
}
