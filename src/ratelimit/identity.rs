//! Bucket key derivation from client identities.

use sha2::{Digest, Sha256};

/// Namespace used when a policy does not name its own.
pub const DEFAULT_NAMESPACE: &str = "rate-limit";

/// A key that uniquely identifies one client's counter within a namespace.
///
/// Formatted as `namespace:digest`, where the digest is the hex-encoded
/// SHA-256 of the (optionally salted) raw identity. The raw identity never
/// appears in the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One-way hasher for client identities.
#[derive(Clone, Default)]
pub struct IdentityHasher {
    salt: Option<String>,
}

impl std::fmt::Debug for IdentityHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityHasher")
            .field("salted", &self.salt.is_some())
            .finish()
    }
}

impl IdentityHasher {
    /// Create a hasher producing the plain SHA-256 of each identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hasher that prefixes every identity with `salt`.
    pub fn with_salt(salt: impl Into<String>) -> Self {
        Self {
            salt: Some(salt.into()),
        }
    }

    /// Hash a raw identity into a 64-character lowercase hex digest.
    pub fn hash(&self, identity: &str) -> String {
        let mut hasher = Sha256::new();
        if let Some(salt) = &self.salt {
            hasher.update(salt.as_bytes());
        }
        hasher.update(identity.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Build the bucket key for `identity` within `namespace`.
    pub fn bucket_key(&self, namespace: &str, identity: &str) -> BucketKey {
        BucketKey(format!("{}:{}", namespace, self.hash(identity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_sha256_hex() {
        let hasher = IdentityHasher::new();
        assert_eq!(
            hasher.hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = IdentityHasher::new();
        let digest = hasher.hash("1.2.3.4");

        assert_eq!(digest, hasher.hash("1.2.3.4"));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_different_identities_get_different_buckets() {
        let hasher = IdentityHasher::new();

        let a = hasher.bucket_key(DEFAULT_NAMESPACE, "10.0.0.1");
        let b = hasher.bucket_key(DEFAULT_NAMESPACE, "10.0.0.2");
        assert_ne!(a, b);
        assert_eq!(a, hasher.bucket_key(DEFAULT_NAMESPACE, "10.0.0.1"));
    }

    #[test]
    fn test_bucket_key_format_hides_identity() {
        let hasher = IdentityHasher::new();
        let key = hasher.bucket_key("rate-limit", "192.168.1.1");

        assert!(key.as_str().starts_with("rate-limit:"));
        assert!(!key.as_str().contains("192.168.1.1"));
        assert_eq!(key.as_str().len(), "rate-limit:".len() + 64);
        assert_eq!(key.to_string(), key.as_str());
    }

    #[test]
    fn test_namespaces_do_not_share_buckets() {
        let hasher = IdentityHasher::new();
        assert_ne!(
            hasher.bucket_key("rate-limit", "1.2.3.4"),
            hasher.bucket_key("auth-rate-limit", "1.2.3.4")
        );
    }

    #[test]
    fn test_salt_changes_digest() {
        let plain = IdentityHasher::new();
        let salted = IdentityHasher::with_salt("pepper");

        assert_ne!(plain.hash("1.2.3.4"), salted.hash("1.2.3.4"));
        assert_eq!(salted.hash("1.2.3.4"), IdentityHasher::with_salt("pepper").hash("1.2.3.4"));
    }
}
