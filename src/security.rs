//! API-key handling for the protected routes.
//!
//! The configured key is stored as a SHA-256 hex digest, never plaintext,
//! and request headers are compared in constant time.

use sha2::{Digest, Sha256};

/// Constant-time string comparison — prevents timing attacks on key checks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Hex-encoded SHA-256 of an API key.
pub fn hash_api_key(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn constant_time_eq_rejects_different_strings() {
        assert!(!constant_time_eq("secret", "secre7"));
        assert!(!constant_time_eq("secret", "secrets"));
        assert!(!constant_time_eq("secret", ""));
    }

    #[test]
    fn hash_api_key_is_hex_sha256() {
        let hash = hash_api_key("test-key");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_api_key_is_deterministic() {
        assert_eq!(hash_api_key("abc"), hash_api_key("abc"));
        assert_ne!(hash_api_key("abc"), hash_api_key("abd"));
    }
}
