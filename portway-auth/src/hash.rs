//! Token hashing primitives.
//!
//! Tokens are never stored; only `PBKDF2-HMAC-SHA256(salt, token)` with a
//! per-token 16-byte salt. Comparison is constant-time.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;

/// Fresh random salt for a new token.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive the stored digest for a presented token.
pub fn derive(token: &str, salt: &[u8]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(token.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    out
}

/// Constant-time digest comparison.
pub fn digests_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

/// Single SHA-256 of the presented token, used only as an in-memory
/// verification-cache key (never persisted).
pub fn cache_key(token: &str) -> [u8; DIGEST_LEN] {
    let digest = Sha256::digest(token.as_bytes());
    digest.into()
}

pub fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode(encoded: &str) -> Option<Vec<u8>> {
    BASE64.decode(encoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic_per_salt() {
        let salt = [7u8; SALT_LEN];
        assert_eq!(derive("secret", &salt), derive("secret", &salt));
        assert_ne!(derive("secret", &salt), derive("other", &salt));
    }

    #[test]
    fn test_different_salts_produce_different_digests() {
        assert_ne!(derive("secret", &[1u8; SALT_LEN]), derive("secret", &[2u8; SALT_LEN]));
    }

    #[test]
    fn test_salts_are_random() {
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn test_constant_time_compare() {
        let a = derive("secret", &[3u8; SALT_LEN]);
        let b = derive("secret", &[3u8; SALT_LEN]);
        assert!(digests_match(&a, &b));
        assert!(!digests_match(&a, &a[..16]));
    }

    #[test]
    fn test_base64_roundtrip() {
        let salt = generate_salt();
        let decoded = decode(&encode(&salt)).unwrap();
        assert_eq!(decoded, salt);
    }
}
