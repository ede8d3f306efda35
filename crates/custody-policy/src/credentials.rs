//! Salted one-way secret hashing (Argon2id, PHC string format).
//!
//! Production builds use `Argon2::default()` (19 MiB, 2 iterations).
//! Unit tests use a reduced cost profile; it must never reach a release build.

use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
#[cfg(test)]
use argon2::{Algorithm, Params, Version};
use std::sync::OnceLock;

use crate::PolicyError;

#[inline]
fn argon2_instance() -> Argon2<'static> {
    #[cfg(test)]
    {
        let params = Params::new(1024, 1, 1, None).expect("valid Argon2 params for tests");
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
    }

    #[cfg(not(test))]
    {
        Argon2::default()
    }
}

/// Hash a secret with a fresh random salt.
pub fn hash_secret(secret: &str) -> Result<String, PolicyError> {
    let salt = SaltString::generate(&mut OsRng);
    argon2_instance()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PolicyError::Credential(e.to_string()))
}

/// Verify a secret against a stored PHC string.
///
/// An unparseable stored hash verifies as `false`.
pub fn verify_secret(secret: &str, stored: &str) -> bool {
    let parsed = match PasswordHash::new(stored) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };
    argon2_instance()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}

/// Burn one verification against a throwaway hash.
///
/// Used on the unknown-identity path so it costs the same as a wrong secret.
pub fn verify_against_decoy(secret: &str) {
    static DECOY: OnceLock<Option<String>> = OnceLock::new();
    if let Some(decoy) = DECOY.get_or_init(|| hash_secret("decoy-credential").ok()) {
        let _ = verify_secret(secret, decoy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_has_phc_prefix() {
        let hash = hash_secret("orbit-1234").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("orbit-1234"));
    }

    #[test]
    fn test_verify_correct_and_wrong() {
        let hash = hash_secret("orbit-1234").unwrap();
        assert!(verify_secret("orbit-1234", &hash));
        assert!(!verify_secret("orbit-1235", &hash));
    }

    #[test]
    fn test_salts_differ() {
        let a = hash_secret("same").unwrap();
        let b = hash_secret("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_stored_hash() {
        assert!(!verify_secret("anything", "not-a-phc-string"));
    }
}
