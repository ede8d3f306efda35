//! Authenticated encryption of artifact blobs (XChaCha20-Poly1305)
//!
//! Sealed layout: `MAGIC (4) || nonce (24) || ciphertext+tag`.
//! The magic header is bound as associated data, so a header swap fails the
//! tag check like any other tampering.

use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

/// Sealed blob header
pub const MAGIC: &[u8; 4] = b"EOV1";

/// Key size (256 bits)
pub const KEY_SIZE: usize = 32;

/// XChaCha20 nonce size
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Errors from seal/open
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: authentication tag mismatch or wrong key")]
    AuthenticationFailed,

    #[error("not a sealed artifact: {0}")]
    MalformedEnvelope(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Symmetric vault key. Zeroed on drop, never printed.
#[derive(Clone, ZeroizeOnDrop)]
pub struct VaultKey {
    bytes: [u8; KEY_SIZE],
}

impl VaultKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Decode the persisted (base64) form
    pub fn from_encoded(encoded: &str) -> Result<Self, CryptoError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if raw.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                raw.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        Ok(Self { bytes })
    }

    /// Persisted (base64) form. Handle as a secret.
    pub fn encode(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.bytes)
    }

    /// Non-secret identifier: first 16 hex chars of SHA-256(key)
    pub fn key_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.bytes);
        hex::encode(hasher.finalize())[..16].to_string()
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.bytes).into())
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKey")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

/// Encrypt a plaintext blob under `key` with a fresh random nonce
pub fn seal(key: &VaultKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);

    let ciphertext = key
        .cipher()
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: MAGIC,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(MAGIC.len() + NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(MAGIC);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a sealed blob. Fails closed on any tampering or key mismatch.
pub fn open(key: &VaultKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let header_len = MAGIC.len() + NONCE_SIZE;
    if sealed.len() < header_len + TAG_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "{} bytes is shorter than the minimum envelope",
            sealed.len()
        )));
    }
    if &sealed[..MAGIC.len()] != MAGIC {
        return Err(CryptoError::MalformedEnvelope("bad magic".to_string()));
    }

    let nonce = XNonce::from_slice(&sealed[MAGIC.len()..header_len]);
    key.cipher()
        .decrypt(
            nonce,
            Payload {
                msg: &sealed[header_len..],
                aad: MAGIC,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let key = VaultKey::generate();
        let plaintext = b"level-1 radiance samples".to_vec();
        let sealed = seal(&key, &plaintext).unwrap();
        assert_eq!(&sealed[..4], MAGIC);
        assert_eq!(open(&key, &sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let k1 = VaultKey::generate();
        let k2 = VaultKey::generate();
        let sealed = seal(&k1, b"payload").unwrap();
        assert_eq!(open(&k2, &sealed), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails_closed() {
        let key = VaultKey::generate();
        let mut sealed = seal(&key, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert_eq!(open(&key, &sealed), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let key = VaultKey::generate();
        assert!(matches!(
            open(&key, b"MALICIOUS_CORRUPTION_EVENT_000"),
            Err(CryptoError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = VaultKey::generate();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_encoded_form() {
        let key = VaultKey::generate();
        let decoded = VaultKey::from_encoded(&key.encode()).unwrap();
        assert_eq!(decoded.key_id(), key.key_id());
        assert!(VaultKey::from_encoded("c2hvcnQ=").is_err());
    }

    #[test]
    fn test_debug_hides_bytes() {
        let key = VaultKey::from_bytes([0xAB; KEY_SIZE]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("key_id"));
        assert!(!debug.contains(&key.encode()));
    }
}
