//! Integrity primitives
//!
//! Content fingerprints, authenticated encryption of byte blobs, and key
//! material persistence.

mod cipher;
mod fingerprint;
mod keys;

pub use cipher::{open, seal, CryptoError, VaultKey, KEY_SIZE, MAGIC, NONCE_SIZE, TAG_SIZE};
pub use fingerprint::Fingerprint;
pub use keys::{KeyError, KeyOrigin, KeyResult, KeyStore};
