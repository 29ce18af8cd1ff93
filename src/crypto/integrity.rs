//! Message integrity for NAT allocation messages.
//!
//! Long-term credentials are reduced to a 32-byte key
//! `SHA-256(username ":" realm ":" password)`, which keys an HMAC-SHA256
//! over the message bytes.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::INTEGRITY_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Key derived from long-term credentials.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IntegrityKey([u8; 32]);

impl IntegrityKey {
    /// Derive the key for `username` in `realm`.
    pub fn derive(username: &str, realm: &str, password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update(b":");
        hasher.update(realm.as_bytes());
        hasher.update(b":");
        hasher.update(password.as_bytes());
        Self(hasher.finalize().into())
    }

    /// HMAC-SHA256 of `data`.
    pub fn sign(&self, data: &[u8]) -> [u8; INTEGRITY_SIZE] {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time check of `tag` against `data`.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

impl std::fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IntegrityKey(..)")
    }
}
