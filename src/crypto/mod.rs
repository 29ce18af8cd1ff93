//! Cryptographic helpers.
//!
//! This module provides:
//! - Secure random number generation (nonces, transaction ids, instance ids)
//! - HMAC-SHA256 message integrity keyed by long-term credentials
//!
//! Key material is zeroized on drop.

mod integrity;
mod random;

pub use integrity::IntegrityKey;
pub use random::SecureRandom;

/// Size of an HMAC-SHA256 integrity tag in bytes
pub const INTEGRITY_SIZE: usize = 32;
