mod credentials;
pub mod errors;
pub mod sequence;

pub use crate::credentials::{AuthorizationId, EncryptionKey, HashKey};

use derive_more::{AsRef, Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of an encryption key in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// Size of an integrity hash key in bytes (HMAC-SHA-256).
pub const HASH_KEY_SIZE: usize = 32;

/// Size of a stream nonce in bytes.
///
/// The nonce occupies the high-order bytes of the 16-byte counter block;
/// the remaining 8 bytes hold the big-endian block index.
pub const NONCE_SIZE: usize = 8;

/// Identifier of an encrypted drive.
///
/// All devices authorized for a drive share this identifier. It keys the
/// nonce sequence records in every device's local store.
#[derive(
    Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, AsRef,
)]
pub struct DriveId(pub String);

impl DriveId {
    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for DriveId {
    #[inline]
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// High-order half of a CTR counter block.
///
/// A nonce must never repeat for the same key. Nonces are issued by the
/// sequencer as strictly increasing counters; the big-endian byte encoding
/// preserves that ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    #[must_use]
    #[inline]
    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    #[must_use]
    #[inline]
    pub const fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    #[must_use]
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl fmt::Display for Nonce {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Nonce {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}
