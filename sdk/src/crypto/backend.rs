//! Pluggable AES block-cipher backend.
//!
//! The CTR transformer only needs one capability: encrypting a single
//! 16-byte block. Which implementation provides it is a process-wide
//! setting, not a per-stream one, so every stream in a process derives
//! keystream the same way.

use {
    aes::{
        cipher::{BlockEncrypt, KeyInit},
        Aes256Enc,
    },
    coffre_protocol::{errors::SecurityError, KEY_SIZE},
    parking_lot::RwLock,
    std::fmt,
};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// One-block encryption capability used to derive CTR keystream.
pub trait BlockCipher: Send + Sync {
    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]);
}

/// Selects which [`BlockCipher`] implementation new transformers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherBackend {
    /// RustCrypto `aes`. Uses AES-NI / NEON when the CPU supports it and
    /// falls back to the portable software implementation otherwise.
    #[default]
    RustCrypto,
    /// Identity permutation: the keystream equals the raw counter blocks.
    /// Provides no secrecy whatsoever; exists so tests can observe counter
    /// values through the public stream interface.
    Passthrough,
}

static ACTIVE_BACKEND: RwLock<CipherBackend> = RwLock::new(CipherBackend::RustCrypto);

/// Returns the backend new transformers will use.
#[must_use]
#[inline]
pub fn cipher_backend() -> CipherBackend {
    *ACTIVE_BACKEND.read()
}

/// Replaces the process-wide backend. Affects transformers constructed
/// afterwards, not existing ones.
#[inline]
pub fn set_cipher_backend(backend: CipherBackend) {
    *ACTIVE_BACKEND.write() = backend;
}

pub(crate) fn make_block_cipher(key: &[u8]) -> Result<Box<dyn BlockCipher>, SecurityError> {
    match cipher_backend() {
        CipherBackend::RustCrypto => Ok(Box::new(RustCryptoAes::new(key)?)),
        CipherBackend::Passthrough => Ok(Box::new(Passthrough)),
    }
}

struct RustCryptoAes(Aes256Enc);

impl RustCryptoAes {
    fn new(key: &[u8]) -> Result<Self, SecurityError> {
        let cipher = Aes256Enc::new_from_slice(key).map_err(|_| {
            SecurityError::InvalidKeyLength {
                got: key.len(),
                expected: KEY_SIZE,
            }
        })?;
        Ok(Self(cipher))
    }
}

impl BlockCipher for RustCryptoAes {
    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.0.encrypt_block(aes::Block::from_mut_slice(block));
    }
}

impl fmt::Debug for RustCryptoAes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustCryptoAes").finish()
    }
}

struct Passthrough;

impl BlockCipher for Passthrough {
    fn encrypt_block(&self, _block: &mut [u8; BLOCK_SIZE]) {}
}
