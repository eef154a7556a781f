//! Authenticated, randomly-seekable AES-CTR encryption.
//!
//! An encrypted object starts with a fixed 17-byte header:
//!
//! - magic number (32 bits, little endian)
//! - format version (8 bits)
//! - chunk size (32 bits, little endian); zero means chunk integrity is disabled
//! - nonce (64 bits)
//!
//! The nonce forms the high-order half of every 16-byte CTR counter block;
//! the low-order half is the big-endian index of the 16-byte block at the
//! current virtual position. Encrypting the counter block with AES-256 yields
//! the keystream, so any plaintext offset can be read or written without
//! processing preceding bytes. For a given key, a counter block value must
//! never be used for two distinct plaintexts; the nonce sequencer exists to
//! guarantee that across devices.
//!
//! With integrity enabled, the payload after the header is a sequence of
//! units:
//!
//! - tag (256 bits) - HMAC-SHA-256 of the following ciphertext chunk
//! - ciphertext chunk (up to chunk size bytes; only the final chunk may be
//!   shorter)
//!
//! The first unit's tag additionally covers the header bytes, so header
//! tampering is detected together with the first chunk. Tags are computed
//! over ciphertext, never plaintext. Without integrity the payload is raw
//! ciphertext.

mod backend;
mod ctr;
mod header;
mod integrity;
mod stream;

pub use backend::{cipher_backend, set_cipher_backend, BlockCipher, CipherBackend, BLOCK_SIZE};
pub use ctr::CtrTransformer;
pub use header::{StreamHeader, FORMAT_VERSION, HEADER_LEN, MAGIC_NUMBER, MAX_CHUNK_SIZE};
pub use integrity::{IntegrityEngine, TAG_SIZE};
pub use stream::{EncryptedStream, EncryptionMode, IntegrityOptions, StreamOptions};
