//! Error taxonomy of the encrypted drive core.
//!
//! Stream operations surface these as `std::io::Error` values carrying the
//! typed cause, so callers can distinguish a broken stream from tampering
//! from an exhausted nonce range via [`std::io::Error::get_ref`] and
//! `downcast_ref`. Nonce-related errors are fatal to the operation that hit
//! them: reuse is the one failure this design must never self-recover from,
//! so there is no automatic retry anywhere.

use std::io;

use crate::DriveId;

/// Violation of key, nonce, or write-position rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("invalid encryption key length; got {got}, expected {expected}")]
    InvalidKeyLength { got: usize, expected: usize },
    #[error("invalid nonce length; got {got}, expected {expected}")]
    InvalidNonceLength { got: usize, expected: usize },
    #[error(
        "write at position {position} denied: rewriting an encrypted range reuses \
         counter blocks; enable range writes only if no other party observed the \
         earlier ciphertext"
    )]
    RangeWriteDenied { position: u64 },
    #[error("write at position {position} is not aligned to the {unit}-byte unit")]
    UnalignedWrite { position: u64, unit: u64 },
    #[error("operation not permitted in {mode} mode")]
    WrongMode { mode: &'static str },
}

/// Tamper evidence or invalid integrity configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("integrity tag mismatch in unit {unit}")]
    TagMismatch { unit: u64 },
    #[error("tag count mismatch; got {got}, expected {expected}")]
    TagCountMismatch { got: usize, expected: usize },
    #[error("stream carries integrity tags but no hash key was supplied")]
    MissingHashKey,
    #[error("integrity is enabled but chunk size is zero")]
    ChunkSizeRequired,
    #[error("chunk size mismatch; header says {header}, caller expects {expected}")]
    ChunkSizeMismatch { header: u32, expected: u32 },
    #[error("truncated unit: tag without ciphertext payload")]
    TruncatedUnit,
}

/// Counter or nonce space exhaustion. Always a hard stop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeExceededError {
    #[error("CTR block counter exhausted; continuing would reuse keystream")]
    CounterExhausted,
    #[error("nonce range exhausted for drive {drive_id}")]
    NonceExhausted { drive_id: DriveId },
}

/// Invalid sequencer state transitions and lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("sequence for drive {drive_id} already exists")]
    AlreadyExists { drive_id: DriveId },
    #[error("no sequence for drive {drive_id}")]
    NotFound { drive_id: DriveId },
    #[error("sequence for drive {drive_id} is already initialized")]
    AlreadyInitialized { drive_id: DriveId },
    #[error("sequence for drive {drive_id} is not active")]
    NotActive { drive_id: DriveId },
    #[error("authorization id does not match the sequence owner")]
    AuthorizationMismatch,
    #[error("nonce range is empty; start must be less than max")]
    EmptyRange,
    #[error("sequence for drive {drive_id} is revoked")]
    Revoked { drive_id: DriveId },
}

impl From<SecurityError> for io::Error {
    #[inline]
    fn from(err: SecurityError) -> Self {
        let kind = match &err {
            SecurityError::RangeWriteDenied { .. } => io::ErrorKind::PermissionDenied,
            SecurityError::InvalidKeyLength { .. }
            | SecurityError::InvalidNonceLength { .. }
            | SecurityError::UnalignedWrite { .. }
            | SecurityError::WrongMode { .. } => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err)
    }
}

impl From<IntegrityError> for io::Error {
    #[inline]
    fn from(err: IntegrityError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

impl From<RangeExceededError> for io::Error {
    #[inline]
    fn from(err: RangeExceededError) -> Self {
        io::Error::other(err)
    }
}
