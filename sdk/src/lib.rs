pub mod crypto;
pub mod sequencer;

pub use crate::{
    crypto::{EncryptedStream, EncryptionMode, IntegrityOptions, StreamOptions},
    sequencer::NonceSequencer,
};
