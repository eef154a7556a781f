use {
    crate::crypto::backend::{make_block_cipher, BlockCipher, BLOCK_SIZE},
    coffre_protocol::{
        errors::{RangeExceededError, SecurityError},
        EncryptionKey, Nonce, NONCE_SIZE,
    },
};

/// Width of the block-index field inside the counter block.
const INDEX_SIZE: usize = BLOCK_SIZE - NONCE_SIZE;

/// Largest block index the counter block can represent.
const MAX_BLOCK_INDEX: u64 = max_block_index();

const fn max_block_index() -> u64 {
    if INDEX_SIZE >= 8 {
        u64::MAX
    } else {
        (1u64 << (INDEX_SIZE * 8)) - 1
    }
}

/// Turns the AES block cipher into a seekable stream cipher.
///
/// Keystream for block `i` is `AES(key, nonce || i)`; data is XORed with it,
/// so the same transform serves encryption and decryption. The counter
/// advances once per 16-byte block processed; a partial tail block consumes
/// one counter value like a full one. For a given (key, nonce) no counter
/// value may ever cover two distinct plaintexts, which is why exhaustion is
/// a hard stop rather than a wrap.
pub struct CtrTransformer {
    cipher: Box<dyn BlockCipher>,
    nonce: Nonce,
    block_index: u64,
}

impl CtrTransformer {
    #[inline]
    pub fn new(key: &EncryptionKey, nonce: Nonce) -> Result<Self, SecurityError> {
        let cipher = make_block_cipher(&key.to_bytes())?;
        Ok(Self {
            cipher,
            nonce,
            block_index: 0,
        })
    }

    #[must_use]
    #[inline]
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    #[must_use]
    #[inline]
    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    /// The counter block that will produce the next keystream block,
    /// before encryption.
    #[must_use]
    #[inline]
    pub fn counter_block(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..NONCE_SIZE].copy_from_slice(self.nonce.as_bytes());
        block[NONCE_SIZE..].copy_from_slice(&self.block_index.to_be_bytes());
        block
    }

    #[inline]
    pub fn reset_counter(&mut self) {
        self.block_index = 0;
    }

    /// Aligns the counter with a virtual (plaintext) position.
    ///
    /// Fails if the resulting block index does not fit the counter block;
    /// continuing past that point would silently reuse keystream.
    #[inline]
    pub fn sync_counter(&mut self, virtual_position: u64) -> Result<(), RangeExceededError> {
        let index = virtual_position / (BLOCK_SIZE as u64);
        if index > MAX_BLOCK_INDEX {
            return Err(RangeExceededError::CounterExhausted);
        }
        self.block_index = index;
        Ok(())
    }

    /// XORs keystream into `data` starting at the current counter, advancing
    /// the counter once per block. `data` must start block-aligned; the tail
    /// may be partial.
    pub fn apply_keystream(&mut self, data: &mut [u8]) -> Result<(), RangeExceededError> {
        for chunk in data.chunks_mut(BLOCK_SIZE) {
            let mut keystream = self.counter_block();
            self.cipher.encrypt_block(&mut keystream);
            for (byte, key_byte) in chunk.iter_mut().zip(keystream.iter()) {
                *byte ^= key_byte;
            }
            self.advance()?;
        }
        Ok(())
    }

    #[inline]
    pub fn encrypt_data(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, RangeExceededError> {
        let mut out = plaintext.to_vec();
        self.apply_keystream(&mut out)?;
        Ok(out)
    }

    /// CTR is self-inverse, so decryption is the same transform.
    #[inline]
    pub fn decrypt_data(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, RangeExceededError> {
        self.encrypt_data(ciphertext)
    }

    fn advance(&mut self) -> Result<(), RangeExceededError> {
        let next = self
            .block_index
            .checked_add(1)
            .ok_or(RangeExceededError::CounterExhausted)?;
        if next > MAX_BLOCK_INDEX {
            return Err(RangeExceededError::CounterExhausted);
        }
        self.block_index = next;
        Ok(())
    }
}
