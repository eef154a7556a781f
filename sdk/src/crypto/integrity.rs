use {
    coffre_protocol::{errors::IntegrityError, HashKey},
    hmac::{Hmac, Mac},
    sha2::Sha256,
    std::fmt,
};

/// Length of one chunk integrity tag (HMAC-SHA-256).
pub const TAG_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Computes and validates per-chunk HMAC tags over ciphertext.
///
/// Tags always cover ciphertext, never plaintext; verifying before
/// decryption means tampered input is rejected without ever producing
/// attacker-influenced plaintext. The hash key is independent of the
/// encryption key. The chunk size is fixed by the stream header when the
/// object is first written and never changes afterwards.
pub struct IntegrityEngine {
    mac: HmacSha256,
    chunk_size: u32,
}

impl IntegrityEngine {
    #[expect(
        clippy::expect_used,
        reason = "HMAC accepts keys of any length, so construction cannot fail"
    )]
    #[inline]
    pub fn new(hash_key: &HashKey, chunk_size: u32) -> Result<Self, IntegrityError> {
        if chunk_size == 0 {
            return Err(IntegrityError::ChunkSizeRequired);
        }
        let mac = HmacSha256::new_from_slice(&hash_key.to_bytes()).expect("HMAC key");
        Ok(Self { mac, chunk_size })
    }

    #[must_use]
    #[inline]
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn unit_mac(&self, unit: u64, chunk: &[u8], header: Option<&[u8]>) -> HmacSha256 {
        let mut mac = self.mac.clone();
        if unit == 0
            && let Some(header) = header
        {
            mac.update(header);
        }
        mac.update(chunk);
        mac
    }

    /// Tag of a single ciphertext chunk. `header` is chained into the tag of
    /// unit 0 only, making header tampering evident together with the first
    /// chunk.
    #[must_use]
    #[inline]
    pub fn unit_tag(&self, unit: u64, chunk: &[u8], header: Option<&[u8]>) -> [u8; TAG_SIZE] {
        self.unit_mac(unit, chunk, header).finalize().into_bytes().into()
    }

    /// Constant-time check of one unit's tag.
    #[inline]
    pub fn verify_unit(
        &self,
        unit: u64,
        chunk: &[u8],
        header: Option<&[u8]>,
        tag: &[u8],
    ) -> Result<(), IntegrityError> {
        self.unit_mac(unit, chunk, header)
            .verify_slice(tag)
            .map_err(|_| IntegrityError::TagMismatch { unit })
    }

    /// One tag per chunk-size slice of `ciphertext` (the last chunk may be
    /// shorter).
    #[must_use]
    pub fn generate_hashes(
        &self,
        ciphertext: &[u8],
        header: Option<&[u8]>,
    ) -> Vec<[u8; TAG_SIZE]> {
        ciphertext
            .chunks(self.chunk_size as usize)
            .enumerate()
            .map(|(unit, chunk)| self.unit_tag(unit as u64, chunk, header))
            .collect()
    }

    /// Recomputes and checks every tag. All chunks are processed and every
    /// comparison is constant time; the error names the first mismatching
    /// unit.
    pub fn verify_hashes(
        &self,
        tags: &[[u8; TAG_SIZE]],
        ciphertext: &[u8],
        header: Option<&[u8]>,
    ) -> Result<(), IntegrityError> {
        let expected = ciphertext.len().div_ceil(self.chunk_size as usize);
        if tags.len() != expected {
            return Err(IntegrityError::TagCountMismatch {
                got: tags.len(),
                expected,
            });
        }
        let mut first_mismatch = None;
        for (unit, (tag, chunk)) in tags
            .iter()
            .zip(ciphertext.chunks(self.chunk_size as usize))
            .enumerate()
        {
            let verdict = self.verify_unit(unit as u64, chunk, header, tag);
            if verdict.is_err() && first_mismatch.is_none() {
                first_mismatch = Some(unit as u64);
            }
        }
        match first_mismatch {
            Some(unit) => Err(IntegrityError::TagMismatch { unit }),
            None => Ok(()),
        }
    }

    /// Inverts the on-wire `[tag][chunk]` interleaving into a tag list and
    /// tag-free ciphertext. All bounds derive from the actual input length,
    /// never from attacker-supplied counts.
    ///
    /// Serves consumers that hold a whole encrypted object in memory;
    /// streamed reads verify each unit in place instead.
    pub fn split_tagged(
        &self,
        interleaved: &[u8],
    ) -> Result<(Vec<[u8; TAG_SIZE]>, Vec<u8>), IntegrityError> {
        let stride = TAG_SIZE + self.chunk_size as usize;
        let mut tags = Vec::with_capacity(interleaved.len().div_ceil(stride));
        let mut ciphertext = Vec::with_capacity(interleaved.len());
        let mut rest = interleaved;
        while !rest.is_empty() {
            if rest.len() <= TAG_SIZE {
                // A tag must be followed by at least one ciphertext byte.
                return Err(IntegrityError::TruncatedUnit);
            }
            let (tag, tail) = rest.split_at(TAG_SIZE);
            let mut tag_array = [0u8; TAG_SIZE];
            tag_array.copy_from_slice(tag);
            tags.push(tag_array);
            let take = tail.len().min(self.chunk_size as usize);
            ciphertext.extend_from_slice(&tail[..take]);
            rest = &tail[take..];
        }
        Ok((tags, ciphertext))
    }
}

// Keyed MAC state stays out of debug output.
impl fmt::Debug for IntegrityEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityEngine")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rand::SeedableRng, rand_chacha::ChaCha8Rng};

    fn engine(chunk_size: u32) -> IntegrityEngine {
        let key = HashKey::generate_with_rng(&mut ChaCha8Rng::seed_from_u64(11));
        IntegrityEngine::new(&key, chunk_size).unwrap()
    }

    #[test]
    fn zero_chunk_size_is_a_configuration_error() {
        let key = HashKey::generate_with_rng(&mut ChaCha8Rng::seed_from_u64(11));
        let err = IntegrityEngine::new(&key, 0).unwrap_err();
        assert_eq!(err, IntegrityError::ChunkSizeRequired);
    }

    #[test]
    fn generate_and_verify_roundtrip() {
        let engine = engine(16);
        let ciphertext = vec![7u8; 40];
        let tags = engine.generate_hashes(&ciphertext, None);
        assert_eq!(tags.len(), 3);
        engine.verify_hashes(&tags, &ciphertext, None).unwrap();
    }

    #[test]
    fn header_is_chained_into_first_tag_only() {
        let engine = engine(16);
        let ciphertext = vec![1u8; 32];
        let header = [9u8; 17];
        let plain_tags = engine.generate_hashes(&ciphertext, None);
        let chained_tags = engine.generate_hashes(&ciphertext, Some(&header));
        assert_ne!(plain_tags[0], chained_tags[0]);
        assert_eq!(plain_tags[1], chained_tags[1]);
        engine
            .verify_hashes(&chained_tags, &ciphertext, Some(&header))
            .unwrap();
        engine
            .verify_hashes(&chained_tags, &ciphertext, None)
            .unwrap_err();
    }

    #[test]
    fn tampered_chunk_reports_its_unit() {
        let engine = engine(16);
        let mut ciphertext = vec![3u8; 48];
        let tags = engine.generate_hashes(&ciphertext, None);
        ciphertext[20] ^= 1;
        let err = engine.verify_hashes(&tags, &ciphertext, None).unwrap_err();
        assert_eq!(err, IntegrityError::TagMismatch { unit: 1 });
    }

    #[test]
    fn tag_count_mismatch_is_rejected() {
        let engine = engine(16);
        let ciphertext = vec![3u8; 48];
        let tags = engine.generate_hashes(&ciphertext, None);
        let err = engine
            .verify_hashes(&tags[..2], &ciphertext, None)
            .unwrap_err();
        assert_eq!(
            err,
            IntegrityError::TagCountMismatch {
                got: 2,
                expected: 3,
            }
        );
    }

    #[test]
    fn split_tagged_inverts_interleaving() {
        let engine = engine(16);
        let ciphertext: Vec<u8> = (0u8..40).collect();
        let tags = engine.generate_hashes(&ciphertext, None);
        let mut interleaved = Vec::new();
        for (tag, chunk) in tags.iter().zip(ciphertext.chunks(16)) {
            interleaved.extend_from_slice(tag);
            interleaved.extend_from_slice(chunk);
        }
        let (split_tags, split_ciphertext) = engine.split_tagged(&interleaved).unwrap();
        assert_eq!(split_tags, tags);
        assert_eq!(split_ciphertext, ciphertext);
    }

    #[test]
    fn debug_output_hides_the_mac_key() {
        let debug = format!("{:?}", engine(64));
        assert_eq!(debug, "IntegrityEngine { chunk_size: 64, .. }");
    }

    #[test]
    fn trailing_tag_without_payload_is_truncation() {
        let engine = engine(16);
        let interleaved = vec![0u8; TAG_SIZE];
        let err = engine.split_tagged(&interleaved).unwrap_err();
        assert_eq!(err, IntegrityError::TruncatedUnit);
    }
}
