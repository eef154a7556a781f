use {
    crate::crypto::{
        backend::BLOCK_SIZE,
        ctr::CtrTransformer,
        header::{StreamHeader, HEADER_LEN, MAX_CHUNK_SIZE},
        integrity::{IntegrityEngine, TAG_SIZE},
    },
    coffre_protocol::{
        errors::{IntegrityError, SecurityError},
        EncryptionKey, HashKey, Nonce,
    },
    std::{
        cmp::min,
        fmt,
        io::{self, Read, Seek, SeekFrom, Write},
    },
    tracing::{debug, warn},
};

/// Direction of an encrypted stream, fixed at construction and never
/// switched afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    Encrypt,
    Decrypt,
}

impl EncryptionMode {
    fn name(self) -> &'static str {
        match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
        }
    }
}

/// Chunk integrity parameters.
#[derive(Debug, Clone)]
pub struct IntegrityOptions {
    /// Secret HMAC key, independent of the encryption key.
    pub hash_key: HashKey,
    /// Plaintext bytes per integrity unit. When creating a stream this must
    /// be a non-zero multiple of the cipher block size; when opening, zero
    /// means "take the value from the header".
    pub chunk_size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub integrity: Option<IntegrityOptions>,
    /// Permits writes to positions other than the append frontier.
    /// Rewriting a range reuses the exact prior counter blocks, which is
    /// safe only if no other party ever observed the earlier ciphertext
    /// there. Default deny.
    pub allow_range_write: bool,
    /// Makes `read` report end of stream instead of an error when
    /// integrity verification fails.
    pub fail_silently: bool,
}

/// Randomly-seekable encrypted view over a seekable base stream.
///
/// Positions exposed by [`Read`], [`Write`] and [`Seek`] are virtual
/// (plaintext) offsets; the header and interleaved integrity tags of the
/// base stream are invisible to callers. Instances are not thread-safe: the
/// virtual position and counter mutate on every call. Parallel access goes
/// through independent streams over disjoint ranges of the same object.
pub struct EncryptedStream<S> {
    base: S,
    mode: EncryptionMode,
    transformer: CtrTransformer,
    integrity: Option<IntegrityEngine>,
    header_bytes: [u8; HEADER_LEN],
    nonce: Nonce,
    virtual_pos: u64,
    plain_len: u64,
    allow_range_write: bool,
    fail_silently: bool,
}

impl<S> EncryptedStream<S> {
    #[must_use]
    #[inline]
    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    #[must_use]
    #[inline]
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Plaintext length, derived from the base length without scanning.
    #[must_use]
    #[inline]
    pub fn len(&self) -> u64 {
        self.plain_len
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.plain_len == 0
    }

    /// Current virtual (plaintext) position.
    #[must_use]
    #[inline]
    pub fn position(&self) -> u64 {
        self.virtual_pos
    }

    /// Configured chunk size; zero when integrity is disabled.
    #[must_use]
    #[inline]
    pub fn chunk_size(&self) -> u32 {
        self.integrity.as_ref().map_or(0, IntegrityEngine::chunk_size)
    }

    #[must_use]
    #[inline]
    pub fn block_index(&self) -> u64 {
        self.transformer.block_index()
    }

    #[inline]
    pub fn into_inner(self) -> S {
        self.base
    }

    /// Alignment granularity of reads and writes: the chunk size with
    /// integrity enabled, the cipher block size without.
    fn unit_len(&self) -> u64 {
        self.integrity
            .as_ref()
            .map_or(BLOCK_SIZE as u64, |engine| u64::from(engine.chunk_size()))
    }

    fn tag_overhead(&self) -> u64 {
        if self.integrity.is_some() {
            TAG_SIZE as u64
        } else {
            0
        }
    }

    /// Base-stream bytes occupied by one full unit.
    fn stride(&self) -> u64 {
        self.unit_len() + self.tag_overhead()
    }

    fn unit_base_offset(&self, unit_index: u64) -> u64 {
        HEADER_LEN as u64 + unit_index * self.stride()
    }

    /// Base offset of the byte at virtual position `pos`: header length plus
    /// the tag bytes of all complete preceding units.
    fn base_offset_for(&self, pos: u64) -> u64 {
        let unit = self.unit_len();
        self.unit_base_offset(pos / unit) + self.tag_overhead() + pos % unit
    }

    fn check_mode(&self, required: EncryptionMode) -> io::Result<()> {
        if self.mode == required {
            Ok(())
        } else {
            Err(SecurityError::WrongMode {
                mode: self.mode.name(),
            }
            .into())
        }
    }
}

// The base stream and key-derived state stay out of debug output.
impl<S> fmt::Debug for EncryptedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedStream")
            .field("mode", &self.mode)
            .field("nonce", &self.nonce)
            .field("virtual_pos", &self.virtual_pos)
            .field("plain_len", &self.plain_len)
            .finish_non_exhaustive()
    }
}

fn validate_chunk_size(chunk_size: u32) -> io::Result<()> {
    if chunk_size == 0 {
        return Err(IntegrityError::ChunkSizeRequired.into());
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("chunk size is too large (max {MAX_CHUNK_SIZE}, got {chunk_size})"),
        ));
    }
    if chunk_size as usize % BLOCK_SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("chunk size must be a multiple of the {BLOCK_SIZE}-byte cipher block"),
        ));
    }
    Ok(())
}

impl<S: Write + Seek> EncryptedStream<S> {
    /// Creates a new encrypted object over `base`, writing the header.
    /// The returned stream is in [`EncryptionMode::Encrypt`].
    pub fn create(
        mut base: S,
        key: &EncryptionKey,
        nonce: Nonce,
        options: StreamOptions,
    ) -> io::Result<Self> {
        let integrity = match &options.integrity {
            Some(opts) => {
                validate_chunk_size(opts.chunk_size)?;
                Some(IntegrityEngine::new(&opts.hash_key, opts.chunk_size).map_err(io::Error::from)?)
            }
            None => None,
        };
        let chunk_size = integrity.as_ref().map_or(0, IntegrityEngine::chunk_size);
        let header = StreamHeader::new(chunk_size, nonce);
        let header_bytes = header.encode();
        base.seek(SeekFrom::Start(0))?;
        base.write_all(&header_bytes)?;
        let transformer = CtrTransformer::new(key, nonce).map_err(io::Error::from)?;
        debug!(%nonce, chunk_size, "created encrypted stream");
        Ok(Self {
            base,
            mode: EncryptionMode::Encrypt,
            transformer,
            integrity,
            header_bytes,
            nonce,
            virtual_pos: 0,
            plain_len: 0,
            allow_range_write: options.allow_range_write,
            fail_silently: options.fail_silently,
        })
    }

    fn write_units(&mut self, buf: &[u8]) -> io::Result<()> {
        let unit = self.unit_len();
        let mut pos = self.virtual_pos;
        let mut rest = buf;
        while !rest.is_empty() {
            let unit_index = pos / unit;
            let take = min(unit, rest.len() as u64) as usize;
            // A short unit may only terminate the stream.
            if (take as u64) < unit && pos + (take as u64) < self.plain_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "partial unit rewrite in the middle of the stream",
                ));
            }
            self.transformer.sync_counter(pos).map_err(io::Error::from)?;
            let ciphertext = self
                .transformer
                .encrypt_data(&rest[..take])
                .map_err(io::Error::from)?;
            self.base
                .seek(SeekFrom::Start(self.unit_base_offset(unit_index)))?;
            if let Some(engine) = &self.integrity {
                let header = (unit_index == 0).then_some(&self.header_bytes[..]);
                let tag = engine.unit_tag(unit_index, &ciphertext, header);
                self.base.write_all(&tag)?;
            }
            self.base.write_all(&ciphertext)?;
            pos += take as u64;
            rest = &rest[take..];
        }
        self.virtual_pos = pos;
        self.plain_len = self.plain_len.max(pos);
        self.transformer
            .sync_counter(self.virtual_pos)
            .map_err(io::Error::from)?;
        Ok(())
    }
}

impl<S: Read + Seek> EncryptedStream<S> {
    /// Opens an existing encrypted object, parsing and validating its
    /// header. The returned stream is in [`EncryptionMode::Decrypt`]; the
    /// nonce and chunk size come from the header.
    pub fn open(mut base: S, key: &EncryptionKey, options: StreamOptions) -> io::Result<Self> {
        base.seek(SeekFrom::Start(0))?;
        let header = StreamHeader::read_from(&mut base)?;
        let integrity = if header.integrity_enabled() {
            let Some(opts) = &options.integrity else {
                return Err(IntegrityError::MissingHashKey.into());
            };
            if opts.chunk_size != 0 && opts.chunk_size != header.chunk_size {
                return Err(IntegrityError::ChunkSizeMismatch {
                    header: header.chunk_size,
                    expected: opts.chunk_size,
                }
                .into());
            }
            validate_chunk_size(header.chunk_size)?;
            Some(IntegrityEngine::new(&opts.hash_key, header.chunk_size).map_err(io::Error::from)?)
        } else {
            if let Some(opts) = &options.integrity {
                return Err(IntegrityError::ChunkSizeMismatch {
                    header: 0,
                    expected: opts.chunk_size,
                }
                .into());
            }
            None
        };

        let base_len = base.seek(SeekFrom::End(0))?;
        let payload = base_len.saturating_sub(HEADER_LEN as u64);
        let plain_len = match &integrity {
            None => payload,
            Some(engine) => {
                let chunk = u64::from(engine.chunk_size());
                let stride = chunk + TAG_SIZE as u64;
                let full_units = payload / stride;
                let rem = payload % stride;
                if rem == 0 {
                    full_units * chunk
                } else if rem <= TAG_SIZE as u64 {
                    return Err(IntegrityError::TruncatedUnit.into());
                } else {
                    full_units * chunk + rem - TAG_SIZE as u64
                }
            }
        };

        let transformer = CtrTransformer::new(key, header.nonce).map_err(io::Error::from)?;
        debug!(
            nonce = %header.nonce,
            chunk_size = header.chunk_size,
            plain_len,
            "opened encrypted stream"
        );
        Ok(Self {
            base,
            mode: EncryptionMode::Decrypt,
            transformer,
            integrity,
            header_bytes: header.encode(),
            nonce: header.nonce,
            virtual_pos: 0,
            plain_len,
            allow_range_write: options.allow_range_write,
            fail_silently: options.fail_silently,
        })
    }

    /// Loads, verifies and decrypts one whole unit. The unit start is
    /// aligned by construction; this is the strict low-level path that
    /// misaligned public reads are reduced to.
    fn load_unit(&mut self, unit_index: u64) -> io::Result<Vec<u8>> {
        let unit = self.unit_len();
        let unit_start = unit_index * unit;
        let unit_plain_len = min(unit, self.plain_len - unit_start) as usize;
        self.base
            .seek(SeekFrom::Start(self.unit_base_offset(unit_index)))?;
        let mut data = vec![0u8; unit_plain_len];
        if let Some(engine) = &self.integrity {
            let mut tag = [0u8; TAG_SIZE];
            self.base.read_exact(&mut tag)?;
            self.base.read_exact(&mut data)?;
            let header = (unit_index == 0).then_some(&self.header_bytes[..]);
            if let Err(err) = engine.verify_unit(unit_index, &data, header, &tag) {
                warn!(unit_index, "integrity verification failed");
                return Err(err.into());
            }
        } else {
            self.base.read_exact(&mut data)?;
        }
        self.transformer
            .sync_counter(unit_start)
            .map_err(io::Error::from)?;
        self.transformer
            .apply_keystream(&mut data)
            .map_err(io::Error::from)?;
        Ok(data)
    }

    fn read_decrypted(&mut self, pos: u64, out: &mut [u8]) -> io::Result<()> {
        if self.integrity.is_some() {
            self.read_units(pos, out)
        } else {
            self.read_span(pos, out)
        }
    }

    /// Unit-by-unit path: each unit is verified and decrypted into a
    /// scratch buffer and the requested sub-range is copied out.
    fn read_units(&mut self, mut pos: u64, out: &mut [u8]) -> io::Result<()> {
        let unit = self.unit_len();
        let mut filled = 0usize;
        while filled < out.len() {
            let unit_index = pos / unit;
            let offset = (pos % unit) as usize;
            let plain = self.load_unit(unit_index)?;
            let take = min(out.len() - filled, plain.len() - offset);
            out[filled..filled + take].copy_from_slice(&plain[offset..offset + take]);
            filled += take;
            pos += take as u64;
        }
        Ok(())
    }

    /// Without tags the ciphertext is contiguous, so a read is one base
    /// read over the block-aligned span covering the request.
    fn read_span(&mut self, pos: u64, out: &mut [u8]) -> io::Result<()> {
        let aligned_start = pos - pos % (BLOCK_SIZE as u64);
        let end = pos + out.len() as u64;
        let mut buf = vec![0u8; (end - aligned_start) as usize];
        self.base
            .seek(SeekFrom::Start(HEADER_LEN as u64 + aligned_start))?;
        self.base.read_exact(&mut buf)?;
        self.transformer
            .sync_counter(aligned_start)
            .map_err(io::Error::from)?;
        self.transformer
            .apply_keystream(&mut buf)
            .map_err(io::Error::from)?;
        let offset = (pos - aligned_start) as usize;
        out.copy_from_slice(&buf[offset..offset + out.len()]);
        Ok(())
    }
}

fn is_integrity_failure(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|cause| cause.is::<IntegrityError>())
}

impl<S: Read + Seek> Read for EncryptedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_mode(EncryptionMode::Decrypt)?;
        if buf.is_empty() || self.virtual_pos >= self.plain_len {
            return Ok(0);
        }
        let want = min(buf.len() as u64, self.plain_len - self.virtual_pos) as usize;
        let pos = self.virtual_pos;
        match self.read_decrypted(pos, &mut buf[..want]) {
            Ok(()) => {
                self.virtual_pos += want as u64;
                Ok(want)
            }
            Err(err) if self.fail_silently && is_integrity_failure(&err) => Ok(0),
            Err(err) => Err(err),
        }
    }
}

impl<S: Write + Seek> Write for EncryptedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_mode(EncryptionMode::Encrypt)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let unit = self.unit_len();
        if self.virtual_pos % unit != 0 {
            return Err(SecurityError::UnalignedWrite {
                position: self.virtual_pos,
                unit,
            }
            .into());
        }
        if self.virtual_pos != self.plain_len && !self.allow_range_write {
            return Err(SecurityError::RangeWriteDenied {
                position: self.virtual_pos,
            }
            .into());
        }
        if self.virtual_pos > self.plain_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past the end of the stream would leave a gap",
            ));
        }
        self.write_units(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.base.flush()
    }
}

impl<S: Seek> Seek for EncryptedStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::Current(delta) => i128::from(self.virtual_pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.plain_len) + i128::from(delta),
        };
        let target = u64::try_from(target).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )
        })?;
        self.virtual_pos = target;
        self.transformer
            .sync_counter(target)
            .map_err(io::Error::from)?;
        let base_target = self.base_offset_for(target.min(self.plain_len));
        self.base.seek(SeekFrom::Start(base_target))?;
        Ok(target)
    }
}
