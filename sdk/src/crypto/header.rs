use {
    byteorder::{ByteOrder, LE},
    coffre_protocol::{Nonce, NONCE_SIZE},
    std::io::{self, Read, Write},
};

/// File type marker stored at the beginning of every encrypted object.
pub const MAGIC_NUMBER: u32 = 0x4346_5245;

/// Current header format version.
pub const FORMAT_VERSION: u8 = 1;

/// Encoded header length: magic, version, chunk size, nonce.
pub const HEADER_LEN: usize = 4 + 1 + 4 + NONCE_SIZE;

/// Upper bound for the header's chunk size field. The chunk size is
/// attacker-controlled on read and sizes unit buffers, so it is bounds
/// checked before any allocation.
pub const MAX_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

/// Fixed binary prefix of an encrypted object.
///
/// Written once by the encryptor, parsed by every reader before any
/// decryption is attempted. A chunk size of zero means the stream carries no
/// integrity tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u8,
    pub chunk_size: u32,
    pub nonce: Nonce,
}

impl StreamHeader {
    #[must_use]
    #[inline]
    pub fn new(chunk_size: u32, nonce: Nonce) -> Self {
        Self {
            version: FORMAT_VERSION,
            chunk_size,
            nonce,
        }
    }

    #[must_use]
    #[inline]
    pub fn integrity_enabled(&self) -> bool {
        self.chunk_size != 0
    }

    #[must_use]
    #[inline]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LE::write_u32(&mut buf[0..4], MAGIC_NUMBER);
        buf[4] = self.version;
        LE::write_u32(&mut buf[5..9], self.chunk_size);
        buf[9..].copy_from_slice(self.nonce.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> io::Result<Self> {
        if LE::read_u32(&buf[0..4]) != MAGIC_NUMBER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "magic number mismatch",
            ));
        }
        let version = buf[4];
        if version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported format version {version}"),
            ));
        }
        let chunk_size = LE::read_u32(&buf[5..9]);
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk size is too large (max {MAX_CHUNK_SIZE}, got {chunk_size})"),
            ));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&buf[9..]);
        Ok(Self {
            version,
            chunk_size,
            nonce: Nonce(nonce),
        })
    }

    /// Reads and validates a header, failing fast on truncation or a foreign
    /// format before any decryption is attempted.
    #[inline]
    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        reader.read_exact(&mut buf).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::UnexpectedEof, "truncated stream header")
            } else {
                err
            }
        })?;
        Self::decode(&buf)
    }

    #[inline]
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.encode())
    }
}
