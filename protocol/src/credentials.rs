use {
    crate::{HASH_KEY_SIZE, KEY_SIZE},
    anyhow::{anyhow, bail, ensure, format_err, Error},
    base64::{display::Base64Display, prelude::BASE64_URL_SAFE_NO_PAD, Engine},
    rand::{
        distr::{Alphanumeric, SampleString},
        rand_core,
        rngs::OsRng,
        CryptoRng, TryRngCore,
    },
    serde::{de, Deserialize, Deserializer, Serialize, Serializer},
    std::{
        any::Any,
        borrow::Cow,
        fmt::{self, Debug, Display},
        panic::catch_unwind,
        str::FromStr,
    },
    zeroize::{Zeroize, ZeroizeOnDrop},
};

/// Identifier of one authorized writer of a drive's nonce space.
///
/// The device that creates a drive generates its own authorization id; every
/// exported nonce sub-range carries a fresh one for the receiving device.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AuthorizationId(String);

const AUTHORIZATION_ID_LENGTH: usize = 16;

fn format_panic_message(err: &(dyn Any + Send + 'static)) -> String {
    err.downcast_ref::<&'static str>()
        .map(|&s| s.to_owned())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| format!("{err:?}"))
}

impl AuthorizationId {
    #[inline]
    pub fn generate() -> anyhow::Result<Self> {
        catch_unwind(|| {
            Self(Alphanumeric.sample_string(
                &mut rand_core::UnwrapErr(OsRng),
                AUTHORIZATION_ID_LENGTH,
            ))
        })
        .map_err(|err| anyhow!(format_panic_message(&*err)))
    }

    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AuthorizationId {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(
            s.len() == AUTHORIZATION_ID_LENGTH,
            "invalid length; got {}, expected {AUTHORIZATION_ID_LENGTH}",
            s.len(),
        );
        if let Some(c) = s.chars().find(|c| !c.is_ascii_alphanumeric()) {
            bail!("must be alphanumeric but contains invalid character `{c}`");
        }
        Ok(Self(s.to_owned()))
    }
}

impl Display for AuthorizationId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for AuthorizationId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorizationId({})", self.0)
    }
}

/// Secret used as the AES-256 key of encrypted streams.
///
/// Exclusively owned by the caller and never persisted by the core. The key
/// bytes are wiped when the value is dropped; accessors hand out defensive
/// copies only.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    #[inline]
    pub fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    #[inline]
    pub fn generate_with_rng<R: CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    #[inline]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns a defensive copy of the key material.
    #[must_use]
    #[inline]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0
    }

    #[must_use]
    #[inline]
    pub fn display_unmasked(&self) -> impl Display + '_ {
        Base64Display::new(self.0.as_ref(), &BASE64_URL_SAFE_NO_PAD)
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Cow::<'_, str>::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

impl Serialize for EncryptionKey {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        BASE64_URL_SAFE_NO_PAD.encode(self.0).serialize(serializer)
    }
}

impl FromStr for EncryptionKey {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(s)?;
        let array = <[u8; KEY_SIZE]>::try_from(bytes).map_err(|bytes| {
            format_err!("invalid length; got {}, expected {KEY_SIZE}", bytes.len())
        })?;
        Ok(Self(array))
    }
}

impl Debug for EncryptionKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey").finish()
    }
}

/// Secret key of the chunk integrity engine.
///
/// Independent of the encryption key; a drive that enables chunk integrity
/// derives or stores this separately.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HashKey([u8; HASH_KEY_SIZE]);

impl HashKey {
    #[inline]
    pub fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; HASH_KEY_SIZE];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    #[inline]
    pub fn generate_with_rng<R: CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; HASH_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    #[inline]
    pub fn from_bytes(bytes: [u8; HASH_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns a defensive copy of the key material.
    #[must_use]
    #[inline]
    pub fn to_bytes(&self) -> [u8; HASH_KEY_SIZE] {
        self.0
    }
}

impl<'de> Deserialize<'de> for HashKey {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Cow::<'_, str>::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

impl Serialize for HashKey {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        BASE64_URL_SAFE_NO_PAD.encode(self.0).serialize(serializer)
    }
}

impl FromStr for HashKey {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(s)?;
        let array = <[u8; HASH_KEY_SIZE]>::try_from(bytes).map_err(|bytes| {
            format_err!(
                "invalid length; got {}, expected {HASH_KEY_SIZE}",
                bytes.len()
            )
        })?;
        Ok(Self(array))
    }
}

impl Debug for HashKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashKey").finish()
    }
}
