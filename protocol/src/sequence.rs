//! Persisted nonce sequence records and authorization handoff grants.
//!
//! One [`SequenceRecord`] exists per drive id in a device's local store. It
//! is created once, mutated monotonically (`next` never decreases) and never
//! deleted. A drive stops accepting writes on a device once `next` would
//! reach `max`.
//!
//! Cross-device handoff is a consensus-free replicated counter: the primary
//! device carves a disjoint sub-range off its own record and serializes it as
//! an [`AuthorizationGrant`]. Non-overlap is enforced by construction at
//! export time, not detected at runtime.

use {
    crate::{AuthorizationId, DriveId},
    anyhow::{ensure, Context as _, Result},
    base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine},
    serde::{Deserialize, Serialize},
};

/// Lifecycle of a per-drive nonce sequence.
///
/// `Uninitialized -> Active -> {Revoked, Exhausted}`. Revocation and
/// exhaustion are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceState {
    Uninitialized,
    Active,
    Revoked,
    Exhausted,
}

/// Durable per-drive nonce issuance state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub drive_id: DriveId,
    pub auth_id: AuthorizationId,
    pub state: SequenceState,
    /// First nonce value this device was ever allowed to issue.
    pub start: u64,
    /// Next nonce value to issue. Monotonic, never decremented.
    pub next: u64,
    /// Exclusive upper bound of this device's range.
    pub max: u64,
}

impl SequenceRecord {
    #[must_use]
    #[inline]
    pub fn new(drive_id: DriveId, auth_id: AuthorizationId) -> Self {
        Self {
            drive_id,
            auth_id,
            state: SequenceState::Uninitialized,
            start: 0,
            next: 0,
            max: 0,
        }
    }

    /// Number of values this device may still issue.
    #[must_use]
    #[inline]
    pub fn remaining(&self) -> u64 {
        if self.state == SequenceState::Active {
            self.max.saturating_sub(self.next)
        } else {
            0
        }
    }
}

/// A contiguous, disjoint sub-range of a drive's nonce space, exported by a
/// primary device for exactly one secondary device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    pub drive_id: DriveId,
    /// Fresh authorization id for the receiving device.
    pub auth_id: AuthorizationId,
    /// First nonce value of the granted range.
    pub start: u64,
    /// Exclusive upper bound of the granted range.
    pub max: u64,
}

impl AuthorizationGrant {
    /// Serializes the grant for transport to the secondary device.
    #[inline]
    pub fn to_token(&self) -> Result<String> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .context("failed to encode authorization grant")?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(bytes))
    }

    #[inline]
    pub fn from_token(token: &str) -> Result<Self> {
        let bytes = BASE64_URL_SAFE_NO_PAD
            .decode(token)
            .context("invalid authorization grant encoding")?;
        let (grant, read) = bincode::serde::decode_from_slice::<Self, _>(
            &bytes,
            bincode::config::standard(),
        )
        .context("failed to decode authorization grant")?;
        ensure!(read == bytes.len(), "trailing data in authorization grant");
        ensure!(grant.start < grant.max, "authorization grant range is empty");
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::str::FromStr};

    fn grant() -> AuthorizationGrant {
        AuthorizationGrant {
            drive_id: "drive-1".into(),
            auth_id: AuthorizationId::from_str("a1b2c3d4e5f6g7h8").unwrap(),
            start: 1000,
            max: 2000,
        }
    }

    #[test]
    fn grant_token_roundtrip() {
        let grant = grant();
        let token = grant.to_token().unwrap();
        assert_eq!(AuthorizationGrant::from_token(&token).unwrap(), grant);
    }

    #[test]
    fn empty_grant_range_is_rejected() {
        let mut grant = grant();
        grant.max = grant.start;
        let token = grant.to_token().unwrap();
        AuthorizationGrant::from_token(&token).unwrap_err();
    }

    #[test]
    fn remaining_is_zero_unless_active() {
        let mut record = SequenceRecord::new(
            "drive-1".into(),
            AuthorizationId::from_str("a1b2c3d4e5f6g7h8").unwrap(),
        );
        assert_eq!(record.remaining(), 0);
        record.state = SequenceState::Active;
        record.start = 10;
        record.next = 12;
        record.max = 20;
        assert_eq!(record.remaining(), 8);
        record.state = SequenceState::Revoked;
        assert_eq!(record.remaining(), 0);
    }
}
