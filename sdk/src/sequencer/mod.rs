//! Durable nonce issuance for encrypted drives.
//!
//! Every encrypted stream of a drive consumes exactly one nonce, and a nonce
//! must never be issued twice for the same key. The sequencer guarantees this
//! with a persisted monotonic counter per drive: the advanced counter is
//! flushed to disk before the issued nonce is returned, so a crash can skip
//! values but never repeat one.
//!
//! Multiple writers are handled without coordination by splitting the nonce
//! space: the primary device exports a disjoint sub-range as an
//! [`AuthorizationGrant`] token and shrinks its own range in the same breath.
//! Imported ranges are disjoint by construction, so two devices can issue
//! nonces concurrently with no runtime overlap detection.

use {
    anyhow::{Context as _, Result},
    coffre_protocol::{
        errors::{RangeExceededError, SequenceError},
        sequence::{AuthorizationGrant, SequenceRecord, SequenceState},
        AuthorizationId, DriveId, Nonce,
    },
    parking_lot::Mutex,
    std::path::Path,
    tracing::{debug, info},
};

mod store;

pub use store::SequenceStore;

/// Issues nonces for encrypted drives, one persisted sequence per drive id.
///
/// All operations take the same internal lock, so a sequencer value can be
/// shared between threads; the store flush inside that lock is what makes
/// issuance crash-safe.
pub struct NonceSequencer {
    store: Mutex<SequenceStore>,
}

impl NonceSequencer {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            store: Mutex::new(SequenceStore::open(path)?),
        })
    }

    /// Registers a drive with this device. The record starts out
    /// uninitialized and cannot issue nonces until [`Self::init_sequence`]
    /// assigns it a range.
    pub fn create_sequence(
        &self,
        drive_id: DriveId,
        auth_id: AuthorizationId,
    ) -> Result<SequenceRecord> {
        let store = self.store.lock();
        let record = SequenceRecord::new(drive_id, auth_id);
        if !store.insert_new(&record)? {
            return Err(SequenceError::AlreadyExists {
                drive_id: record.drive_id,
            }
            .into());
        }
        info!(drive_id = %record.drive_id, "created nonce sequence");
        Ok(record)
    }

    /// Assigns the issuable range `[start, max)` to an uninitialized
    /// sequence and activates it. One-shot: an active, revoked or exhausted
    /// sequence never gets a second range on the same device.
    pub fn init_sequence(
        &self,
        drive_id: &DriveId,
        auth_id: &AuthorizationId,
        start: u64,
        max: u64,
    ) -> Result<()> {
        if start >= max {
            return Err(SequenceError::EmptyRange.into());
        }
        let store = self.store.lock();
        let mut record = get_owned(&store, drive_id, auth_id)?;
        if record.state != SequenceState::Uninitialized {
            return Err(SequenceError::AlreadyInitialized {
                drive_id: drive_id.clone(),
            }
            .into());
        }
        record.state = SequenceState::Active;
        record.start = start;
        record.next = start;
        record.max = max;
        store.put(&record)?;
        info!(%drive_id, start, max, "initialized nonce sequence");
        Ok(())
    }

    /// Issues the next nonce for a drive. The advanced counter hits disk
    /// before the nonce is returned, so no caller ever holds a nonce the
    /// store does not already consider spent. A spent range surfaces as
    /// [`RangeExceededError::NonceExhausted`] on every further call.
    pub fn next_nonce(&self, drive_id: &DriveId, auth_id: &AuthorizationId) -> Result<Nonce> {
        let store = self.store.lock();
        let mut record = get_owned(&store, drive_id, auth_id)?;
        ensure_active(&record)?;
        // Active implies next < max: init requires a non-empty range, and
        // both issuance and export flip the state the moment it empties.
        let value = record.next;
        record.next += 1;
        if record.next == record.max {
            record.state = SequenceState::Exhausted;
        }
        store.put(&record)?;
        debug!(%drive_id, value, "issued nonce");
        Ok(Nonce::from_u64(value))
    }

    /// Permanently stops issuance for a drive on this device. Terminal;
    /// values already issued stay spent.
    pub fn revoke_sequence(&self, drive_id: &DriveId, auth_id: &AuthorizationId) -> Result<()> {
        let store = self.store.lock();
        let mut record = get_owned(&store, drive_id, auth_id)?;
        if record.state == SequenceState::Revoked {
            return Err(SequenceError::Revoked {
                drive_id: drive_id.clone(),
            }
            .into());
        }
        record.state = SequenceState::Revoked;
        store.put(&record)?;
        info!(%drive_id, "revoked nonce sequence");
        Ok(())
    }

    /// Carves `count` values off the top of this device's range and returns
    /// them as a grant for another device. The shrunken primary record is
    /// persisted before the grant exists, so even a crash between the two
    /// steps cannot leave the ranges overlapping.
    pub fn export_range(
        &self,
        drive_id: &DriveId,
        auth_id: &AuthorizationId,
        count: u64,
    ) -> Result<AuthorizationGrant> {
        if count == 0 {
            return Err(SequenceError::EmptyRange.into());
        }
        let store = self.store.lock();
        let mut record = get_owned(&store, drive_id, auth_id)?;
        ensure_active(&record)?;
        if record.remaining() < count {
            return Err(RangeExceededError::NonceExhausted {
                drive_id: drive_id.clone(),
            }
            .into());
        }
        let granted_max = record.max;
        record.max -= count;
        if record.next == record.max {
            record.state = SequenceState::Exhausted;
        }
        store.put(&record)?;
        let grant = AuthorizationGrant {
            drive_id: drive_id.clone(),
            auth_id: AuthorizationId::generate().context("failed to generate grant id")?,
            start: record.max,
            max: granted_max,
        };
        info!(%drive_id, start = grant.start, max = grant.max, "exported nonce range");
        Ok(grant)
    }

    /// Adopts an exported range on the receiving device, creating an active
    /// sequence for the drive. A device that already tracks the drive
    /// rejects the grant, so replaying the same token cannot re-arm a spent
    /// range.
    pub fn import_grant(&self, grant: &AuthorizationGrant) -> Result<SequenceRecord> {
        if grant.start >= grant.max {
            return Err(SequenceError::EmptyRange.into());
        }
        let store = self.store.lock();
        if !store.record_grant(grant)? {
            return Err(SequenceError::AlreadyExists {
                drive_id: grant.drive_id.clone(),
            }
            .into());
        }
        let record = SequenceRecord {
            drive_id: grant.drive_id.clone(),
            auth_id: grant.auth_id.clone(),
            state: SequenceState::Active,
            start: grant.start,
            next: grant.start,
            max: grant.max,
        };
        if !store.insert_new(&record)? {
            return Err(SequenceError::AlreadyExists {
                drive_id: grant.drive_id.clone(),
            }
            .into());
        }
        info!(
            drive_id = %record.drive_id,
            start = record.start,
            max = record.max,
            "imported nonce range"
        );
        Ok(record)
    }

    /// Current record for a drive, if this device tracks it.
    pub fn sequence(&self, drive_id: &DriveId) -> Result<Option<SequenceRecord>> {
        self.store.lock().get(drive_id)
    }
}

fn get_owned(
    store: &SequenceStore,
    drive_id: &DriveId,
    auth_id: &AuthorizationId,
) -> Result<SequenceRecord> {
    let record = store.get(drive_id)?.ok_or_else(|| SequenceError::NotFound {
        drive_id: drive_id.clone(),
    })?;
    if record.auth_id != *auth_id {
        return Err(SequenceError::AuthorizationMismatch.into());
    }
    Ok(record)
}

fn ensure_active(record: &SequenceRecord) -> Result<()> {
    match record.state {
        SequenceState::Active => Ok(()),
        SequenceState::Revoked => Err(SequenceError::Revoked {
            drive_id: record.drive_id.clone(),
        }
        .into()),
        SequenceState::Uninitialized => Err(SequenceError::NotActive {
            drive_id: record.drive_id.clone(),
        }
        .into()),
        SequenceState::Exhausted => Err(RangeExceededError::NonceExhausted {
            drive_id: record.drive_id.clone(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequencer(dir: &tempfile::TempDir) -> NonceSequencer {
        NonceSequencer::open(dir.path()).unwrap()
    }

    fn active_sequence(sequencer: &NonceSequencer, max: u64) -> (DriveId, AuthorizationId) {
        let drive_id = DriveId::from("drive-1");
        let auth_id = AuthorizationId::generate().unwrap();
        sequencer
            .create_sequence(drive_id.clone(), auth_id.clone())
            .unwrap();
        sequencer.init_sequence(&drive_id, &auth_id, 0, max).unwrap();
        (drive_id, auth_id)
    }

    fn downcast<T: std::error::Error + Send + Sync + 'static>(err: &anyhow::Error) -> &T {
        err.downcast_ref::<T>().unwrap()
    }

    #[test]
    fn nonces_are_sequential_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let (drive_id, auth_id) = active_sequence(&sequencer, 100);
        for expected in 0..5 {
            let nonce = sequencer.next_nonce(&drive_id, &auth_id).unwrap();
            assert_eq!(nonce.to_u64(), expected);
        }
        let record = sequencer.sequence(&drive_id).unwrap().unwrap();
        assert_eq!(record.next, 5);
        assert_eq!(record.remaining(), 95);
    }

    #[test]
    fn issuance_survives_reopen_without_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let drive_id = DriveId::from("drive-1");
        let auth_id = AuthorizationId::generate().unwrap();
        {
            let sequencer = sequencer(&dir);
            sequencer
                .create_sequence(drive_id.clone(), auth_id.clone())
                .unwrap();
            sequencer.init_sequence(&drive_id, &auth_id, 10, 50).unwrap();
            assert_eq!(sequencer.next_nonce(&drive_id, &auth_id).unwrap().to_u64(), 10);
            assert_eq!(sequencer.next_nonce(&drive_id, &auth_id).unwrap().to_u64(), 11);
        }
        let sequencer = sequencer(&dir);
        assert_eq!(sequencer.next_nonce(&drive_id, &auth_id).unwrap().to_u64(), 12);
    }

    #[test]
    fn uninitialized_sequence_cannot_issue() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let drive_id = DriveId::from("drive-1");
        let auth_id = AuthorizationId::generate().unwrap();
        sequencer
            .create_sequence(drive_id.clone(), auth_id.clone())
            .unwrap();
        let err = sequencer.next_nonce(&drive_id, &auth_id).unwrap_err();
        assert_eq!(
            *downcast::<SequenceError>(&err),
            SequenceError::NotActive {
                drive_id: drive_id.clone(),
            }
        );
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let drive_id = DriveId::from("drive-1");
        sequencer
            .create_sequence(drive_id.clone(), AuthorizationId::generate().unwrap())
            .unwrap();
        let err = sequencer
            .create_sequence(drive_id.clone(), AuthorizationId::generate().unwrap())
            .unwrap_err();
        assert_eq!(
            *downcast::<SequenceError>(&err),
            SequenceError::AlreadyExists { drive_id }
        );
    }

    #[test]
    fn second_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let (drive_id, auth_id) = active_sequence(&sequencer, 100);
        let err = sequencer
            .init_sequence(&drive_id, &auth_id, 200, 300)
            .unwrap_err();
        assert_eq!(
            *downcast::<SequenceError>(&err),
            SequenceError::AlreadyInitialized { drive_id }
        );
    }

    #[test]
    fn wrong_authorization_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let (drive_id, _) = active_sequence(&sequencer, 100);
        let stranger = AuthorizationId::generate().unwrap();
        let err = sequencer.next_nonce(&drive_id, &stranger).unwrap_err();
        assert_eq!(
            *downcast::<SequenceError>(&err),
            SequenceError::AuthorizationMismatch
        );
    }

    #[test]
    fn exhaustion_is_terminal_and_reports_range_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let (drive_id, auth_id) = active_sequence(&sequencer, 2);
        assert_eq!(sequencer.next_nonce(&drive_id, &auth_id).unwrap().to_u64(), 0);
        assert_eq!(sequencer.next_nonce(&drive_id, &auth_id).unwrap().to_u64(), 1);
        let record = sequencer.sequence(&drive_id).unwrap().unwrap();
        assert_eq!(record.state, SequenceState::Exhausted);
        // Every further call distinguishes exhaustion from other refusals.
        for _ in 0..2 {
            let err = sequencer.next_nonce(&drive_id, &auth_id).unwrap_err();
            assert_eq!(
                *downcast::<RangeExceededError>(&err),
                RangeExceededError::NonceExhausted {
                    drive_id: drive_id.clone(),
                }
            );
        }
    }

    #[test]
    fn revocation_stops_issuance() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let (drive_id, auth_id) = active_sequence(&sequencer, 100);
        sequencer.next_nonce(&drive_id, &auth_id).unwrap();
        sequencer.revoke_sequence(&drive_id, &auth_id).unwrap();
        let err = sequencer.next_nonce(&drive_id, &auth_id).unwrap_err();
        assert_eq!(
            *downcast::<SequenceError>(&err),
            SequenceError::Revoked {
                drive_id: drive_id.clone(),
            }
        );
        let err = sequencer.revoke_sequence(&drive_id, &auth_id).unwrap_err();
        assert_eq!(
            *downcast::<SequenceError>(&err),
            SequenceError::Revoked { drive_id }
        );
    }

    #[test]
    fn exported_range_is_disjoint_from_the_primary() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let (drive_id, auth_id) = active_sequence(&sequencer, 100);
        let grant = sequencer.export_range(&drive_id, &auth_id, 30).unwrap();
        assert_eq!(grant.start, 70);
        assert_eq!(grant.max, 100);
        let record = sequencer.sequence(&drive_id).unwrap().unwrap();
        assert_eq!(record.max, 70);
        assert_eq!(record.remaining(), 70);

        // All primary values stay below the granted range.
        for _ in 0..70 {
            let nonce = sequencer.next_nonce(&drive_id, &auth_id).unwrap();
            assert!(nonce.to_u64() < grant.start);
        }
        sequencer.next_nonce(&drive_id, &auth_id).unwrap_err();
    }

    #[test]
    fn export_larger_than_remaining_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let (drive_id, auth_id) = active_sequence(&sequencer, 10);
        sequencer.next_nonce(&drive_id, &auth_id).unwrap();
        let err = sequencer.export_range(&drive_id, &auth_id, 10).unwrap_err();
        assert_eq!(
            *downcast::<RangeExceededError>(&err),
            RangeExceededError::NonceExhausted { drive_id }
        );
    }

    #[test]
    fn grant_handoff_issues_from_the_granted_range() {
        let primary_dir = tempfile::tempdir().unwrap();
        let secondary_dir = tempfile::tempdir().unwrap();
        let primary = sequencer(&primary_dir);
        let secondary = sequencer(&secondary_dir);

        let (drive_id, auth_id) = active_sequence(&primary, 1000);
        let grant = primary.export_range(&drive_id, &auth_id, 100).unwrap();
        let token = grant.to_token().unwrap();

        let received = AuthorizationGrant::from_token(&token).unwrap();
        let record = secondary.import_grant(&received).unwrap();
        assert_eq!(record.state, SequenceState::Active);
        let nonce = secondary.next_nonce(&drive_id, &received.auth_id).unwrap();
        assert_eq!(nonce.to_u64(), 900);
    }

    #[test]
    fn grant_cannot_be_imported_twice() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let grant = AuthorizationGrant {
            drive_id: "drive-1".into(),
            auth_id: AuthorizationId::generate().unwrap(),
            start: 500,
            max: 600,
        };
        sequencer.import_grant(&grant).unwrap();
        let err = sequencer.import_grant(&grant).unwrap_err();
        assert_eq!(
            *downcast::<SequenceError>(&err),
            SequenceError::AlreadyExists {
                drive_id: grant.drive_id,
            }
        );
    }

    #[test]
    fn empty_exports_and_grants_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = sequencer(&dir);
        let (drive_id, auth_id) = active_sequence(&sequencer, 100);
        let err = sequencer.export_range(&drive_id, &auth_id, 0).unwrap_err();
        assert_eq!(*downcast::<SequenceError>(&err), SequenceError::EmptyRange);

        let grant = AuthorizationGrant {
            drive_id: "drive-2".into(),
            auth_id: AuthorizationId::generate().unwrap(),
            start: 5,
            max: 5,
        };
        let err = sequencer.import_grant(&grant).unwrap_err();
        assert_eq!(*downcast::<SequenceError>(&err), SequenceError::EmptyRange);
    }
}
