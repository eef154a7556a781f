use {
    anyhow::{anyhow, Context as _, Result},
    coffre_protocol::{
        sequence::{AuthorizationGrant, SequenceRecord},
        DriveId,
    },
    std::path::Path,
};

/// Durable backing store for nonce sequence records.
///
/// Records live in their own tree keyed by drive id; imported grants are
/// remembered in a second tree so the same grant token cannot take effect
/// twice. Every mutation is flushed before the caller observes its result.
pub struct SequenceStore {
    db: sled::Db,
    sequences: sled::Tree,
    grants: sled::Tree,
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .context("failed to encode sequence store record")
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("failed to decode sequence store record")?;
    if read != bytes.len() {
        return Err(anyhow!("trailing data in sequence store record"));
    }
    Ok(value)
}

impl SequenceStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            sequences: db.open_tree("sequences")?,
            grants: db.open_tree("grants")?,
            db,
        })
    }

    pub fn get(&self, drive_id: &DriveId) -> Result<Option<SequenceRecord>> {
        if let Some(value) = self.sequences.get(drive_id.as_bytes())? {
            Ok(Some(decode(&value)?))
        } else {
            Ok(None)
        }
    }

    /// Inserts a record only if no record exists for its drive id yet.
    /// Returns false when one already does.
    pub fn insert_new(&self, record: &SequenceRecord) -> Result<bool> {
        let swap = self.sequences.compare_and_swap(
            record.drive_id.as_bytes(),
            None::<&[u8]>,
            Some(encode(record)?),
        )?;
        if swap.is_err() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Overwrites the record for an existing drive id.
    pub fn put(&self, record: &SequenceRecord) -> Result<()> {
        self.sequences
            .insert(record.drive_id.as_bytes(), encode(record)?)?;
        self.flush()?;
        Ok(())
    }

    pub fn all(&self) -> impl Iterator<Item = Result<SequenceRecord>> + '_ {
        self.sequences.iter().map(|pair| decode(&pair?.1))
    }

    /// Records an imported grant, keyed by its authorization id. Returns
    /// false if that grant was already imported on this store.
    pub fn record_grant(&self, grant: &AuthorizationGrant) -> Result<bool> {
        let swap = self.grants.compare_and_swap(
            grant.auth_id.as_str().as_bytes(),
            None::<&[u8]>,
            Some(encode(grant)?),
        )?;
        if swap.is_err() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        coffre_protocol::{sequence::SequenceState, AuthorizationId},
    };

    fn record(drive: &str) -> SequenceRecord {
        SequenceRecord::new(drive.into(), AuthorizationId::generate().unwrap())
    }

    #[test]
    fn put_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SequenceStore::open(dir.path()).unwrap();
        let mut record = record("drive-1");
        assert!(store.insert_new(&record).unwrap());
        record.state = SequenceState::Active;
        record.max = 100;
        store.put(&record).unwrap();
        assert_eq!(store.get(&record.drive_id).unwrap().unwrap(), record);
        assert!(store.get(&"drive-2".into()).unwrap().is_none());
    }

    #[test]
    fn insert_new_refuses_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = SequenceStore::open(dir.path()).unwrap();
        let first = record("drive-1");
        let second = record("drive-1");
        assert!(store.insert_new(&first).unwrap());
        assert!(!store.insert_new(&second).unwrap());
        assert_eq!(store.get(&first.drive_id).unwrap().unwrap(), first);
    }

    #[test]
    fn grants_are_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = SequenceStore::open(dir.path()).unwrap();
        let grant = AuthorizationGrant {
            drive_id: "drive-1".into(),
            auth_id: AuthorizationId::generate().unwrap(),
            start: 10,
            max: 20,
        };
        assert!(store.record_grant(&grant).unwrap());
        assert!(!store.record_grant(&grant).unwrap());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record = record("drive-1");
        {
            let store = SequenceStore::open(dir.path()).unwrap();
            assert!(store.insert_new(&record).unwrap());
        }
        let store = SequenceStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&record.drive_id).unwrap().unwrap(), record);
        assert_eq!(store.all().count(), 1);
    }
}
