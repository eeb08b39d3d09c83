//! Local persistence of [InspectionRecord]s and their media.
//!
//! [RecordStore] is the contract the capture executor and the sync tasks
//! depend on. [JsonRecordStore] implements it on top of a single JSON file
//! which is rewritten atomically after each change.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use field_types::{InspectionRecord, RecordId, SyncState};

mod persist;
pub use persist::{DirLock, LOCK_FNAME, lock_dir, read_json, write_json_atomic};

/// The name of the file holding all records within the store directory.
pub const RECORDS_JSON_FNAME: &str = "records.json";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{path} is in use by another process")]
    InUse { path: PathBuf },
    #[error("record {0} already exists")]
    DuplicateRecord(RecordId),
    #[error("unknown record {0}")]
    UnknownRecord(RecordId),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Persistence operations needed by capture and synchronization.
///
/// Sync state transitions are conditional on the prior state so that
/// concurrent actors cannot overwrite each other's transitions.
pub trait RecordStore: Send + Sync + 'static {
    fn save_record(&self, record: &InspectionRecord) -> Result<()>;
    fn get(&self, id: &RecordId) -> Result<Option<InspectionRecord>>;
    fn list(&self) -> Result<Vec<InspectionRecord>>;
    /// All records in [SyncState::Pending], oldest capture first.
    fn pending_upload(&self) -> Result<Vec<InspectionRecord>>;
    /// `Pending` → `Synced`. Returns `false` if the record is no longer
    /// pending (e.g. the user deleted it meanwhile).
    fn mark_synced(&self, id: &RecordId, now: DateTime<Utc>) -> Result<bool>;
    /// Soft delete. Returns `false` if the record was already deleted.
    fn mark_pending_delete(&self, id: &RecordId, now: DateTime<Utc>) -> Result<bool>;
    /// All records in [SyncState::PendingDelete].
    fn pending_delete_tasks(&self) -> Result<Vec<InspectionRecord>>;
    /// `PendingDelete` → `Deleted` after the remote confirmed.
    fn finalize_deletion(&self, id: &RecordId, now: DateTime<Utc>) -> Result<bool>;
    /// Remove the media of `Synced` and `Deleted` records captured before
    /// `now - retention`. Deleted records are dropped entirely. Returns the
    /// number of records purged.
    fn purge_expired(&self, retention: TimeDelta, now: DateTime<Utc>) -> Result<usize>;
}

/// A [RecordStore] persisted as one JSON document.
///
/// The directory is locked while the store is open, so at most one handle
/// rewrites the document.
pub struct JsonRecordStore {
    path: PathBuf,
    records: Mutex<BTreeMap<RecordId, InspectionRecord>>,
    _lock: DirLock,
}

impl JsonRecordStore {
    /// Open the store in `dirname`, creating it if needed.
    pub fn open<P: AsRef<Path>>(dirname: P) -> Result<Self> {
        let dirname = dirname.as_ref();
        std::fs::create_dir_all(dirname).map_err(|source| Error::Io {
            path: dirname.into(),
            source,
        })?;
        let lock = lock_dir(dirname)?;
        let path = dirname.join(RECORDS_JSON_FNAME);
        let records: Vec<InspectionRecord> = read_json(&path)?.unwrap_or_default();
        info!("opened {} with {} records", path.display(), records.len());
        let records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Ok(Self {
            path,
            records: Mutex::new(records),
            _lock: lock,
        })
    }

    fn flush(&self, records: &BTreeMap<RecordId, InspectionRecord>) -> Result<()> {
        let rows: Vec<&InspectionRecord> = records.values().collect();
        write_json_atomic(&self.path, &rows)
    }

    /// Apply `f` to record `id` and persist if it reports a change.
    fn transition<F>(&self, id: &RecordId, f: F) -> Result<bool>
    where
        F: FnOnce(&mut InspectionRecord) -> bool,
    {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::UnknownRecord(id.clone()))?;
        let mut changed = record.clone();
        if !f(&mut changed) {
            return Ok(false);
        }
        let orig = std::mem::replace(record, changed);
        if let Err(e) = self.flush(&records) {
            // keep memory consistent with disk
            records.insert(id.clone(), orig);
            return Err(e);
        }
        Ok(true)
    }

    fn with_state(&self, state: SyncState) -> Vec<InspectionRecord> {
        let mut rows: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| r.sync_state == state)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.capture_timestamp);
        rows
    }
}

fn remove_media(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed media {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove media {}: {e}", path.display()),
    }
}

impl RecordStore for JsonRecordStore {
    fn save_record(&self, record: &InspectionRecord) -> Result<()> {
        let mut records = self.records.lock();
        if records.contains_key(&record.id) {
            return Err(Error::DuplicateRecord(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        if let Err(e) = self.flush(&records) {
            records.remove(&record.id);
            return Err(e);
        }
        debug!("saved record {}", record.id);
        Ok(())
    }

    fn get(&self, id: &RecordId) -> Result<Option<InspectionRecord>> {
        Ok(self.records.lock().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<InspectionRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn pending_upload(&self) -> Result<Vec<InspectionRecord>> {
        Ok(self.with_state(SyncState::Pending))
    }

    fn mark_synced(&self, id: &RecordId, now: DateTime<Utc>) -> Result<bool> {
        self.transition(id, |r| {
            if r.sync_state != SyncState::Pending {
                return false;
            }
            r.sync_state = SyncState::Synced;
            r.state_changed_at = now;
            true
        })
    }

    fn mark_pending_delete(&self, id: &RecordId, now: DateTime<Utc>) -> Result<bool> {
        self.transition(id, |r| match r.sync_state {
            SyncState::Deleted | SyncState::PendingDelete => false,
            SyncState::Pending | SyncState::Synced => {
                r.sync_state = SyncState::PendingDelete;
                r.state_changed_at = now;
                true
            }
        })
    }

    fn pending_delete_tasks(&self) -> Result<Vec<InspectionRecord>> {
        Ok(self.with_state(SyncState::PendingDelete))
    }

    fn finalize_deletion(&self, id: &RecordId, now: DateTime<Utc>) -> Result<bool> {
        self.transition(id, |r| {
            if r.sync_state != SyncState::PendingDelete {
                return false;
            }
            r.sync_state = SyncState::Deleted;
            r.state_changed_at = now;
            true
        })
    }

    fn purge_expired(&self, retention: TimeDelta, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - retention;
        let mut records = self.records.lock();
        let orig = records.clone();

        let mut count = 0;
        let mut media = Vec::new();
        records.retain(|_id, r| {
            if r.capture_timestamp >= cutoff {
                return true;
            }
            match r.sync_state {
                SyncState::Deleted => {
                    if !r.media_purged {
                        media.push(r.local_media_path.clone());
                    }
                    count += 1;
                    false
                }
                SyncState::Synced if !r.media_purged => {
                    media.push(r.local_media_path.clone());
                    r.media_purged = true;
                    count += 1;
                    true
                }
                _ => true,
            }
        });

        if count == 0 {
            return Ok(0);
        }
        if let Err(e) = self.flush(&records) {
            *records = orig;
            return Err(e);
        }
        drop(records);

        // The index no longer refers to these files, so removal failures
        // leave only orphans behind.
        for path in media.iter() {
            remove_media(path);
        }
        info!("purged {count} expired records");
        Ok(count)
    }
}
