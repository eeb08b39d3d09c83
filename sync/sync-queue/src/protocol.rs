use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use field_types::{InspectionRecord, RecordId};
use record_store::RecordStore;

/// Reply of the remote service to an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
}

/// Reply of the remote service to a delete request.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteResponse {
    pub is_success: bool,
    pub status_code: u16,
    pub message: String,
}

impl DeleteResponse {
    /// Whether the record can be considered gone remotely. A record the
    /// remote does not know (404) is as deleted as one it just removed.
    pub fn is_terminal_success(&self) -> bool {
        self.is_success || self.status_code == 404
    }
}

/// Failure to reach the remote service at all.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("remote unavailable: {0}")]
pub struct RemoteError(pub String);

/// The remote service records are synchronized with.
pub trait RemoteSync: Send + Sync + 'static {
    fn upload_record<'a>(
        &'a self,
        record: &'a InspectionRecord,
    ) -> BoxFuture<'a, Result<UploadResponse, RemoteError>>;

    fn delete_record<'a>(
        &'a self,
        record_id: &'a RecordId,
        inspector_id: &'a str,
    ) -> BoxFuture<'a, Result<DeleteResponse, RemoteError>>;
}

/// Device state gating housekeeping work.
pub trait DeviceConditions: Send + Sync + 'static {
    fn battery_not_low(&self) -> bool;
    fn storage_not_low(&self) -> bool;

    fn all_met(&self) -> bool {
        self.battery_not_low() && self.storage_not_low()
    }
}

/// Conditions which are always satisfied.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl DeviceConditions for AlwaysReady {
    fn battery_not_low(&self) -> bool {
        true
    }
    fn storage_not_low(&self) -> bool {
        true
    }
}

/// Result of one run of a sync protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success,
    /// Something failed; the task should run again after its backoff.
    Retry(String),
    /// Preconditions were not met; try again later without counting a run.
    Deferred,
}

/// Upload every pending record. Records captured while the run is in
/// progress are picked up before returning.
pub async fn upload_pending(store: &dyn RecordStore, remote: &dyn RemoteSync) -> TaskOutcome {
    let mut attempted = BTreeSet::new();
    let mut failures = 0usize;
    let mut uploaded = 0usize;
    loop {
        let pending = match store.pending_upload() {
            Ok(pending) => pending,
            Err(e) => return TaskOutcome::Retry(format!("reading pending records: {e}")),
        };
        let untried: Vec<_> = pending
            .into_iter()
            .filter(|r| !attempted.contains(&r.id))
            .collect();
        if untried.is_empty() {
            break;
        }
        for record in untried {
            attempted.insert(record.id.clone());
            match remote.upload_record(&record).await {
                Ok(resp) if resp.success => match store.mark_synced(&record.id, Utc::now()) {
                    Ok(true) => uploaded += 1,
                    Ok(false) => debug!("record {} changed state during upload", record.id),
                    Err(e) => {
                        warn!("could not mark record {} synced: {e}", record.id);
                        failures += 1;
                    }
                },
                Ok(resp) => {
                    warn!("upload of {} rejected: {}", record.id, resp.message);
                    failures += 1;
                }
                Err(e) => {
                    warn!("upload of {} failed: {e}", record.id);
                    failures += 1;
                }
            }
        }
    }
    if uploaded > 0 {
        info!("uploaded {uploaded} record(s)");
    }
    if failures > 0 {
        TaskOutcome::Retry(format!("{failures} upload(s) failed"))
    } else {
        TaskOutcome::Success
    }
}

/// Ask the remote to delete every soft-deleted record and finalize the
/// ones it confirms.
pub async fn delete_pending(
    store: &dyn RecordStore,
    remote: &dyn RemoteSync,
    inspector_id: &str,
) -> TaskOutcome {
    let pending = match store.pending_delete_tasks() {
        Ok(pending) => pending,
        Err(e) => return TaskOutcome::Retry(format!("reading soft-deleted records: {e}")),
    };
    let mut failures = 0usize;
    for record in pending.iter() {
        match remote.delete_record(&record.id, inspector_id).await {
            Ok(resp) if resp.is_terminal_success() => {
                if resp.status_code == 404 {
                    debug!("record {} unknown to remote, finalizing", record.id);
                }
                if let Err(e) = store.finalize_deletion(&record.id, Utc::now()) {
                    warn!("could not finalize deletion of {}: {e}", record.id);
                    failures += 1;
                }
            }
            Ok(resp) => {
                warn!(
                    "delete of {} failed with status {}: {}",
                    record.id, resp.status_code, resp.message
                );
                failures += 1;
            }
            Err(e) => {
                warn!("delete of {} failed: {e}", record.id);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        TaskOutcome::Retry(format!("{failures} of {} deletion(s) failed", pending.len()))
    } else {
        TaskOutcome::Success
    }
}

/// Purge expired local data if the device allows it.
pub fn cleanup(
    store: &dyn RecordStore,
    conditions: &dyn DeviceConditions,
    retention: TimeDelta,
    now: DateTime<Utc>,
) -> TaskOutcome {
    if !conditions.all_met() {
        debug!("device conditions not met, deferring cleanup");
        return TaskOutcome::Deferred;
    }
    match store.purge_expired(retention, now) {
        Ok(count) => {
            debug!("cleanup purged {count} record(s)");
            TaskOutcome::Success
        }
        Err(e) => TaskOutcome::Retry(format!("purge failed: {e}")),
    }
}
