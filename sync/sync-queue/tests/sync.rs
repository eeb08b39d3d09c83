use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use test_log::test;

use field_config_data::SyncConfig;
use field_types::{CaptureTrigger, InspectionRecord, RecordId, SyncState};
use record_store::{JsonRecordStore, RecordStore};
use sync_queue::{
    AlwaysReady, Backoff, DeleteResponse, DeviceConditions, EnqueueOutcome, RemoteError,
    RemoteSync, SyncQueue, TaskClass, TaskOutcome, TaskTable, UploadResponse, delete_pending,
    upload_pending,
};

#[derive(Default)]
struct FakeRemote {
    delete_status: Mutex<HashMap<RecordId, u16>>,
    failing_uploads: Mutex<Vec<RecordId>>,
    uploads: Mutex<Vec<RecordId>>,
}

impl RemoteSync for FakeRemote {
    fn upload_record<'a>(
        &'a self,
        record: &'a InspectionRecord,
    ) -> BoxFuture<'a, Result<UploadResponse, RemoteError>> {
        Box::pin(async move {
            self.uploads.lock().push(record.id.clone());
            if self.failing_uploads.lock().contains(&record.id) {
                return Err(RemoteError("connection refused".into()));
            }
            Ok(UploadResponse {
                success: true,
                message: "ok".into(),
            })
        })
    }

    fn delete_record<'a>(
        &'a self,
        record_id: &'a RecordId,
        _inspector_id: &'a str,
    ) -> BoxFuture<'a, Result<DeleteResponse, RemoteError>> {
        Box::pin(async move {
            let status_code = self
                .delete_status
                .lock()
                .get(record_id)
                .copied()
                .unwrap_or(200);
            Ok(DeleteResponse {
                is_success: status_code == 200,
                status_code,
                message: format!("status {status_code}"),
            })
        })
    }
}

struct LowBattery;

impl DeviceConditions for LowBattery {
    fn battery_not_low(&self) -> bool {
        false
    }
    fn storage_not_low(&self) -> bool {
        true
    }
}

fn record(dir: &Path, captured: DateTime<Utc>) -> InspectionRecord {
    let id = RecordId::new_random();
    let local_media_path = dir.join(format!("{id}.jpg"));
    std::fs::write(&local_media_path, b"jpeg").unwrap();
    InspectionRecord {
        id,
        task_id: "task-1".into(),
        local_media_path,
        capture_timestamp: captured,
        lat: 47.0,
        lon: 8.0,
        address: String::new(),
        roughness_index: 1.5,
        segment_length_m: 10.0,
        speed_kmh: 36.0,
        trigger: CaptureTrigger::Auto,
        sync_state: SyncState::Pending,
        state_changed_at: captured,
        media_purged: false,
    }
}

fn state(store: &JsonRecordStore, id: &RecordId) -> SyncState {
    store.get(id).unwrap().unwrap().sync_state
}

struct Fixture {
    _dir: tempfile::TempDir,
    media: std::path::PathBuf,
    store: Arc<JsonRecordStore>,
    remote: Arc<FakeRemote>,
    queue: SyncQueue,
}

fn fixture(conditions: Arc<dyn DeviceConditions>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let media = dir.path().join("media");
    std::fs::create_dir_all(&media).unwrap();
    let store = Arc::new(JsonRecordStore::open(dir.path().join("records")).unwrap());
    let remote = Arc::new(FakeRemote::default());
    let queue = SyncQueue::open(
        dir.path().join("sync"),
        SyncConfig::default(),
        store.clone(),
        remote.clone(),
        conditions,
    )
    .unwrap();
    Fixture {
        _dir: dir,
        media,
        store,
        remote,
        queue,
    }
}

#[test]
fn test_upload_coalescing() {
    let now = Utc::now();
    let mut table = TaskTable::in_memory();
    assert_eq!(
        table.enqueue(TaskClass::Upload, None, now).unwrap(),
        EnqueueOutcome::Enqueued(0)
    );
    assert_eq!(
        table.enqueue(TaskClass::Upload, None, now).unwrap(),
        EnqueueOutcome::Coalesced(0)
    );
    table.mark_running(0).unwrap();
    assert_eq!(
        table.enqueue(TaskClass::Upload, None, now).unwrap(),
        EnqueueOutcome::Coalesced(0)
    );
    assert_eq!(table.count(TaskClass::Upload), 1);

    // once done, a new request creates a new task
    table.complete(0).unwrap();
    assert_eq!(
        table.enqueue(TaskClass::Upload, None, now).unwrap(),
        EnqueueOutcome::Enqueued(1)
    );
}

#[test]
fn test_delete_requests_keep_order() {
    let now = Utc::now();
    let mut table = TaskTable::in_memory();
    for payload in ["a", "b", "c"] {
        let outcome = table
            .enqueue(TaskClass::Delete, Some(payload.into()), now)
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Enqueued(_)));
    }
    // an upload in between does not disturb the delete lane
    table.enqueue(TaskClass::Upload, None, now).unwrap();
    assert_eq!(table.count(TaskClass::Delete), 3);

    let mut seen = Vec::new();
    while let Some(task) = table.head(TaskClass::Delete) {
        seen.push(task.payload.clone().unwrap());
        let seq = task.seq;
        table.complete(seq).unwrap();
    }
    assert_eq!(seen, ["a", "b", "c"]);
}

#[test]
fn test_retry_backoff_in_table() {
    let now = Utc::now();
    let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(25));
    let mut table = TaskTable::in_memory();
    table.enqueue(TaskClass::Delete, None, now).unwrap();

    let expected = [10, 20, 25, 25];
    for secs in expected {
        table.mark_running(0).unwrap();
        let at = table.retry(0, &backoff, now).unwrap();
        assert_eq!(at, now + TimeDelta::seconds(secs));
    }
    let task = table.get(0).unwrap();
    assert_eq!(task.attempts, 4);
    assert!(!task.running);
}

#[test]
fn test_table_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    {
        let mut table = TaskTable::open(dir.path()).unwrap();
        table.enqueue(TaskClass::Upload, None, now).unwrap();
        table
            .enqueue(TaskClass::Delete, Some("x".into()), now)
            .unwrap();
        table.mark_running(0).unwrap();
        table
            .retry(1, &Backoff::new(Duration::from_secs(10), Duration::from_secs(60)), now)
            .unwrap();
    }
    assert!(dir.path().join(sync_queue::TASKS_JSON_FNAME).exists());

    let mut table = TaskTable::open(dir.path()).unwrap();
    assert_eq!(table.tasks().len(), 2);
    // a second writer would drop tasks on its next rewrite
    assert!(matches!(
        TaskTable::open(dir.path()),
        Err(sync_queue::Error::RecordStore {
            source: record_store::Error::InUse { .. }
        })
    ));
    let upload = table.head(TaskClass::Upload).unwrap();
    assert!(!upload.running, "interrupted task is queued again");
    let delete = table.head(TaskClass::Delete).unwrap();
    assert_eq!(delete.attempts, 1);
    assert_eq!(delete.payload.as_deref(), Some("x"));

    assert_eq!(
        table.enqueue(TaskClass::Delete, None, now).unwrap(),
        EnqueueOutcome::Enqueued(2)
    );
}

#[test(tokio::test)]
async fn test_delete_200_404_500() {
    let f = fixture(Arc::new(AlwaysReady));
    let t0 = Utc::now() - TimeDelta::minutes(10);
    let mut ids = Vec::new();
    for (i, status) in [200u16, 404, 500].into_iter().enumerate() {
        let r = record(&f.media, t0 + TimeDelta::seconds(i as i64));
        f.store.save_record(&r).unwrap();
        f.remote.delete_status.lock().insert(r.id.clone(), status);
        assert!(f.store.mark_pending_delete(&r.id, Utc::now()).unwrap());
        ids.push(r.id);
    }

    let outcome = delete_pending(&*f.store, &*f.remote, "inspector").await;
    assert!(matches!(outcome, TaskOutcome::Retry(_)));
    assert_eq!(state(&f.store, &ids[0]), SyncState::Deleted);
    assert_eq!(state(&f.store, &ids[1]), SyncState::Deleted);
    assert_eq!(state(&f.store, &ids[2]), SyncState::PendingDelete);
}

#[test(tokio::test)]
async fn test_soft_delete_retries_with_backoff() {
    let f = fixture(Arc::new(AlwaysReady));
    let r = record(&f.media, Utc::now());
    f.store.save_record(&r).unwrap();
    f.remote.delete_status.lock().insert(r.id.clone(), 500);

    let outcome = f.queue.soft_delete(&r.id).unwrap();
    assert_eq!(outcome, Some(EnqueueOutcome::Enqueued(0)));
    assert_eq!(state(&f.store, &r.id), SyncState::PendingDelete);
    // deleting again is a no-op
    assert_eq!(f.queue.soft_delete(&r.id).unwrap(), None);

    let before = Utc::now();
    let outcome = f.queue.run_next(TaskClass::Delete).await.unwrap();
    assert!(matches!(outcome, Some(TaskOutcome::Retry(_))));

    let status = f.queue.status();
    assert_eq!(status.count(TaskClass::Delete), 1);
    assert!(status.is_settled());
    let task = &status.tasks[0];
    assert_eq!(task.attempts, 1);
    assert!(task.next_eligible >= before + TimeDelta::seconds(10));
    assert!(task.next_eligible <= Utc::now() + TimeDelta::seconds(10));

    // not eligible yet
    assert_eq!(f.queue.run_next(TaskClass::Delete).await.unwrap(), None);
}

#[test(tokio::test)]
async fn test_upload_partial_failure() {
    let f = fixture(Arc::new(AlwaysReady));
    let t0 = Utc::now();
    let records: Vec<_> = (0..3)
        .map(|i| record(&f.media, t0 + TimeDelta::seconds(i)))
        .collect();
    for r in records.iter() {
        f.store.save_record(r).unwrap();
    }
    f.remote.failing_uploads.lock().push(records[1].id.clone());

    let outcome = upload_pending(&*f.store, &*f.remote).await;
    assert!(matches!(outcome, TaskOutcome::Retry(_)));
    assert_eq!(state(&f.store, &records[0].id), SyncState::Synced);
    assert_eq!(state(&f.store, &records[1].id), SyncState::Pending);
    assert_eq!(state(&f.store, &records[2].id), SyncState::Synced);
    // each record is tried once per run
    assert_eq!(f.remote.uploads.lock().len(), 3);

    f.remote.failing_uploads.lock().clear();
    assert_eq!(f.queue.schedule_upload().unwrap(), EnqueueOutcome::Enqueued(0));
    let outcome = f.queue.run_next(TaskClass::Upload).await.unwrap();
    assert_eq!(outcome, Some(TaskOutcome::Success));
    assert_eq!(state(&f.store, &records[1].id), SyncState::Synced);
    assert_eq!(f.queue.status().count(TaskClass::Upload), 0);
}

#[test(tokio::test)]
async fn test_cleanup_gated_on_device() {
    let f = fixture(Arc::new(LowBattery));
    let old = record(&f.media, Utc::now() - TimeDelta::days(3));
    f.store.save_record(&old).unwrap();
    f.store.mark_synced(&old.id, Utc::now()).unwrap();

    f.queue.prepare().unwrap();
    let outcome = f.queue.run_next(TaskClass::Cleanup).await.unwrap();
    assert_eq!(outcome, Some(TaskOutcome::Deferred));
    assert!(old.local_media_path.exists());

    let status = f.queue.status();
    let task = status
        .tasks
        .iter()
        .find(|t| t.class == TaskClass::Cleanup)
        .unwrap();
    assert_eq!(task.attempts, 0);
    let recheck = TimeDelta::seconds(SyncConfig::default().constraint_recheck_secs as i64);
    assert!(task.next_eligible > Utc::now() + recheck - TimeDelta::minutes(1));
}

#[test(tokio::test)]
async fn test_cleanup_purges_expired() {
    let f = fixture(Arc::new(AlwaysReady));
    let old = record(&f.media, Utc::now() - TimeDelta::days(3));
    let fresh = record(&f.media, Utc::now());
    let old_pending = record(&f.media, Utc::now() - TimeDelta::days(3));
    for r in [&old, &fresh, &old_pending] {
        f.store.save_record(r).unwrap();
    }
    f.store.mark_synced(&old.id, Utc::now()).unwrap();
    f.store.mark_synced(&fresh.id, Utc::now()).unwrap();

    f.queue.prepare().unwrap();
    let outcome = f.queue.run_next(TaskClass::Cleanup).await.unwrap();
    assert_eq!(outcome, Some(TaskOutcome::Success));
    assert!(!old.local_media_path.exists());
    assert!(fresh.local_media_path.exists());
    assert!(old_pending.local_media_path.exists());

    // the recurring task stays, scheduled a period later
    let status = f.queue.status();
    assert_eq!(status.count(TaskClass::Cleanup), 1);
    let task = status
        .tasks
        .iter()
        .find(|t| t.class == TaskClass::Cleanup)
        .unwrap();
    assert!(task.next_eligible > Utc::now() + TimeDelta::hours(23));
}

#[test(tokio::test)]
async fn test_lanes_drain_uploads() {
    let f = fixture(Arc::new(AlwaysReady));
    let (trigger, tripwire) = stream_cancel::Tripwire::new();
    let handles = f.queue.spawn_workers(tripwire).unwrap();

    let r = record(&f.media, Utc::now());
    f.store.save_record(&r).unwrap();
    f.queue.schedule_upload().unwrap();

    for _ in 0..200 {
        if state(&f.store, &r.id) == SyncState::Synced {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state(&f.store, &r.id), SyncState::Synced);

    drop(trigger);
    for jh in handles {
        jh.await.unwrap();
    }
}
