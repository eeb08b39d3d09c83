//! Durable background synchronization of inspection records.
//!
//! Work is recorded in a [TaskTable] which survives restarts. Each
//! [TaskClass] is drained by its own worker lane so that, for example,
//! deletions are never stuck behind a long backoff of the upload task.
//!
//! | class   | policy    | on failure                                  |
//! |---------|-----------|---------------------------------------------|
//! | Upload  | coalesce  | exponential backoff, unbounded attempts     |
//! | Delete  | append    | exponential backoff, unbounded attempts     |
//! | Cleanup | singleton | next period                                 |

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use field_config_data::SyncConfig;
use field_types::RecordId;
use record_store::RecordStore;

mod protocol;
mod table;
mod task;

pub use protocol::{
    AlwaysReady, DeleteResponse, DeviceConditions, RemoteError, RemoteSync, TaskOutcome,
    UploadResponse, cleanup, delete_pending, upload_pending,
};
pub use table::{EnqueueOutcome, TASKS_JSON_FNAME, TaskTable};
pub use task::{Backoff, SyncTask, TaskClass, UniquenessPolicy};

/// Pause of a lane after it failed to update the task table.
const TABLE_ERROR_PAUSE: Duration = Duration::from_secs(10);

/// Pause of a lane whose head task is being run by another caller.
const BUSY_RECHECK: Duration = Duration::from_secs(1);

/// Maximum sleep of an idle lane between checks of the table.
const IDLE_RECHECK: Duration = Duration::from_secs(3600);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    RecordStore {
        #[from]
        source: record_store::Error,
    },
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unknown sync task {0}")]
    UnknownTask(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// `now + d`, saturating at the end of time.
pub(crate) fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A snapshot of the task table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub tasks: Vec<SyncTask>,
}

impl QueueStatus {
    pub fn count(&self, class: TaskClass) -> usize {
        self.tasks.iter().filter(|t| t.class == class).count()
    }

    /// `true` if no upload or delete work is left other than tasks waiting
    /// out a backoff after a failure.
    pub fn is_settled(&self) -> bool {
        self.tasks
            .iter()
            .filter(|t| t.class != TaskClass::Cleanup)
            .all(|t| !t.running && t.attempts > 0)
    }
}

struct Shared {
    table: Mutex<TaskTable>,
    wake: [Notify; 3],
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteSync>,
    conditions: Arc<dyn DeviceConditions>,
    cfg: SyncConfig,
}

/// Handle to the sync queue. Cloning gives another handle to the same queue.
#[derive(Clone)]
pub struct SyncQueue {
    shared: Arc<Shared>,
}

impl SyncQueue {
    pub fn new(
        table: TaskTable,
        cfg: SyncConfig,
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteSync>,
        conditions: Arc<dyn DeviceConditions>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(table),
                wake: [Notify::new(), Notify::new(), Notify::new()],
                store,
                remote,
                conditions,
                cfg,
            }),
        }
    }

    /// Open the persisted task table in `dirname`.
    pub fn open<P: AsRef<Path>>(
        dirname: P,
        cfg: SyncConfig,
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteSync>,
        conditions: Arc<dyn DeviceConditions>,
    ) -> Result<Self> {
        let table = TaskTable::open(dirname)?;
        Ok(Self::new(table, cfg, store, remote, conditions))
    }

    fn enqueue(
        &self,
        class: TaskClass,
        payload: Option<String>,
        not_before: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let outcome = self
            .shared
            .table
            .lock()
            .enqueue(class, payload, not_before)?;
        if let EnqueueOutcome::Enqueued(_) = outcome {
            self.shared.wake[class.index()].notify_one();
        }
        Ok(outcome)
    }

    /// Request an upload of all pending records.
    pub fn schedule_upload(&self) -> Result<EnqueueOutcome> {
        self.enqueue(TaskClass::Upload, None, Utc::now())
    }

    /// Mark `id` for deletion and queue the remote deletion.
    ///
    /// Returns `None` if the record was already deleted or marked for
    /// deletion.
    pub fn soft_delete(&self, id: &RecordId) -> Result<Option<EnqueueOutcome>> {
        let now = Utc::now();
        if !self.shared.store.mark_pending_delete(id, now)? {
            debug!("record {id} already deleted");
            return Ok(None);
        }
        info!("record {id} marked for deletion");
        let outcome = self.enqueue(TaskClass::Delete, Some(id.to_string()), now)?;
        Ok(Some(outcome))
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            tasks: self.shared.table.lock().tasks().to_vec(),
        }
    }

    /// Make sure the table reflects the state of the record store: the
    /// recurring cleanup exists and leftover pending work has a task.
    pub fn prepare(&self) -> Result<()> {
        let now = Utc::now();
        self.enqueue(TaskClass::Cleanup, None, now)?;
        if !self.shared.store.pending_upload()?.is_empty() {
            self.schedule_upload()?;
        }
        let has_delete = self.shared.table.lock().count(TaskClass::Delete) > 0;
        if !has_delete && !self.shared.store.pending_delete_tasks()?.is_empty() {
            self.enqueue(TaskClass::Delete, None, now)?;
        }
        Ok(())
    }

    /// Start one worker lane per task class.
    pub fn spawn_workers(
        &self,
        quit: stream_cancel::Tripwire,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        self.prepare()?;
        Ok(TaskClass::ALL
            .into_iter()
            .map(|class| tokio::spawn(self.clone().run_lane(class, quit.clone())))
            .collect())
    }

    fn backoff(&self, class: TaskClass) -> Backoff {
        let cfg = &self.shared.cfg;
        let base = match class {
            TaskClass::Delete => cfg.delete_base_backoff(),
            TaskClass::Upload | TaskClass::Cleanup => cfg.upload_base_backoff(),
        };
        Backoff::new(base, cfg.max_backoff())
    }

    /// Run the oldest task of `class` if it is eligible now.
    ///
    /// Returns `None` if there was nothing to do.
    pub async fn run_next(&self, class: TaskClass) -> Result<Option<TaskOutcome>> {
        let seq = {
            let mut table = self.shared.table.lock();
            let head = table
                .head(class)
                .map(|t| (t.seq, t.next_eligible, t.running));
            match head {
                Some((seq, at, false)) if at <= Utc::now() => {
                    table.mark_running(seq)?;
                    seq
                }
                _ => return Ok(None),
            }
        };

        let shared = &self.shared;
        debug!("running {class} task {seq}");
        let outcome = match class {
            TaskClass::Upload => upload_pending(&*shared.store, &*shared.remote).await,
            TaskClass::Delete => {
                delete_pending(&*shared.store, &*shared.remote, &shared.cfg.inspector_id).await
            }
            TaskClass::Cleanup => cleanup(
                &*shared.store,
                &*shared.conditions,
                TimeDelta::days(shared.cfg.retention_days.into()),
                Utc::now(),
            ),
        };

        let now = Utc::now();
        let mut table = shared.table.lock();
        match (class, &outcome) {
            (TaskClass::Cleanup, TaskOutcome::Deferred) => {
                table.reschedule(seq, after(now, shared.cfg.constraint_recheck()))?;
            }
            (TaskClass::Cleanup, result) => {
                if let TaskOutcome::Retry(msg) = result {
                    warn!("cleanup failed: {msg}");
                }
                table.reschedule(seq, after(now, shared.cfg.cleanup_period()))?;
            }
            (_, TaskOutcome::Success) => {
                table.complete(seq)?;
                debug!("{class} task {seq} done");
            }
            (_, TaskOutcome::Retry(msg)) => {
                let at = table.retry(seq, &self.backoff(class), now)?;
                warn!("{class} task {seq} failed ({msg}), next attempt at {at}");
            }
            (_, TaskOutcome::Deferred) => {
                table.reschedule(seq, now)?;
            }
        }
        Ok(Some(outcome))
    }

    /// Drain tasks of `class` until `quit` fires.
    pub async fn run_lane(self, class: TaskClass, quit: stream_cancel::Tripwire) {
        tokio::pin!(quit);
        let wake = &self.shared.wake[class.index()];
        loop {
            if (&mut quit).now_or_never().is_some() {
                break;
            }
            let head = self
                .shared
                .table
                .lock()
                .head(class)
                .map(|t| t.next_eligible);
            let wait = match head {
                Some(at) => {
                    let now = Utc::now();
                    if at <= now {
                        match self.run_next(class).await {
                            Ok(Some(_)) => continue,
                            // running elsewhere
                            Ok(None) => BUSY_RECHECK,
                            Err(e) => {
                                error!("{class} lane: {e}");
                                TABLE_ERROR_PAUSE
                            }
                        }
                    } else {
                        (at - now).to_std().unwrap_or_default()
                    }
                }
                None => IDLE_RECHECK,
            };
            tokio::select! {
                _ = &mut quit => break,
                _ = wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("{class} lane stopped");
    }
}
