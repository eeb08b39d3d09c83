//! Wiring of the capture and sync crates into an application.

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{debug, info, warn};

use capture_scheduler::{CaptureExecutor, CaptureScheduler};
use field_config_data::FieldConfig;
use field_http_session::FieldHttpSession;
use field_types::{HostEvent, RecordId, SyncState};
use record_store::{JsonRecordStore, RecordStore};
use sync_queue::{AlwaysReady, QueueStatus, SyncQueue, TaskClass, TaskOutcome};
use trajectory::{TripSource, TripTracker};

pub mod replay;
pub mod sim;

/// How long to wait for captures still in flight after a session ends.
const SETTLE_QUIET: Duration = Duration::from_millis(500);

/// Poll period while waiting for the sync queue to settle.
const SYNC_POLL: Duration = Duration::from_millis(500);

/// The on-disk state shared by all commands.
pub struct Storage {
    pub store: Arc<JsonRecordStore>,
    pub queue: SyncQueue,
}

/// Open the record store and sync queue in the configured data directory.
pub fn open_storage(cfg: &FieldConfig) -> Result<Storage> {
    let records_dir = cfg.storage.records_dir();
    let store = Arc::new(
        JsonRecordStore::open(&records_dir)
            .wrap_err_with(|| format!("opening record store in {}", records_dir.display()))?,
    );
    let remote = Arc::new(
        FieldHttpSession::new(&cfg.remote.base_url)
            .wrap_err_with(|| format!("remote URL \"{}\"", cfg.remote.base_url))?,
    );
    let queue = SyncQueue::open(
        cfg.storage.sync_dir(),
        cfg.sync.clone(),
        store.clone(),
        remote,
        Arc::new(AlwaysReady),
    )
    .wrap_err("opening sync queue")?;
    Ok(Storage { store, queue })
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub track: PathBuf,
    pub task_id: String,
    /// Replay speed relative to the recorded timestamps.
    pub speedup: f64,
    /// Baseline mark saved by a previous session.
    pub resume_from: Option<f64>,
    /// Run the sync workers alongside the session.
    pub background_sync: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub samples: usize,
    pub captures_saved: usize,
    pub captures_failed: usize,
    pub final_mark: Option<f64>,
}

impl SessionSummary {
    fn on_event(&mut self, ev: HostEvent) {
        match ev {
            HostEvent::CaptureSaved { path } => {
                self.captures_saved += 1;
                info!("captured {}", path.display());
            }
            HostEvent::RoughnessComputed(r) => {
                info!(
                    "roughness {:.2} over {:.1} m at {:.1} km/h",
                    r.index, r.segment_length_m, r.avg_speed_kmh
                );
            }
            HostEvent::CaptureFailed { message } => {
                self.captures_failed += 1;
                warn!("capture failed: {message}");
            }
        }
    }
}

/// Replay a recorded track through a capture session.
///
/// The session ends at the end of the track or when `shutdown` completes.
pub async fn run_session<F>(
    cfg: &FieldConfig,
    opts: RunOptions,
    shutdown: F,
) -> Result<SessionSummary>
where
    F: Future<Output = ()>,
{
    let samples = replay::read_track(&opts.track)?;
    let storage = open_storage(cfg)?;

    let (trigger, tripwire) = stream_cancel::Tripwire::new();
    let lanes = if opts.background_sync {
        storage.queue.spawn_workers(tripwire.clone())?
    } else {
        Vec::new()
    };

    let tracker = TripTracker::new(&cfg.smoother);
    let (pos_tx, pos_rx) = watch::channel(None);
    let follow = tokio::spawn(tracker.clone().follow(pos_rx, tripwire.clone()));
    let (stop_replay, replay_quit) = stream_cancel::Tripwire::new();
    let mut replay = tokio::spawn(replay::replay(samples, opts.speedup, pos_tx, replay_quit));

    let camera = sim::SimulatedCamera::new(cfg.storage.media_dir())
        .wrap_err("creating media directory")?;
    let executor = Arc::new(CaptureExecutor::new(
        Arc::new(sim::NoRoughness),
        Arc::new(camera),
        Arc::new(sim::OfflineGeocoder),
        storage.store.clone(),
        Arc::new(storage.queue.clone()),
    ));
    let trip: Arc<dyn TripSource> = Arc::new(tracker.clone());
    let mut scheduler = CaptureScheduler::new(cfg.scheduler.clone(), trip, executor);
    let mut events = scheduler.subscribe();
    if let Some(mark) = opts.resume_from {
        scheduler.resume_from(mark);
    }
    scheduler.start(&opts.task_id)?;

    let mut summary = SessionSummary::default();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted");
                drop(stop_replay);
                summary.samples = (&mut replay).await?;
                break;
            }
            sent = &mut replay => {
                summary.samples = sent?;
                info!("end of track after {} samples", summary.samples);
                break;
            }
            ev = events.recv() => match ev {
                Ok(ev) => summary.on_event(ev),
                Err(RecvError::Lagged(n)) => warn!("missed {n} host events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(distance) = tracker.snapshot().map(|s| s.distance_m) {
        info!("trip distance {distance:.1} m");
    }
    summary.final_mark = scheduler.stop().await;

    // collect the outcome of captures still in flight
    while let Ok(Ok(ev)) = tokio::time::timeout(SETTLE_QUIET, events.recv()).await {
        summary.on_event(ev);
    }

    drop(trigger);
    for jh in lanes {
        jh.await?;
    }
    follow.await?;
    Ok(summary)
}

/// Upload pending records and wait until the queue has nothing left to do
/// (apart from tasks waiting out a backoff) or `shutdown` completes.
pub async fn sync_now<F>(cfg: &FieldConfig, shutdown: F) -> Result<QueueStatus>
where
    F: Future<Output = ()>,
{
    let storage = open_storage(cfg)?;
    storage.queue.schedule_upload()?;
    let (trigger, tripwire) = stream_cancel::Tripwire::new();
    let lanes = storage.queue.spawn_workers(tripwire)?;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
            _ = tokio::time::sleep(SYNC_POLL) => {}
        }
        let status = storage.queue.status();
        if status.is_settled() {
            break;
        }
        debug!("waiting for {} task(s)", status.tasks.len());
    }

    drop(trigger);
    for jh in lanes {
        jh.await?;
    }
    Ok(storage.queue.status())
}

/// Mark a record as deleted and try to delete it remotely right away.
pub async fn soft_delete(cfg: &FieldConfig, id: &RecordId) -> Result<Option<TaskOutcome>> {
    let storage = open_storage(cfg)?;
    let queued = storage
        .queue
        .soft_delete(id)
        .wrap_err_with(|| format!("deleting record {id}"))?;
    if queued.is_none() {
        info!("record {id} was already deleted");
        return Ok(None);
    }
    Ok(storage.queue.run_next(TaskClass::Delete).await?)
}

/// Record counts per sync state and the queued tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub records: Vec<(SyncState, usize)>,
    pub queue: QueueStatus,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "records:")?;
        for (state, n) in self.records.iter() {
            writeln!(f, "  {:<15} {n}", state.as_str())?;
        }
        writeln!(f, "sync tasks:")?;
        if self.queue.tasks.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for task in self.queue.tasks.iter() {
            write!(
                f,
                "  #{:<5} {:<8} attempts {:<3} next {}",
                task.seq,
                task.class.key(),
                task.attempts,
                task.next_eligible.to_rfc3339()
            )?;
            if let Some(payload) = &task.payload {
                write!(f, " ({payload})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

pub fn status(cfg: &FieldConfig) -> Result<StatusReport> {
    let storage = open_storage(cfg)?;
    let all = storage.store.list()?;
    let records = [
        SyncState::Pending,
        SyncState::Synced,
        SyncState::PendingDelete,
        SyncState::Deleted,
    ]
    .into_iter()
    .map(|state| (state, all.iter().filter(|r| r.sync_state == state).count()))
    .collect();
    Ok(StatusReport {
        records,
        queue: storage.queue.status(),
    })
}
