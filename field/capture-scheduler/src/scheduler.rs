use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use field_config_data::SchedulerConfig;
use field_types::{CaptureEvent, CaptureTrigger, HostEvent, RecordId, TripSnapshot};
use trajectory::TripSource;

use crate::{CaptureError, CaptureExecutor, SchedulerError};

struct Session {
    task_id: String,
    trigger: stream_cancel::Trigger,
    mark: watch::Receiver<f64>,
    join: JoinHandle<()>,
}

/// Host-facing control of capture sessions.
///
/// Idle until [CaptureScheduler::start], then Active until
/// [CaptureScheduler::stop].
pub struct CaptureScheduler {
    cfg: SchedulerConfig,
    trip: Arc<dyn TripSource>,
    executor: Arc<CaptureExecutor>,
    resume_mark: Option<f64>,
    session: Option<Session>,
}

impl CaptureScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        trip: Arc<dyn TripSource>,
        executor: Arc<CaptureExecutor>,
    ) -> Self {
        Self {
            cfg,
            trip,
            executor,
            resume_mark: None,
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Receive [HostEvent]s of all sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.executor.subscribe()
    }

    /// Use `mark` as the baseline of the next session instead of the current
    /// odometer reading.
    pub fn resume_from(&mut self, mark: f64) {
        self.resume_mark = Some(mark);
    }

    /// Begin a capture session. Must be called within a tokio runtime.
    pub fn start(&mut self, task_id: &str) -> Result<(), SchedulerError> {
        if self.session.is_some() {
            return Err(SchedulerError::AlreadyActive);
        }
        let current = self.trip.snapshot().map(|s| s.distance_m).unwrap_or(0.0);
        let mark = match self.resume_mark.take() {
            Some(prior) if current < prior => {
                warn!(
                    "odometer at {current:.1} m is behind the saved mark {prior:.1} m, \
                    continuing from the odometer"
                );
                current
            }
            Some(prior) => prior,
            None => current,
        };

        let (mark_tx, mark_rx) = watch::channel(mark);
        let (trigger, tripwire) = stream_cancel::Tripwire::new();
        let control = ControlLoop {
            cfg: self.cfg.clone(),
            trip: self.trip.clone(),
            executor: self.executor.clone(),
            task_id: task_id.to_string(),
            mark,
            mark_tx,
        };
        let join = tokio::spawn(control.run(tripwire));
        info!("capture session \"{task_id}\" started at {mark:.1} m");

        self.session = Some(Session {
            task_id: task_id.to_string(),
            trigger,
            mark: mark_rx,
            join,
        });
        Ok(())
    }

    /// End the session and start a new trip.
    ///
    /// The control loop stops at its next suspension point. Captures already
    /// dispatched still complete. Returns the final mark, `None` if no
    /// session was active.
    pub async fn stop(&mut self) -> Option<f64> {
        let session = self.session.take()?;
        drop(session.trigger);
        if let Err(e) = session.join.await {
            error!("control loop ended abnormally: {e}");
        }
        let last = *session.mark.borrow();
        self.trip.reset();
        info!("capture session \"{}\" stopped at {last:.1} m", session.task_id);
        Some(last)
    }

    /// Capture now, independently of distance. The mark is not affected.
    pub fn manual_capture(
        &self,
    ) -> Result<JoinHandle<Result<RecordId, CaptureError>>, SchedulerError> {
        let session = self.session.as_ref().ok_or(SchedulerError::NotActive)?;
        let snap = self
            .trip
            .snapshot()
            .ok_or(SchedulerError::SensorUnavailable)?;
        let event = CaptureEvent {
            trigger: CaptureTrigger::Manual,
            segment_length_m: 0.0,
            speed_mps: snap.speed_mps,
            fired_at: Utc::now(),
            lat: snap.position.lat,
            lon: snap.position.lon,
        };
        Ok(self.executor.fire(&session.task_id, event))
    }

    /// Odometer reading at the most recent automatic capture (or at the
    /// session start).
    pub fn baseline_mark(&self) -> Option<f64> {
        self.session.as_ref().map(|s| *s.mark.borrow())
    }

    /// Follow changes of the baseline mark.
    pub fn watch_mark(&self) -> Option<watch::Receiver<f64>> {
        self.session.as_ref().map(|s| s.mark.clone())
    }
}

/// Sleep for `dur`. Returns `false` if `quit` fired first.
async fn sleep_or_quit<F: Future + Unpin>(dur: Duration, quit: &mut F) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => true,
        _ = quit => false,
    }
}

/// The per-session loop. Sole writer of the mark.
struct ControlLoop {
    cfg: SchedulerConfig,
    trip: Arc<dyn TripSource>,
    executor: Arc<CaptureExecutor>,
    task_id: String,
    mark: f64,
    mark_tx: watch::Sender<f64>,
}

impl ControlLoop {
    async fn run(mut self, quit: stream_cancel::Tripwire) {
        tokio::pin!(quit);
        let interval = self.cfg.interval_meters;
        let mut without_fix = 0u64;
        loop {
            let wait = match self.trip.snapshot() {
                None => {
                    if without_fix == 0 {
                        warn!("no position fix, waiting");
                    }
                    without_fix += 1;
                    self.cfg.poll_period()
                }
                Some(snap) => {
                    if without_fix > 0 {
                        info!("position fix acquired");
                        without_fix = 0;
                    }
                    if snap.speed_mps > self.cfg.high_speed_threshold_mps {
                        // predicted, not confirmed by the odometer
                        let floor = self.cfg.safety_floor();
                        let wait = Duration::try_from_secs_f64(interval / snap.speed_mps)
                            .unwrap_or(floor)
                            .max(floor);
                        if !sleep_or_quit(wait, &mut quit).await {
                            break;
                        }
                        self.advance(self.mark + interval);
                        let latest = self.trip.snapshot().unwrap_or(snap);
                        self.fire(interval, &latest);
                        continue;
                    }
                    let delta = snap.distance_m - self.mark;
                    if delta >= interval {
                        self.advance(snap.distance_m);
                        self.fire(delta, &snap);
                    }
                    self.cfg.poll_period()
                }
            };
            if !sleep_or_quit(wait, &mut quit).await {
                break;
            }
        }
    }

    fn advance(&mut self, mark: f64) {
        self.mark = mark;
        self.mark_tx.send_replace(mark);
    }

    fn fire(&self, segment_length_m: f64, snap: &TripSnapshot) {
        let event = CaptureEvent {
            trigger: CaptureTrigger::Auto,
            segment_length_m,
            speed_mps: snap.speed_mps,
            fired_at: Utc::now(),
            lat: snap.position.lat,
            lon: snap.position.lon,
        };
        // completion is reported through host events
        drop(self.executor.fire(&self.task_id, event));
    }
}
