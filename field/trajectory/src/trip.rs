use std::sync::Arc;

use nalgebra::Vector2;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use field_config_data::SmootherConfig;
use field_types::{PositionSample, TripSnapshot};

use crate::{DistanceAccumulator, Result, TrajectoryError, TrajectorySmoother};

/// Latest-value access to raw positions.
///
/// Reading never blocks and never consumes: calling `current()` twice
/// without a new fix returns the same sample.
pub trait PositionSource: Send + Sync {
    fn current(&self) -> Option<PositionSample>;
}

impl PositionSource for watch::Receiver<Option<PositionSample>> {
    fn current(&self) -> Option<PositionSample> {
        self.borrow().clone()
    }
}

/// Latest-value access to the trip state, as read by the capture scheduler.
pub trait TripSource: Send + Sync + 'static {
    /// `None` while there is no usable fix.
    fn snapshot(&self) -> Option<TripSnapshot>;
    /// Start a new trip: zero the odometer and forget the filter state.
    fn reset(&self);
}

struct TripState {
    smoother: TrajectorySmoother,
    odometer: DistanceAccumulator,
    latest: Option<TripSnapshot>,
}

/// Feeds raw samples through the smoother into the odometer.
///
/// Cloning gives another handle to the same trip.
#[derive(Clone)]
pub struct TripTracker {
    inner: Arc<Mutex<TripState>>,
}

impl TripTracker {
    pub fn new(cfg: &SmootherConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TripState {
                smoother: TrajectorySmoother::new(cfg),
                odometer: DistanceAccumulator::new(),
                latest: None,
            })),
        }
    }

    /// Process one raw sample.
    ///
    /// Samples with a non-finite field are rejected and leave the trip
    /// untouched.
    pub fn on_sample(&self, sample: &PositionSample) -> Result<TripSnapshot> {
        if !sample.is_finite() {
            return Err(TrajectoryError::NonFiniteSample);
        }
        let mut state = self.inner.lock();
        let position = state.smoother.process(
            Vector2::new(sample.lat, sample.lon),
            sample.accuracy,
            sample.timestamp,
            sample.speed,
        )?;
        state.odometer.add(&position);
        let snapshot = TripSnapshot {
            distance_m: state.odometer.value(),
            speed_mps: sample.speed.max(0.0),
            position,
            sample_timestamp: sample.timestamp,
        };
        state.latest = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Process samples as they appear on `rx` until `quit` fires or the
    /// sender is dropped.
    ///
    /// Only the newest value is processed if several arrive while busy.
    pub async fn follow(
        self,
        mut rx: watch::Receiver<Option<PositionSample>>,
        quit: stream_cancel::Tripwire,
    ) {
        tokio::pin!(quit);
        loop {
            tokio::select! {
                _ = &mut quit => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        debug!("position source closed");
                        break;
                    }
                }
            }
            let sample = rx.borrow_and_update().clone();
            if let Some(sample) = sample {
                if let Err(e) = self.on_sample(&sample) {
                    warn!("ignoring position sample: {e}");
                }
            }
        }
    }
}

impl TripSource for TripTracker {
    fn snapshot(&self) -> Option<TripSnapshot> {
        self.inner.lock().latest.clone()
    }

    fn reset(&self) {
        let mut state = self.inner.lock();
        state.smoother.reset();
        state.odometer.reset();
        state.latest = None;
    }
}
