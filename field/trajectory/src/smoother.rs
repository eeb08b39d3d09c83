use chrono::{DateTime, Utc};
use nalgebra::Vector2;

use field_config_data::SmootherConfig;
use field_types::SmoothedPosition;

use crate::{Result, TrajectoryError};

/// Recursive position filter with one scalar variance shared by both axes.
///
/// Latitude and longitude are filtered independently, but since the
/// measurement noise (the reported accuracy) is isotropic, a single variance
/// suffices and the gain is the same on both axes. The variance is in m²
/// while the estimate is in degrees; only the ratio of variances enters the
/// gain, so the mixed units are harmless.
#[derive(Debug, Clone)]
pub struct TrajectorySmoother {
    base_noise_mps: f64,
    speed_noise_divisor: f64,
    min_accuracy_m: f64,
    state: Option<State>,
    last_gain: Option<f64>,
}

#[derive(Debug, Clone)]
struct State {
    /// `[lat, lon]` in degrees.
    estimate: Vector2<f64>,
    variance: f64,
    last_timestamp: DateTime<Utc>,
}

impl TrajectorySmoother {
    pub fn new(cfg: &SmootherConfig) -> Self {
        Self {
            base_noise_mps: cfg.base_noise_mps,
            speed_noise_divisor: cfg.speed_noise_divisor,
            min_accuracy_m: cfg.min_accuracy_m,
            state: None,
            last_gain: None,
        }
    }

    /// Incorporate one measurement.
    ///
    /// `measurement` is `[lat, lon]` in degrees, `accuracy` the one-sigma
    /// horizontal accuracy in meters and `speed` the ground speed in m/s.
    pub fn process(
        &mut self,
        measurement: Vector2<f64>,
        accuracy: f64,
        timestamp: DateTime<Utc>,
        speed: f64,
    ) -> Result<SmoothedPosition> {
        if !(measurement.iter().all(|v| v.is_finite()) && accuracy.is_finite()) {
            return Err(TrajectoryError::NonFiniteSample);
        }
        let accuracy = accuracy.max(self.min_accuracy_m);
        let measurement_variance = accuracy * accuracy;

        let state = match self.state.as_mut() {
            None => {
                self.last_gain = None;
                let state = self.state.insert(State {
                    estimate: measurement,
                    variance: measurement_variance,
                    last_timestamp: timestamp,
                });
                return Ok(state.to_position());
            }
            Some(state) => state,
        };

        let elapsed = (timestamp - state.last_timestamp).num_microseconds();
        let elapsed = elapsed.map(|us| us as f64 * 1e-6).unwrap_or(0.0);
        if elapsed > 0.0 {
            // predict
            let speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
            let dynamic_noise = self.base_noise_mps + speed * elapsed / self.speed_noise_divisor;
            state.variance += elapsed * dynamic_noise * dynamic_noise;
            state.last_timestamp = timestamp;
        } else {
            tracing::trace!("non-monotonic timestamp ({elapsed} s), skipping predict");
        }

        // update
        let gain = state.variance / (state.variance + measurement_variance);
        state.estimate += gain * (measurement - state.estimate);
        state.variance *= 1.0 - gain;
        self.last_gain = Some(gain);

        Ok(state.to_position())
    }

    /// The gain of the most recent update step, `None` after (re)initialization.
    pub fn last_gain(&self) -> Option<f64> {
        self.last_gain
    }

    /// The current estimate, if initialized.
    pub fn position(&self) -> Option<SmoothedPosition> {
        self.state.as_ref().map(State::to_position)
    }

    /// Forget all state. The next measurement initializes the filter again.
    pub fn reset(&mut self) {
        self.state = None;
        self.last_gain = None;
    }
}

impl State {
    fn to_position(&self) -> SmoothedPosition {
        SmoothedPosition {
            lat: self.estimate[0],
            lon: self.estimate[1],
            variance_estimate: self.variance,
            last_timestamp: self.last_timestamp,
        }
    }
}
