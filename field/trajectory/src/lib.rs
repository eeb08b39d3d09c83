//! Position smoothing and trip odometry.
//!
//! Raw samples from a [PositionSource] go through the [TrajectorySmoother];
//! distances between successive smoothed positions accumulate in the
//! [DistanceAccumulator]. [TripTracker] ties both together and exposes the
//! latest [field_types::TripSnapshot] to readers.

mod odometer;
mod smoother;
mod trip;

pub use odometer::{DistanceAccumulator, haversine_distance_m};
pub use smoother::TrajectorySmoother;
pub use trip::{PositionSource, TripSource, TripTracker};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TrajectoryError {
    #[error("position sample contains non-finite values")]
    NonFiniteSample,
}

pub type Result<T> = std::result::Result<T, TrajectoryError>;
