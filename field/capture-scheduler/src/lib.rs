//! Distance-based triggering of inspection captures.
//!
//! While a session is active, the [CaptureScheduler] runs a control loop
//! which reads the latest [field_types::TripSnapshot] and fires a
//! [field_types::CaptureEvent] each time another `interval_meters` have been
//! covered. At high speed the next firing time is predicted from the speed
//! and the loop sleeps until then. At low speed it polls the odometer.
//!
//! Each event is handed to the [CaptureExecutor], which computes roughness,
//! takes a photo, resolves an address, persists an
//! [field_types::InspectionRecord] and requests an upload. That work runs
//! on spawned tasks, so a slow camera never delays the control loop.

use std::path::PathBuf;

use futures::future::BoxFuture;

use field_types::RoughnessResult;

mod executor;
mod scheduler;

pub use executor::CaptureExecutor;
pub use scheduler::CaptureScheduler;

/// Capacity of the host event channel.
pub const HOST_EVENT_CAPACITY: usize = 64;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SchedulerError {
    #[error("a capture session is already active")]
    AlreadyActive,
    #[error("no capture session is active")]
    NotActive,
    #[error("no position fix available")]
    SensorUnavailable,
}

/// Failure of a single capture. Never affects the control loop.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Hardware(String),
    #[error("{source}")]
    Persistence {
        #[from]
        source: record_store::Error,
    },
    #[error("capture task failed: {0}")]
    Join(String),
}

/// Failure to resolve an address.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("geocoding failed: {0}")]
pub struct GeocodeError(pub String);

/// Computes road roughness from the vibration data collected since the
/// previous call.
pub trait RoughnessComputer: Send + Sync + 'static {
    /// Compute the index for the segment just finished and clear the
    /// buffer. `None` if not enough data was collected.
    fn compute_and_clear(&self, avg_speed_kmh: f64, segment_length_m: f64)
    -> Option<RoughnessResult>;
}

/// The camera.
pub trait PhotoCapture: Send + Sync + 'static {
    /// Take a photo and return where it was stored.
    fn capture(&self, is_auto: bool) -> BoxFuture<'_, Result<PathBuf, CaptureError>>;
}

/// Reverse geocoding.
pub trait Geocoder: Send + Sync + 'static {
    fn resolve(&self, lat: f64, lon: f64) -> BoxFuture<'_, Result<String, GeocodeError>>;
}

/// Receives a request to upload pending records after each saved capture.
pub trait UploadRequester: Send + Sync + 'static {
    fn request_upload(&self) -> sync_queue::Result<()>;
}

impl UploadRequester for sync_queue::SyncQueue {
    fn request_upload(&self) -> sync_queue::Result<()> {
        self.schedule_upload()?;
        Ok(())
    }
}
