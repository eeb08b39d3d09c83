//! Core type definitions shared by the capture scheduler, the local record
//! store and the sync queue.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversion factor from meters per second to kilometers per hour.
pub const MPS_TO_KMH: f64 = 3.6;

/// The errors of this crate.
#[derive(thiserror::Error, Debug)]
pub enum FieldTypesError {
    #[error("invalid record id \"{0}\"")]
    InvalidRecordId(String),
    #[error("unknown sync state \"{0}\"")]
    UnknownSyncState(String),
}

// PositionSample ---------------------------------------------------------

/// A raw sample as delivered by the positioning hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Ground speed in meters per second.
    pub speed: f64,
    /// Horizontal accuracy (one sigma) in meters.
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    /// Returns `true` if all numeric fields are finite.
    pub fn is_finite(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.speed.is_finite()
            && self.accuracy.is_finite()
    }
}

/// The stabilized position estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothedPosition {
    pub lat: f64,
    pub lon: f64,
    /// Scalar variance shared by both axes (m²).
    pub variance_estimate: f64,
    pub last_timestamp: DateTime<Utc>,
}

/// Latest-value view of the current trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSnapshot {
    /// Odometer reading in meters, non-decreasing within a session.
    pub distance_m: f64,
    /// Speed of the most recent raw sample, meters per second.
    pub speed_mps: f64,
    pub position: SmoothedPosition,
    pub sample_timestamp: DateTime<Utc>,
}

// InspectionRecord -------------------------------------------------------

/// Identifier of an [InspectionRecord].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new, random identifier.
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RecordId {
    type Err = FieldTypesError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = uuid::Uuid::parse_str(s).map_err(|_| FieldTypesError::InvalidRecordId(s.into()))?;
        Ok(Self(id.to_string()))
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Synchronization state of an [InspectionRecord].
///
/// Legal transitions:
///
/// - `Pending` → `Synced` by the upload task
/// - any → `PendingDelete` by the user
/// - `PendingDelete` → `Deleted` after remote confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    Pending,
    Synced,
    PendingDelete,
    Deleted,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::PendingDelete => "pending-delete",
            Self::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for SyncState {
    type Err = FieldTypesError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "pending-delete" => Ok(Self::PendingDelete),
            "deleted" => Ok(Self::Deleted),
            other => Err(FieldTypesError::UnknownSyncState(other.into())),
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a capture to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureTrigger {
    /// Fired by the scheduler's control loop.
    Auto,
    /// Requested by the user.
    Manual,
}

impl CaptureTrigger {
    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }
}

/// One persisted capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRecord {
    pub id: RecordId,
    pub task_id: String,
    pub local_media_path: PathBuf,
    pub capture_timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    /// Resolved street address, empty if resolution failed.
    pub address: String,
    /// Roughness of the segment leading to this capture, 0 if unavailable.
    pub roughness_index: f64,
    pub segment_length_m: f64,
    pub speed_kmh: f64,
    pub trigger: CaptureTrigger,
    pub sync_state: SyncState,
    pub state_changed_at: DateTime<Utc>,
    /// Set once the media payload has been removed from local storage.
    #[serde(default)]
    pub media_purged: bool,
}

// Capture events ---------------------------------------------------------

/// Emitted by the scheduler each time a capture should happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    pub trigger: CaptureTrigger,
    /// Length of the segment since the previous automatic capture (meters).
    /// Zero for manual captures.
    pub segment_length_m: f64,
    pub speed_mps: f64,
    pub fired_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
}

/// Output of the roughness computation for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoughnessResult {
    /// Roughness index, IRI-like (m/km).
    pub index: f64,
    pub avg_speed_kmh: f64,
    pub segment_length_m: f64,
}

/// Notifications to the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostEvent {
    CaptureSaved { path: PathBuf },
    RoughnessComputed(RoughnessResult),
    CaptureFailed { message: String },
}
