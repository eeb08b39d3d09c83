//! Stand-ins for the device hardware when replaying recorded tracks.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use futures::future::BoxFuture;

use capture_scheduler::{CaptureError, GeocodeError, Geocoder, PhotoCapture, RoughnessComputer};
use field_types::RoughnessResult;

/// JPEG start and end of image markers, no image data.
const PLACEHOLDER_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xD9];

/// Writes a placeholder image into the media directory for each capture.
pub struct SimulatedCamera {
    media_dir: PathBuf,
    count: AtomicU64,
}

impl SimulatedCamera {
    pub fn new(media_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&media_dir)?;
        Ok(Self {
            media_dir,
            count: AtomicU64::new(0),
        })
    }
}

impl PhotoCapture for SimulatedCamera {
    fn capture(&self, is_auto: bool) -> BoxFuture<'_, Result<PathBuf, CaptureError>> {
        let n = self.count.fetch_add(1, Ordering::SeqCst);
        let kind = if is_auto { "auto" } else { "manual" };
        let fname = format!("{}_{n:05}_{kind}.jpg", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = self.media_dir.join(fname);
        Box::pin(async move {
            tokio::fs::write(&path, PLACEHOLDER_JPEG)
                .await
                .map_err(|e| CaptureError::Hardware(format!("{}: {e}", path.display())))?;
            Ok(path)
        })
    }
}

/// There is no vibration sensor during replay.
pub struct NoRoughness;

impl RoughnessComputer for NoRoughness {
    fn compute_and_clear(
        &self,
        _avg_speed_kmh: f64,
        _segment_length_m: f64,
    ) -> Option<RoughnessResult> {
        None
    }
}

/// A geocoder which is never reachable.
pub struct OfflineGeocoder;

impl Geocoder for OfflineGeocoder {
    fn resolve(&self, _lat: f64, _lon: f64) -> BoxFuture<'_, Result<String, GeocodeError>> {
        Box::pin(async { Err(GeocodeError("no geocoder available offline".into())) })
    }
}
