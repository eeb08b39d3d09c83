use std::sync::Arc;

use chrono::Utc;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use field_types::{
    CaptureEvent, HostEvent, InspectionRecord, MPS_TO_KMH, RecordId, RoughnessResult, SyncState,
};
use record_store::RecordStore;

use crate::{
    CaptureError, Geocoder, HOST_EVENT_CAPACITY, PhotoCapture, RoughnessComputer, UploadRequester,
};

/// Turns capture events into persisted records.
pub struct CaptureExecutor {
    roughness: Arc<dyn RoughnessComputer>,
    camera: Arc<dyn PhotoCapture>,
    geocoder: Arc<dyn Geocoder>,
    store: Arc<dyn RecordStore>,
    uploads: Arc<dyn UploadRequester>,
    events: broadcast::Sender<HostEvent>,
}

impl CaptureExecutor {
    pub fn new(
        roughness: Arc<dyn RoughnessComputer>,
        camera: Arc<dyn PhotoCapture>,
        geocoder: Arc<dyn Geocoder>,
        store: Arc<dyn RecordStore>,
        uploads: Arc<dyn UploadRequester>,
    ) -> Self {
        let (events, _) = broadcast::channel(HOST_EVENT_CAPACITY);
        Self {
            roughness,
            camera,
            geocoder,
            store,
            uploads,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: HostEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Handle one capture event.
    ///
    /// For automatic captures the roughness of the finished segment is
    /// computed before this returns, so that the vibration buffer is cleared
    /// at the segment boundary. Photo, address and persistence follow on a
    /// spawned task whose handle is returned.
    pub fn fire(
        self: &Arc<Self>,
        task_id: &str,
        event: CaptureEvent,
    ) -> JoinHandle<Result<RecordId, CaptureError>> {
        let roughness = if event.trigger.is_auto() {
            self.compute_roughness(&event)
        } else {
            None
        };
        let this = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let result = this.complete(task_id, event, roughness).await;
            if let Err(e) = &result {
                match e {
                    CaptureError::Hardware(_) => warn!("capture skipped: {e}"),
                    _ => error!("capture lost: {e}"),
                }
                this.emit(HostEvent::CaptureFailed {
                    message: e.to_string(),
                });
            }
            result
        })
    }

    fn compute_roughness(&self, event: &CaptureEvent) -> Option<RoughnessResult> {
        let speed_kmh = event.speed_mps * MPS_TO_KMH;
        match self
            .roughness
            .compute_and_clear(speed_kmh, event.segment_length_m)
        {
            Some(result) => {
                debug!(
                    "roughness {:.2} over {:.1} m",
                    result.index, result.segment_length_m
                );
                self.emit(HostEvent::RoughnessComputed(result.clone()));
                Some(result)
            }
            None => {
                info!(
                    "no roughness for segment of {:.1} m at {:.1} km/h",
                    event.segment_length_m, speed_kmh
                );
                None
            }
        }
    }

    async fn complete(
        &self,
        task_id: String,
        event: CaptureEvent,
        roughness: Option<RoughnessResult>,
    ) -> Result<RecordId, CaptureError> {
        let path = self.camera.capture(event.trigger.is_auto()).await?;

        let address = match self.geocoder.resolve(event.lat, event.lon).await {
            Ok(address) => address,
            Err(e) => {
                debug!("{e}");
                String::new()
            }
        };

        let record = InspectionRecord {
            id: RecordId::new_random(),
            task_id,
            local_media_path: path.clone(),
            capture_timestamp: event.fired_at,
            lat: event.lat,
            lon: event.lon,
            address,
            roughness_index: finite_or_zero("roughness index", roughness.map_or(0.0, |r| r.index)),
            segment_length_m: finite_or_zero("segment length", event.segment_length_m),
            speed_kmh: finite_or_zero("speed", event.speed_mps * MPS_TO_KMH),
            trigger: event.trigger,
            sync_state: SyncState::Pending,
            state_changed_at: Utc::now(),
            media_purged: false,
        };
        let id = record.id.clone();

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_record(&record))
            .await
            .map_err(|e| CaptureError::Join(e.to_string()))??;
        info!("saved record {id} ({})", path.display());

        self.emit(HostEvent::CaptureSaved { path });
        if let Err(e) = self.uploads.request_upload() {
            warn!("could not request upload: {e}");
        }
        Ok(id)
    }
}

/// Non-finite values cannot be stored as JSON numbers.
fn finite_or_zero(what: &str, value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        warn!("storing {what} {value} as 0");
        0.0
    }
}
