//! Recorded tracks as position source.
//!
//! A track is a CSV file with the columns `timestamp` (RFC 3339), `lat`,
//! `lon`, `speed` (m/s) and `accuracy` (m).

use std::{path::Path, time::Duration};

use eyre::{Result, WrapErr};
use tokio::sync::watch;
use tracing::{debug, warn};

use field_types::PositionSample;

/// Read all samples of a track.
pub fn read_track<P: AsRef<Path>>(path: P) -> Result<Vec<PositionSample>> {
    let path = path.as_ref();
    let mut rdr = csv::Reader::from_path(path)
        .wrap_err_with(|| format!("opening track {}", path.display()))?;
    let mut samples = Vec::new();
    for (i, row) in rdr.deserialize().enumerate() {
        let sample: PositionSample =
            row.wrap_err_with(|| format!("row {} of {}", i + 1, path.display()))?;
        samples.push(sample);
    }
    debug!("read {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

/// Publish `samples` on `tx`, spaced by their timestamps divided by
/// `speedup`, until the track ends or `quit` fires. Returns the number of
/// samples sent.
pub async fn replay(
    samples: Vec<PositionSample>,
    speedup: f64,
    tx: watch::Sender<Option<PositionSample>>,
    quit: stream_cancel::Tripwire,
) -> usize {
    tokio::pin!(quit);
    let mut sent = 0;
    let mut prev: Option<chrono::DateTime<chrono::Utc>> = None;
    for sample in samples {
        if let Some(prev) = prev {
            let dt = (sample.timestamp - prev).to_std().unwrap_or_default();
            let wait = Duration::try_from_secs_f64(dt.as_secs_f64() / speedup).unwrap_or_default();
            tokio::select! {
                _ = &mut quit => {
                    debug!("replay stopped after {sent} samples");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        prev = Some(sample.timestamp);
        if tx.send(Some(sample)).is_err() {
            warn!("no one follows the track anymore");
            break;
        }
        sent += 1;
    }
    sent
}
