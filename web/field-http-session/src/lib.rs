//! Talk to the inspection record service over HTTP.
//!
//! - `POST {base}/records` with a JSON [UploadBody]
//! - `DELETE {base}/records/{id}?inspector={inspector_id}`

use std::path::PathBuf;

use base64::Engine;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use field_types::{CaptureTrigger, InspectionRecord, RecordId};
use sync_queue::{DeleteResponse, RemoteError, RemoteSync, UploadResponse};

const RECORDS_PATH: &str = "records";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    UrlError(#[from] url::ParseError),
    #[error("{0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("{0}")]
    HttpError(#[from] http::Error),
    #[error("{0}")]
    JsonError(#[from] serde_json::Error),
    #[error("{0}")]
    HyperError(#[from] hyper::Error),
    #[error("{0}")]
    HyperUtilError(#[from] hyper_util::client::legacy::Error),
    #[error("reading media {path}: {source}")]
    MediaError {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// JSON body of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadBody {
    pub id: RecordId,
    pub task_id: String,
    pub capture_timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub address: String,
    pub roughness_index: f64,
    pub segment_length_m: f64,
    pub speed_kmh: f64,
    pub trigger: CaptureTrigger,
    pub media_filename: Option<String>,
    /// Base64 encoded photo, absent if it is no longer stored locally.
    pub media_base64: Option<String>,
}

/// Optional JSON reply of the service.
#[derive(Debug, Deserialize)]
struct ServiceReply {
    #[serde(default)]
    message: String,
}

fn body_from_buf(body_buf: &[u8]) -> Full<bytes::Bytes> {
    Full::new(bytes::Bytes::from(body_buf.to_vec()))
}

/// A client of the record service.
#[derive(Clone, Debug)]
pub struct FieldHttpSession {
    base_url: url::Url,
    client: Client<HttpConnector, Full<bytes::Bytes>>,
}

impl FieldHttpSession {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = url::Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &url::Url {
        &self.base_url
    }

    fn record_uri(&self, id: &RecordId, inspector_id: &str) -> Result<hyper::Uri> {
        let mut url = self.base_url.join(&format!("{RECORDS_PATH}/{id}"))?;
        url.query_pairs_mut().append_pair("inspector", inspector_id);
        Ok(url.as_str().parse()?)
    }

    async fn send(
        &self,
        req: hyper::Request<Full<bytes::Bytes>>,
    ) -> Result<(hyper::StatusCode, String)> {
        let resp = self.client.request(req).await?;
        let status = resp.status();
        let data = resp.into_body().collect().await?.to_bytes();
        // prefer the service's message, fall back to the raw body
        let message = match serde_json::from_slice::<ServiceReply>(&data) {
            Ok(reply) => reply.message,
            Err(_) => String::from_utf8_lossy(&data).into_owned(),
        };
        Ok((status, message))
    }

    async fn upload_body(record: &InspectionRecord) -> Result<UploadBody> {
        let (media_filename, media_base64) = if record.media_purged {
            (None, None)
        } else {
            let path = &record.local_media_path;
            let buf = tokio::fs::read(path)
                .await
                .map_err(|source| Error::MediaError {
                    path: path.clone(),
                    source,
                })?;
            let fname = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned());
            (
                fname,
                Some(base64::engine::general_purpose::STANDARD.encode(buf)),
            )
        };
        Ok(UploadBody {
            id: record.id.clone(),
            task_id: record.task_id.clone(),
            capture_timestamp: record.capture_timestamp,
            lat: record.lat,
            lon: record.lon,
            address: record.address.clone(),
            roughness_index: record.roughness_index,
            segment_length_m: record.segment_length_m,
            speed_kmh: record.speed_kmh,
            trigger: record.trigger,
            media_filename,
            media_base64,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = %record.id))]
    pub async fn upload(&self, record: &InspectionRecord) -> Result<UploadResponse> {
        let body = Self::upload_body(record).await?;
        let bytes = serde_json::to_vec(&body)?;
        let uri: hyper::Uri = self.base_url.join(RECORDS_PATH)?.as_str().parse()?;
        let req = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(uri)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(body_from_buf(&bytes))?;

        debug!("uploading record");
        let (status, message) = self.send(req).await?;
        if !status.is_success() {
            warn!("upload rejected with status {status}: {message}");
        }
        Ok(UploadResponse {
            success: status.is_success(),
            message,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete(&self, id: &RecordId, inspector_id: &str) -> Result<DeleteResponse> {
        let req = hyper::Request::builder()
            .method(hyper::Method::DELETE)
            .uri(self.record_uri(id, inspector_id)?)
            .body(body_from_buf(b""))?;
        let (status, message) = self.send(req).await?;
        debug!("delete returned {status}");
        Ok(DeleteResponse {
            is_success: status.is_success(),
            status_code: status.as_u16(),
            message,
        })
    }
}

impl RemoteSync for FieldHttpSession {
    fn upload_record<'a>(
        &'a self,
        record: &'a InspectionRecord,
    ) -> BoxFuture<'a, std::result::Result<UploadResponse, RemoteError>> {
        Box::pin(async move {
            self.upload(record)
                .await
                .map_err(|e| RemoteError(e.to_string()))
        })
    }

    fn delete_record<'a>(
        &'a self,
        record_id: &'a RecordId,
        inspector_id: &'a str,
    ) -> BoxFuture<'a, std::result::Result<DeleteResponse, RemoteError>> {
        Box::pin(async move {
            self.delete(record_id, inspector_id)
                .await
                .map_err(|e| RemoteError(e.to_string()))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_urls() {
        let session = FieldHttpSession::new("http://example.com:8080/api").unwrap();
        assert_eq!(session.base_url().as_str(), "http://example.com:8080/api/");
        let id: RecordId = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        let uri = session.record_uri(&id, "jane doe").unwrap();
        assert_eq!(
            uri.to_string(),
            "http://example.com:8080/api/records/67e55044-10b1-426f-9247-bb680e5fe0c8?inspector=jane+doe"
        );
    }
}
