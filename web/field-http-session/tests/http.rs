use std::{collections::HashMap, convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode, body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use test_log::test;

use field_http_session::{FieldHttpSession, UploadBody};
use field_types::{CaptureTrigger, InspectionRecord, RecordId, SyncState};
use sync_queue::RemoteSync;

#[derive(Default)]
struct Server {
    /// Status returned for DELETE, by record id. 200 if missing.
    delete_status: HashMap<String, u16>,
    upload_status: Option<u16>,
    uploads: Vec<UploadBody>,
    requests: Vec<(hyper::Method, String)>,
}

async fn handle(
    state: Arc<Mutex<Server>>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_default();
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await.unwrap().to_bytes();

    let mut state = state.lock();
    state.requests.push((method.clone(), path_and_query));
    let (status, msg) = match method {
        hyper::Method::POST if path == "/api/records" => {
            state.uploads.push(serde_json::from_slice(&body).unwrap());
            (state.upload_status.unwrap_or(201), "stored")
        }
        hyper::Method::DELETE => {
            let id = path.rsplit('/').next().unwrap_or_default();
            let status = state.delete_status.get(id).copied().unwrap_or(200);
            (status, "deleted")
        }
        _ => (400, "bad request"),
    };
    let reply = serde_json::json!({ "message": msg }).to_string();
    Ok(Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .body(Full::new(Bytes::from(reply)))
        .unwrap())
}

async fn serve(state: Arc<Mutex<Server>>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let state = state.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(state.clone(), req));
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

fn record(media: std::path::PathBuf) -> InspectionRecord {
    InspectionRecord {
        id: RecordId::new_random(),
        task_id: "task-3".into(),
        local_media_path: media,
        capture_timestamp: Utc::now(),
        lat: 47.1,
        lon: 8.2,
        address: "Main Street 1".into(),
        roughness_index: 3.25,
        segment_length_m: 10.0,
        speed_kmh: 40.0,
        trigger: CaptureTrigger::Auto,
        sync_state: SyncState::Pending,
        state_changed_at: Utc::now(),
        media_purged: false,
    }
}

#[test(tokio::test)]
async fn test_upload() {
    let state = Arc::new(Mutex::new(Server::default()));
    let addr = serve(state.clone()).await;
    let session = FieldHttpSession::new(&format!("http://{addr}/api")).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let media = dir.path().join("photo.jpg");
    std::fs::write(&media, b"\xff\xd8jpeg").unwrap();
    let r = record(media);

    let resp = session.upload_record(&r).await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.message, "stored");

    {
        let state = state.lock();
        assert_eq!(state.uploads.len(), 1);
        let body = &state.uploads[0];
        assert_eq!(body.id, r.id);
        assert_eq!(body.roughness_index, 3.25);
        assert_eq!(body.media_filename.as_deref(), Some("photo.jpg"));
        assert_eq!(body.media_base64.as_deref(), Some("/9hqcGVn"));
    }

    state.lock().upload_status = Some(503);
    let resp = session.upload_record(&r).await.unwrap();
    assert!(!resp.success);
}

#[test(tokio::test)]
async fn test_upload_missing_media_is_an_error() {
    let state = Arc::new(Mutex::new(Server::default()));
    let addr = serve(state.clone()).await;
    let session = FieldHttpSession::new(&format!("http://{addr}/api/")).unwrap();

    let r = record("/nonexistent/photo.jpg".into());
    assert!(session.upload_record(&r).await.is_err());
    assert!(state.lock().requests.is_empty());
}

#[test(tokio::test)]
async fn test_delete_status_codes() {
    let state = Arc::new(Mutex::new(Server::default()));
    let addr = serve(state.clone()).await;
    let session = FieldHttpSession::new(&format!("http://{addr}/api")).unwrap();

    let ok = RecordId::new_random();
    let gone = RecordId::new_random();
    let broken = RecordId::new_random();
    {
        let mut state = state.lock();
        state.delete_status.insert(gone.to_string(), 404);
        state.delete_status.insert(broken.to_string(), 500);
    }

    let resp = session.delete_record(&ok, "inspector-9").await.unwrap();
    assert!(resp.is_success);
    assert_eq!(resp.status_code, 200);
    assert!(resp.is_terminal_success());

    let resp = session.delete_record(&gone, "inspector-9").await.unwrap();
    assert!(!resp.is_success);
    assert_eq!(resp.status_code, 404);
    assert!(resp.is_terminal_success());

    let resp = session.delete_record(&broken, "inspector-9").await.unwrap();
    assert_eq!(resp.status_code, 500);
    assert!(!resp.is_terminal_success());

    let requests = state.lock().requests.clone();
    assert_eq!(
        requests[0],
        (
            hyper::Method::DELETE,
            format!("/api/records/{ok}?inspector=inspector-9")
        )
    );
}

#[test(tokio::test)]
async fn test_unreachable_remote() {
    // nothing listens on port 9 of localhost
    let session = FieldHttpSession::new("http://127.0.0.1:9/").unwrap();
    let result = session
        .delete_record(&RecordId::new_random(), "inspector")
        .await;
    assert!(result.is_err());
}
