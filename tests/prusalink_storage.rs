mod common;

use std::sync::{Arc, Mutex};

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use printer_link::rest::prusalink::PrusaLinkAdapter;
use printer_link::{ErrorKind, PrinterAdapter};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use common::{fast_client, init_logging, spawn, Counter};

type Log = Arc<Mutex<Vec<String>>>;

/// USB storage refuses writes; local storage accepts them.
fn usb_locked(calls: Counter, log: Log) -> Router {
    Router::new().route(
        "/api/v1/files/{storage}/{name}",
        put(move |Path((storage, name)): Path<(String, String)>, headers: HeaderMap| {
            let calls = calls.clone();
            let log = log.clone();
            async move {
                calls.hit();
                log.lock().unwrap().push(format!("PUT {}/{}", storage, name));
                assert_eq!(headers.get("Overwrite").unwrap(), "?1");
                assert_eq!(headers.get("Print-After-Upload").unwrap(), "?0");
                if storage == "usb" {
                    StatusCode::FORBIDDEN
                } else {
                    StatusCode::CREATED
                }
            }
        }),
    )
}

#[tokio::test]
async fn upload_falls_back_from_usb_to_local() {
    init_logging();
    let calls = Counter::default();
    let log: Log = Arc::default();
    let addr = spawn(usb_locked(calls.clone(), log.clone())).await;
    let adapter = PrusaLinkAdapter::new("mk4", fast_client(addr, "PrusaLink"));

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("cube.bgcode");
    std::fs::write(&local, b"GCDE").unwrap();

    let result = assert_ok!(adapter.upload_file(&local, None).await);
    assert!(result.success);
    assert_eq!(result.remote_path.as_deref(), Some("/local/cube.bgcode"));
    assert!(result.message.contains("local"));
    assert_eq!(calls.get(), 2);
    assert_eq!(*log.lock().unwrap(), vec!["PUT usb/cube.bgcode", "PUT local/cube.bgcode"]);
}

#[tokio::test]
async fn server_error_stops_fallback_at_first_root() {
    init_logging();
    let calls = Counter::default();
    let hits = calls.clone();
    let app = Router::new().route(
        "/api/v1/files/{storage}/{name}",
        put(move || {
            let hits = hits.clone();
            async move {
                hits.hit();
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    );
    let addr = spawn(app).await;
    let adapter = PrusaLinkAdapter::new("mk4", fast_client(addr, "PrusaLink"));

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("cube.gcode");
    std::fs::write(&local, b"G28").unwrap();

    let err = assert_err!(adapter.upload_file(&local, None).await);
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.to_string().contains("usb (500)"));
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn start_print_resolves_display_name_to_short_path() {
    init_logging();
    let started: Log = Arc::default();
    let record = started.clone();
    let app = Router::new()
        .route(
            "/api/v1/files/{storage}",
            get(|Path(storage): Path<String>| async move {
                if storage == "usb" {
                    Ok(Json(json!({"children": [
                        {"name": "CALIBR~1.BGC", "display_name": "calibration_cube_0.2mm_PLA.bgcode", "type": "PRINT_FILE"}
                    ]})))
                } else {
                    Err(StatusCode::NOT_FOUND)
                }
            }),
        )
        .route(
            "/api/v1/files/{storage}/{name}",
            axum::routing::post(move |Path((storage, name)): Path<(String, String)>| {
                let record = record.clone();
                async move {
                    record.lock().unwrap().push(format!("{}/{}", storage, name));
                    StatusCode::NO_CONTENT
                }
            }),
        );
    let addr = spawn(app).await;
    let adapter = PrusaLinkAdapter::new("mk4", fast_client(addr, "PrusaLink"));

    let result = assert_ok!(adapter.start_print("calibration_cube_0.2mm_PLA.bgcode").await);
    assert!(result.success);
    assert_eq!(*started.lock().unwrap(), vec!["usb/CALIBR~1.BGC"]);
}

#[tokio::test]
async fn job_control_without_active_job_is_conflict() {
    init_logging();
    let app = Router::new().route(
        "/api/v1/status",
        get(|| async { Json(json!({"printer": {"state": "IDLE"}})) }),
    );
    let addr = spawn(app).await;
    let adapter = PrusaLinkAdapter::new("mk4", fast_client(addr, "PrusaLink"));

    let err = assert_err!(adapter.pause_print().await);
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn pause_targets_the_active_job() {
    init_logging();
    let paused = Counter::default();
    let hits = paused.clone();
    let app = Router::new()
        .route(
            "/api/v1/status",
            get(|| async { Json(json!({"printer": {"state": "PRINTING"}, "job": {"id": 17, "progress": 30.0}})) }),
        )
        .route(
            "/api/v1/job/17/pause",
            put(move || {
                let hits = hits.clone();
                async move {
                    hits.hit();
                    StatusCode::NO_CONTENT
                }
            }),
        );
    let addr = spawn(app).await;
    let adapter = PrusaLinkAdapter::new("mk4", fast_client(addr, "PrusaLink"));

    assert_ok!(adapter.pause_print().await);
    assert_eq!(paused.get(), 1);
}
