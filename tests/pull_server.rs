use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use printer_link::sdcp::pull_server::{pull_router, PullServer, PullState};
use tower::ServiceExt; // for .oneshot()

#[tokio::test]
async fn serves_only_the_offered_file() {
    let state = Arc::new(PullState::new("cube.goo", Bytes::from_static(b"layer-data")));
    let app = pull_router(state.clone());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/cube.goo").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/octet-stream");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"layer-data");
    assert_eq!(state.pulls(), 1);

    let response = app
        .oneshot(Request::builder().uri("/other.goo").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(state.pulls(), 1);
}

#[tokio::test]
async fn wait_for_pull_times_out_without_a_fetch() {
    let server = PullServer::start("idle.goo", Bytes::from_static(b"x")).await.unwrap();
    assert!(!server.wait_for_pull(Duration::from_millis(100)).await);
    assert_eq!(server.pulls(), 0);
}

#[tokio::test]
async fn listener_is_gone_after_shutdown() {
    let server = PullServer::start("part.goo", Bytes::from_static(b"G")).await.unwrap();
    let port = server.port();
    let url = server.url_for("127.0.0.1").unwrap();

    let body = reqwest::get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(&body[..], b"G");
    assert!(server.wait_for_pull(Duration::from_millis(100)).await);
    server.shutdown().await;

    let refused = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn dropping_the_server_stops_listening() {
    let server = PullServer::start("drop.goo", Bytes::from_static(b"G")).await.unwrap();
    let port = server.port();
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());
    drop(server);

    // shutdown runs in the background after a drop
    let mut closed = false;
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(closed);
}
