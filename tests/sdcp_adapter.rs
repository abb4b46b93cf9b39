mod common;

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use md5::{Digest, Md5};
use printer_link::{ErrorKind, PrinterAdapter, PrinterStatus, SdcpAdapter, SdcpOptions};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use common::{init_logging, spawn};

const MAINBOARD: &str = "a1b2c3d4e5f60718";

/// A file the printer fetched after an upload command.
#[derive(Debug)]
struct Pulled {
    announced_size: u64,
    announced_md5: String,
    body: Vec<u8>,
}

/// Handle on a running mock printer.
struct MockPrinter {
    addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<Value>,
    pulls: mpsc::UnboundedReceiver<Pulled>,
}

impl MockPrinter {
    /// Frames received so far.
    fn drain_frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

fn reply(request: &Value, data: Value) -> Message {
    let frame = json!({
        "Id": request["Id"],
        "Data": {
            "Cmd": request["Data"]["Cmd"],
            "Data": data,
            "RequestID": request["Data"]["RequestID"],
            "MainboardID": MAINBOARD,
            "TimeStamp": 1700000000
        },
        "Topic": format!("sdcp/response/{}", MAINBOARD)
    });
    Message::Text(frame.to_string().into())
}

fn attributes_broadcast() -> Message {
    let frame = json!({
        "Attributes": {"Name": "Saturn 4 Ultra", "MainboardID": MAINBOARD, "FirmwareVersion": "V1.2.0"},
        "MainboardID": MAINBOARD,
        "Topic": format!("sdcp/attributes/{}", MAINBOARD)
    });
    Message::Text(frame.to_string().into())
}

fn status_broadcast() -> Message {
    let frame = json!({
        "Status": {
            "CurrentStatus": [1],
            "TempOfNozzle": 221.5, "TempTargetNozzle": 220.0,
            "TempOfHotbed": 60.0, "TempTargetHotbed": 60.0,
            "PrintInfo": {"Status": 13, "Filename": "benchy.gcode", "Progress": 42, "CurrentTicks": 300, "TotalTicks": 1000}
        },
        "MainboardID": MAINBOARD,
        "Topic": format!("sdcp/status/{}", MAINBOARD)
    });
    Message::Text(frame.to_string().into())
}

/// A printer that acks pause, rejects stop with code 1 and ignores resume.
///
/// Upload commands for files named `reject*` are refused, `ignore*` files are
/// acked but never fetched, anything else is fetched and reported on `pulls`.
async fn printer(mut socket: WebSocket, frames: mpsc::UnboundedSender<Value>, pulls: mpsc::UnboundedSender<Pulled>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request: Value = serde_json::from_str(text.as_str()).unwrap();
        let _ = frames.send(request.clone());
        let cmd = request["Data"]["Cmd"].as_u64().unwrap();
        let outgoing = match cmd {
            0 => Some(status_broadcast()),
            1 => Some(attributes_broadcast()),
            129 => Some(reply(&request, json!({"Ack": 0}))),
            130 => Some(reply(&request, json!({"Ack": 1}))),
            131 => None,
            258 => Some(reply(
                &request,
                json!({"Ack": 0, "FileList": [{"name": "/local/benchy.gcode", "type": 1}]}),
            )),
            256 => {
                let params = request["Data"]["Data"].clone();
                let file_name = params["Filename"].as_str().unwrap_or_default().to_string();
                if file_name.starts_with("reject") {
                    Some(reply(&request, json!({"Ack": 1})))
                } else {
                    if !file_name.starts_with("ignore") {
                        let pulls = pulls.clone();
                        tokio::spawn(async move {
                            let url = params["URL"].as_str().unwrap().to_string();
                            let body = reqwest::get(&url).await.unwrap().bytes().await.unwrap();
                            let _ = pulls.send(Pulled {
                                announced_size: params["FileSize"].as_u64().unwrap(),
                                announced_md5: params["MD5"].as_str().unwrap().to_string(),
                                body: body.to_vec(),
                            });
                        });
                    }
                    Some(reply(&request, json!({"Ack": 0})))
                }
            }
            _ => None,
        };
        if let Some(outgoing) = outgoing {
            if socket.send(outgoing).await.is_err() {
                break;
            }
        }
    }
}

fn printer_app() -> (Router, mpsc::UnboundedReceiver<Value>, mpsc::UnboundedReceiver<Pulled>) {
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (pulls_tx, pulls) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/websocket",
        get(move |ws: WebSocketUpgrade| {
            let frames_tx = frames_tx.clone();
            let pulls_tx = pulls_tx.clone();
            async move { ws.on_upgrade(move |socket| printer(socket, frames_tx, pulls_tx)) }
        }),
    );
    (app, frames, pulls)
}

async fn mock_printer() -> MockPrinter {
    let (app, frames, pulls) = printer_app();
    let addr = spawn(app).await;
    MockPrinter { addr, frames, pulls }
}

fn options(addr: SocketAddr) -> SdcpOptions {
    SdcpOptions {
        port: addr.port(),
        command_timeout: Duration::from_millis(300),
        status_wait: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(1),
        pull_timeout: Duration::from_secs(5),
        advertise_host: Some("127.0.0.1".to_string()),
        ..SdcpOptions::default()
    }
}

/// Port of the pull listener offered in the last upload command.
fn offered_port(frames: &[Value]) -> u16 {
    let upload = frames
        .iter()
        .rev()
        .find(|frame| frame["Data"]["Cmd"] == 256)
        .expect("an upload command was sent");
    let url = url::Url::parse(upload["Data"]["Data"]["URL"].as_str().unwrap()).unwrap();
    url.port().unwrap()
}

#[tokio::test]
async fn checked_command_with_zero_ack_succeeds() {
    init_logging();
    let printer = mock_printer().await;
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", options(printer.addr));

    let result = assert_ok!(adapter.pause_print().await);
    assert!(result.success);
    assert_eq!(adapter.connection().mainboard_id().await.as_deref(), Some(MAINBOARD));
}

#[tokio::test]
async fn first_command_is_addressed_to_the_mainboard() {
    init_logging();
    let mut printer = mock_printer().await;
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", options(printer.addr));

    assert_ok!(adapter.pause_print().await);
    let frames = printer.drain_frames();
    assert_eq!(frames[0]["Data"]["Cmd"], 1);
    let pause = frames.iter().find(|frame| frame["Data"]["Cmd"] == 129).unwrap();
    assert_eq!(pause["Data"]["MainboardID"], MAINBOARD);
    assert_eq!(pause["Topic"], format!("sdcp/request/{}", MAINBOARD));
}

#[tokio::test]
async fn configured_mainboard_id_skips_identification() {
    init_logging();
    let mut printer = mock_printer().await;
    let adapter = SdcpAdapter::new(
        "saturn",
        "127.0.0.1",
        SdcpOptions {
            mainboard_id: Some(MAINBOARD.to_string()),
            ..options(printer.addr)
        },
    );

    assert_ok!(adapter.pause_print().await);
    let frames = printer.drain_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["Data"]["Cmd"], 129);
}

#[tokio::test]
async fn nonzero_ack_names_the_code() {
    init_logging();
    let printer = mock_printer().await;
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", options(printer.addr));

    let err = assert_err!(adapter.cancel_print().await);
    assert_eq!(err.kind(), ErrorKind::CommandRejected);
    assert!(err.to_string().contains("ack code 1"));
}

#[tokio::test]
async fn missing_reply_is_no_response() {
    init_logging();
    let printer = mock_printer().await;
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", options(printer.addr));

    let err = assert_err!(adapter.resume_print().await);
    assert_eq!(err.kind(), ErrorKind::NoResponse);
    assert!(err.to_string().contains("no response"));

    // the link survives a timed-out command
    assert_ok!(adapter.pause_print().await);
}

#[tokio::test]
async fn concurrent_commands_are_correlated_independently() {
    init_logging();
    let printer = mock_printer().await;
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", options(printer.addr));

    let (paused, cancelled, files) =
        tokio::join!(adapter.pause_print(), adapter.cancel_print(), adapter.list_files());
    assert!(paused.is_ok());
    assert_eq!(cancelled.unwrap_err().kind(), ErrorKind::CommandRejected);
    assert_eq!(files.unwrap()[0].name, "benchy.gcode");
}

#[tokio::test]
async fn state_comes_from_status_broadcast() {
    init_logging();
    let printer = mock_printer().await;
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", options(printer.addr));

    let state = assert_ok!(adapter.get_state().await);
    assert!(state.connected);
    assert_eq!(state.state, PrinterStatus::Printing);
    assert_eq!(state.tool_temp_actual, Some(221.5));

    let job = assert_ok!(adapter.get_job().await);
    assert_eq!(job.file_name.as_deref(), Some("benchy.gcode"));
    assert_eq!(job.print_time_left_secs, Some(700));
}

#[tokio::test]
async fn upload_is_pulled_by_the_printer() {
    init_logging();
    let mut printer = mock_printer().await;
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", options(printer.addr));

    let dir = tempfile::tempdir().unwrap();
    for round in 0..2u8 {
        let local = dir.path().join(format!("part{}.goo", round));
        let contents = vec![round; 4096];
        std::fs::write(&local, &contents).unwrap();

        let result = assert_ok!(adapter.upload_file(&local, None).await);
        assert!(result.success);
        assert_eq!(result.remote_path, Some(format!("/local/part{}.goo", round)));

        let pulled = tokio::time::timeout(Duration::from_secs(5), printer.pulls.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pulled.body, contents);
        assert_eq!(pulled.announced_size, contents.len() as u64);
        assert_eq!(pulled.announced_md5, hex::encode(Md5::digest(&contents)));
    }
}

#[tokio::test]
async fn rejected_upload_releases_the_listener() {
    init_logging();
    let mut printer = mock_printer().await;
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", options(printer.addr));

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("reject.goo");
    std::fs::write(&local, b"layers").unwrap();

    let err = assert_err!(adapter.upload_file(&local, None).await);
    assert_eq!(err.kind(), ErrorKind::CommandRejected);
    let port = offered_port(&printer.drain_frames());
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn unfetched_upload_times_out_and_releases_the_listener() {
    init_logging();
    let mut printer = mock_printer().await;
    let adapter = SdcpAdapter::new(
        "saturn",
        "127.0.0.1",
        SdcpOptions {
            pull_timeout: Duration::from_millis(300),
            ..options(printer.addr)
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("ignore.goo");
    std::fs::write(&local, b"layers").unwrap();

    let err = assert_err!(adapter.upload_file(&local, None).await);
    assert_eq!(err.kind(), ErrorKind::Timeout);
    let port = offered_port(&printer.drain_frames());
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn temperature_and_raw_commands_are_unsupported() {
    init_logging();
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", SdcpOptions::default());
    assert_eq!(adapter.set_tool_temp(200.0, 0).await.unwrap_err().kind(), ErrorKind::Unsupported);
    assert_eq!(
        adapter.send_raw_commands(&["G28".to_string()]).await.unwrap_err().kind(),
        ErrorKind::Unsupported
    );
}

#[tokio::test]
async fn backoff_clears_after_reconnecting() {
    init_logging();
    // bind then drop to get a port nobody listens on yet
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let adapter = SdcpAdapter::new(
        "saturn",
        "127.0.0.1",
        SdcpOptions {
            backoff_base: Duration::from_millis(100),
            ..options(addr)
        },
    );

    let err = assert_err!(adapter.pause_print().await);
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert_eq!(adapter.connection().backoff().await.attempts(), 1);

    let err = assert_err!(adapter.pause_print().await);
    assert_eq!(err.kind(), ErrorKind::Cooldown);
    assert_eq!(adapter.connection().backoff().await.attempts(), 1);

    // cooldown after one failure is base * 2
    let (app, _frames, _pulls) = printer_app();
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_ok!(adapter.pause_print().await);
    let backoff = adapter.connection().backoff().await;
    assert_eq!(backoff.attempts(), 0);
    assert!(backoff.next_retry().is_none());
}

#[tokio::test]
async fn disconnect_then_reconnect_on_next_call() {
    init_logging();
    let printer = mock_printer().await;
    let adapter = SdcpAdapter::new("saturn", "127.0.0.1", options(printer.addr));

    assert_ok!(adapter.pause_print().await);
    assert!(adapter.connection().is_connected().await);
    adapter.disconnect().await;
    assert!(!adapter.connection().is_connected().await);
    assert_ok!(adapter.pause_print().await);
}
