//! Integration tests for the streaming session coordinator
//!
//! Each test scripts the server side of the protocol over a real
//! WebSocket on a loopback listener, then observes the session record
//! through the public handle.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_test::assert_ok;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use platewatch::protocol::Progress;
use platewatch::session::{SessionConfig, StreamingSession, StreamingStatus};
use platewatch::{PlatewatchError, ProcessingOptions, StreamingState};

async fn bind_server() -> (TcpListener, SessionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = SessionConfig {
        ws_base: format!("ws://{}", addr),
        api_base: format!("http://{}", addr),
        reconnect_interval: Duration::from_millis(100),
        max_reconnect_attempts: 2,
    };
    (listener, config)
}

async fn accept_client(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Accept a client and record the request path it connected with
async fn accept_client_capturing_path(
    listener: &TcpListener,
    paths: &Arc<Mutex<Vec<String>>>,
) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    let paths = Arc::clone(paths);
    tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        paths.lock().unwrap().push(req.uri().path().to_string());
        Ok(resp)
    })
    .await
    .unwrap()
}

fn envelope(value: serde_json::Value) -> Message {
    Message::Text(value.to_string())
}

fn update_frame(processed: u64, frame_number: u64) -> Message {
    envelope(json!({
        "type": "streaming_update",
        "data": {
            "progress": {"processed": processed, "total": 100, "percent": processed as f64},
            "processing_speed": 24.0,
            "frame": {
                "image": "",
                "frame_number": frame_number,
                "timestamp": frame_number as f64 / 30.0,
                "processing_time": 5.0
            },
            "detections": [
                {"plate_text": format!("PL{:03}", frame_number), "confidence": 0.9}
            ],
            "summary": {
                "best_plates": [
                    {"plate_text": format!("PL{:03}", frame_number), "confidence": 0.9, "seen_count": frame_number}
                ]
            }
        }
    }))
}

async fn wait_for<F>(session: &StreamingSession, timeout_ms: u64, pred: F) -> StreamingState
where
    F: Fn(&StreamingState) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let state = session.state().await;
        if pred(&state) {
            return state;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "condition not reached within {}ms; last state: {:?}",
                timeout_ms, state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn end_to_end_scenario_tracks_latest_update() {
    let (listener, config) = bind_server().await;
    let session = StreamingSession::new(config);
    session.connect().await;

    let mut server = accept_client(&listener).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);

    server
        .send(envelope(json!({"type": "streaming_started"})))
        .await
        .unwrap();
    for (processed, frame) in [(10, 1), (20, 2), (30, 3)] {
        server.send(update_frame(processed, frame)).await.unwrap();
    }
    server
        .send(envelope(json!({"type": "streaming_completed"})))
        .await
        .unwrap();

    let state = wait_for(&session, 2000, |s| s.status == StreamingStatus::Completed).await;
    // The record reflects only the most recent update, not an accumulation
    assert_eq!(state.progress.processed, 30);
    assert_eq!(state.progress.percent, 30.0);
    assert_eq!(state.current_frame.unwrap().frame_number, 3);
    assert_eq!(state.detections.len(), 1);
    assert_eq!(state.detections[0].plate_text.as_deref(), Some("PL003"));
    assert_eq!(state.unique_plates.len(), 1);
    assert!(!state.is_streaming);

    session.disconnect().await;
}

#[tokio::test]
async fn disconnect_hard_resets_session_record() {
    let (listener, config) = bind_server().await;
    let session = StreamingSession::new(config);
    session.connect().await;

    let mut server = accept_client(&listener).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);

    server
        .send(envelope(json!({"type": "streaming_started"})))
        .await
        .unwrap();
    server.send(update_frame(40, 4)).await.unwrap();
    wait_for(&session, 2000, |s| {
        s.status == StreamingStatus::Processing && !s.detections.is_empty()
    })
    .await;

    session.disconnect().await;

    let state = session.state().await;
    assert_eq!(state.status, StreamingStatus::Disconnected);
    assert!(!state.is_connected);
    assert!(!state.is_streaming);
    assert!(state.session_id.is_empty());
    assert!(state.detections.is_empty());
    assert!(state.unique_plates.is_empty());
    assert!(state.current_frame.is_none());
    assert_eq!(state.progress, Progress::default());

    // The server sees a normal close frame
    let msg = timeout(Duration::from_secs(1), server.next())
        .await
        .expect("close frame not received")
        .unwrap()
        .unwrap();
    match msg {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn intentional_disconnect_suppresses_reconnect() {
    let (listener, config) = bind_server().await;
    let session = StreamingSession::new(config);
    session.connect().await;

    let _server = accept_client(&listener).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);

    session.disconnect().await;
    assert!(!session.retry_pending());

    // No reconnection attempt within several retry intervals
    let attempt = timeout(Duration::from_millis(400), listener.accept()).await;
    assert!(attempt.is_err(), "unexpected reconnection attempt");
}

#[tokio::test]
async fn reconnect_attempts_are_bounded() {
    let (listener, config) = bind_server().await;
    let session = StreamingSession::new(config);
    session.connect().await;

    let server = accept_client(&listener).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);

    // Abrupt drop, then refuse every retry: with max_reconnect_attempts=2
    // the coordinator gives up after two failed attempts
    drop(server);
    drop(listener);

    let state = wait_for(&session, 3000, |s| {
        s.error
            .as_deref()
            .map_or(false, |e| e.contains("exhausted"))
    })
    .await;
    assert_eq!(state.status, StreamingStatus::Disconnected);
    assert!(!session.retry_pending());
}

#[tokio::test]
async fn successful_open_resets_attempt_counter() {
    let (listener, mut config) = bind_server().await;
    config.max_reconnect_attempts = 1;
    let session = StreamingSession::new(config);
    session.connect().await;

    let server = accept_client(&listener).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);
    drop(server);

    // Retry succeeds, which must reset the attempt counter
    let server = accept_client(&listener).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(server);

    // With a stale counter this second retry would exceed max_attempts=1
    // and never arrive
    let third = timeout(Duration::from_secs(2), accept_client(&listener)).await;
    assert!(third.is_ok(), "attempt counter was not reset on open");

    session.disconnect().await;
}

#[tokio::test]
async fn session_id_persists_across_reconnects() {
    let (listener, config) = bind_server().await;
    let session = StreamingSession::new(config);
    let paths = Arc::new(Mutex::new(Vec::new()));

    session.connect().await;
    let server = accept_client_capturing_path(&listener, &paths).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);
    drop(server);

    let _server = accept_client_capturing_path(&listener, &paths).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    {
        let paths = paths.lock().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].starts_with("/api/v1/streaming/ws/"));
        // The same logical session reconnects under the same identifier
        assert_eq!(paths[0], paths[1]);
    }

    // A full disconnect/connect cycle starts a fresh logical session
    session.disconnect().await;
    session.connect().await;
    let _server2 = accept_client_capturing_path(&listener, &paths).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);

    let paths = paths.lock().unwrap();
    assert_eq!(paths.len(), 3);
    assert_ne!(paths[0], paths[2]);
}

#[tokio::test]
async fn commands_are_confirmation_driven() {
    let (listener, config) = bind_server().await;
    let session = StreamingSession::new(config);
    session.connect().await;

    let mut server = accept_client(&listener).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);

    server
        .send(envelope(json!({"type": "streaming_started"})))
        .await
        .unwrap();
    wait_for(&session, 2000, |s| s.status == StreamingStatus::Processing).await;

    assert!(session.pause().await);
    // The record changes only on the inbound confirmation
    assert_eq!(session.state().await.status, StreamingStatus::Processing);

    let msg = timeout(Duration::from_secs(1), server.next())
        .await
        .expect("command not received")
        .unwrap()
        .unwrap();
    assert_eq!(msg.into_text().unwrap(), r#"{"type":"pause_processing"}"#);

    server
        .send(envelope(json!({"type": "processing_paused"})))
        .await
        .unwrap();
    let state = wait_for(&session, 2000, |s| s.status == StreamingStatus::Paused).await;
    assert!(state.is_paused);
    assert!(state.is_streaming);

    session.disconnect().await;
}

#[tokio::test]
async fn send_fails_cleanly_when_disconnected() {
    let (_listener, config) = bind_server().await;
    let session = StreamingSession::new(config);

    assert!(!session.pause().await);
    assert!(!session.request_status().await);
}

#[tokio::test]
async fn handler_panic_blocks_neither_siblings_nor_state() {
    let (listener, config) = bind_server().await;
    let session = StreamingSession::new(config);
    session.connect().await;

    let mut server = accept_client(&listener).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);

    let calls = Arc::new(AtomicUsize::new(0));
    let _h1 = session.subscribe("streaming_update", |_| panic!("boom"));
    let counter = Arc::clone(&calls);
    let _h2 = session.subscribe("streaming_update", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    server.send(update_frame(50, 5)).await.unwrap();

    // The state transition ran despite the panicking handler
    let state = wait_for(&session, 2000, |s| s.progress.processed == 50).await;
    assert_eq!(state.current_frame.unwrap().frame_number, 5);
    // And so did the sibling handler, exactly once
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    session.disconnect().await;
}

#[tokio::test]
async fn unknown_tags_reach_subscribers_without_state_change() {
    let (listener, config) = bind_server().await;
    let session = StreamingSession::new(config);
    session.connect().await;

    let mut server = accept_client(&listener).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let _h = session.subscribe("system_message", move |data| {
        assert_eq!(data["text"], "maintenance at midnight");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    server
        .send(envelope(json!({
            "type": "system_message",
            "data": {"text": "maintenance at midnight"}
        })))
        .await
        .unwrap();

    timeout(Duration::from_secs(2), async {
        while seen.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber never saw the message");

    let state = session.state().await;
    assert_eq!(state.status, StreamingStatus::Connected);

    session.disconnect().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_disturbing_the_stream() {
    let (listener, config) = bind_server().await;
    let session = StreamingSession::new(config);
    session.connect().await;

    let mut server = accept_client(&listener).await;
    tokio_test::assert_ok!(session.wait_connected(Duration::from_secs(2)).await);

    server
        .send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();
    server
        .send(envelope(json!({"type": "streaming_started"})))
        .await
        .unwrap();

    // The well-formed frame after the garbage still lands
    let state = wait_for(&session, 2000, |s| s.status == StreamingStatus::Processing).await;
    assert!(state.is_streaming);

    session.disconnect().await;
}

#[tokio::test]
async fn start_streaming_requires_connection() {
    let session = StreamingSession::new(SessionConfig {
        ws_base: "ws://127.0.0.1:9".to_string(),
        api_base: "http://127.0.0.1:9".to_string(),
        reconnect_interval: Duration::from_millis(100),
        max_reconnect_attempts: 1,
    });

    let err = session
        .start_streaming(Path::new("nonexistent.mp4"), &ProcessingOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PlatewatchError::InvalidState(_)));

    // The record is untouched by the rejected command
    let state = session.state().await;
    assert_eq!(state.status, StreamingStatus::Disconnected);
    assert!(state.error.is_none());
}
