//! Shared harness for the relay's end-to-end tests: boots a real axum
//! server on an ephemeral loopback port and drives it with real
//! `tokio-tungstenite` WebSocket clients, the way a daemon or client would.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relayd::config::RelayConfig;
use relayd::relay::{build_router, RelayState};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_config(max_pending: usize, probe_initial_ms: u64, probe_second_ms: u64) -> RelayConfig {
    RelayConfig {
        listen: "127.0.0.1:0".to_string(),
        relay_endpoint: "127.0.0.1:0".to_string(),
        max_pending_frames_per_connection: max_pending,
        control_probe_initial_delay_ms: probe_initial_ms,
        control_probe_second_delay_ms: probe_second_ms,
        log: "error".to_string(),
    }
}

/// Starts a relay server on an ephemeral port and returns its base
/// `ws://host:port` URL. The server runs in a background task for the
/// lifetime of the test process.
pub async fn start_server(config: RelayConfig) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = RelayState::new(Arc::new(config));
    let router = build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("ws://{addr}")
}

/// Issues a plain (non-upgrading) HTTP GET against `path` on the server at
/// `base` (a `ws://host:port` URL as returned by [`start_server`]) and
/// returns the response status code. Used to exercise the relay's HTTP
/// attach boundary (spec §4.C attachment URL rules, §6 close codes) without
/// pulling in a full HTTP client dependency.
pub async fn http_get_status(base: &str, path: &str) -> u16 {
    let host = base.trim_start_matches("ws://");
    let mut stream = TcpStream::connect(host).await.expect("tcp connect failed");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("write failed");

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.expect("read failed");
    let text = String::from_utf8_lossy(&buf);
    let status_line = text.lines().next().expect("empty HTTP response");
    // "HTTP/1.1 200 OK" -> 200
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("malformed status line")
}

pub async fn connect(url: &str) -> WsStream {
    let (ws, _response) = connect_async(url).await.expect("failed to connect");
    ws
}

pub async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(Message::Text(text.into())).await.expect("send failed");
}

/// Reads frames until a `Text` frame arrives, skipping protocol-level
/// ping/pong frames tungstenite may surface.
pub async fn read_text(ws: &mut WsStream) -> String {
    loop {
        match ws.next().await.expect("stream ended unexpectedly") {
            Ok(Message::Text(t)) => return t.to_string(),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(other) => panic!("expected a text frame, got {other:?}"),
            Err(e) => panic!("websocket error: {e}"),
        }
    }
}

/// Reads frames until a `Close` frame arrives and asserts its code.
pub async fn expect_close(ws: &mut WsStream, code: u16) {
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), code, "unexpected close code");
                return;
            }
            Some(Ok(Message::Close(None))) => panic!("closed without a close frame"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("websocket error: {e}"),
            None => panic!("stream ended without a close frame"),
        }
    }
}

/// Asserts no frame of any kind arrives within `dur` — used to show a
/// socket was left open rather than force-closed.
pub async fn expect_silence(ws: &mut WsStream, dur: Duration) {
    let res = tokio::time::timeout(dur, ws.next()).await;
    assert!(res.is_err(), "expected silence for {dur:?}, got {res:?}");
}
