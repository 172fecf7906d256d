//! Worker-level routing (spec §4.C): `/ws?...` dispatches to an isolated
//! per-`(version, serverId)` session, `/health` reports liveness, everything
//! else 404s. Grounded in `clawd`'s `rest/mod.rs` (axum `Router`/`with_state`,
//! `TcpListener::bind` + `axum::serve`) and `ipc/mod.rs` (per-connection task
//! spawn) — adapted to axum's `WebSocketUpgrade` extractor instead of the
//! teacher's raw `accept_async_with_config`, since this relay needs ordinary
//! HTTP routing (`/health`) alongside `/ws`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::relay::errors::AttachError;
use crate::relay::session::{SessionHandle, SessionMap};
use crate::relay::socket::{Attachment, OutboundSocket, RelayFrame, Role, Version};

pub struct RelayState {
    sessions: SessionMap,
    config: Arc<RelayConfig>,
}

impl RelayState {
    pub fn new(config: Arc<RelayConfig>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        })
    }

    /// Looks up (or spawns) the session actor for `(version, serverId)`. The
    /// actor is handed a clone of `self.sessions` so it can prune its own
    /// entry once it goes idle (spec §3 — a session stops existing once no
    /// socket is attached and no frames are buffered for it).
    async fn session_for(&self, version: Version, server_id: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry((version, server_id.to_string()))
            .or_insert_with(|| {
                SessionHandle::spawn(version, server_id.to_string(), self.config.clone(), self.sessions.clone())
            })
            .clone()
    }
}

#[derive(Deserialize)]
struct RawParams {
    role: Option<String>,
    #[serde(rename = "serverId")]
    server_id: Option<String>,
    v: Option<String>,
    #[serde(rename = "connectionId")]
    connection_id: Option<String>,
}

fn parse_attachment(params: &RawParams) -> Result<Attachment, AttachError> {
    let role = match params.role.as_deref() {
        Some("server") => Role::Server,
        Some("client") => Role::Client,
        Some(_) => return Err(AttachError::InvalidRole),
        None => return Err(AttachError::MissingRole),
    };

    let server_id = params
        .server_id
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or(AttachError::MissingServerId)?;

    let version = match params.v.as_deref() {
        None | Some("") => Version::V1,
        Some("1") => Version::V1,
        Some("2") => Version::V2,
        Some(_) => return Err(AttachError::InvalidVersion),
    };

    Ok(Attachment {
        server_id,
        role,
        version,
        connection_id: params.connection_id.clone().filter(|s| !s.is_empty()),
        created_at: Instant::now(),
    })
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Handles `/ws`. Deliberately takes the raw [`Request`] and extracts
/// pieces itself, rather than listing `WebSocketUpgrade` as a function
/// parameter: axum's `WebSocketUpgrade` extractor validates the
/// `Connection`/`Upgrade`/`Sec-WebSocket-*` headers *during extraction* and
/// rejects with its own 400 response if they're missing — which would fire
/// before this function's body ever runs and pre-empt the spec's required
/// 426 for a missing upgrade (spec §4.C "absent upgrade → 426"). Checking
/// the header manually first, and only constructing `WebSocketUpgrade`
/// after, ensures the 426 path is actually reachable.
async fn ws_handler(State(state): State<Arc<RelayState>>, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();

    if !is_websocket_upgrade(&parts.headers) {
        return (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response();
    }

    let params = match Query::<RawParams>::from_request_parts(&mut parts, &state).await {
        Ok(Query(p)) => p,
        Err(e) => return e.into_response(),
    };
    let attachment = match parse_attachment(&params) {
        Ok(a) => a,
        Err(e) => return e.into_response(),
    };

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, attachment, state))
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

enum WsCommand {
    Frame(RelayFrame),
    Close(u16, String),
}

struct OutboundSocketImpl {
    tx: mpsc::UnboundedSender<WsCommand>,
}

#[async_trait]
impl OutboundSocket for OutboundSocketImpl {
    async fn send(&self, frame: RelayFrame) -> Result<(), ()> {
        self.tx.send(WsCommand::Frame(frame)).map_err(|_| ())
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(WsCommand::Close(code, reason.to_string()));
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<WsCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WsCommand::Frame(RelayFrame::Text(text)) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            WsCommand::Frame(RelayFrame::Binary(bytes)) => {
                if sink.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            WsCommand::Close(code, reason) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn handle_socket(socket: WebSocket, attachment: Attachment, state: Arc<RelayState>) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WsCommand>();
    tokio::spawn(writer_task(ws_sink, out_rx));

    let version = attachment.version;
    let server_id = attachment.server_id.clone();
    let handle = state.session_for(version, &server_id).await;

    let outbound: Box<dyn OutboundSocket> = Box::new(OutboundSocketImpl { tx: out_tx });
    let Some(socket_id) = handle.attach(attachment, outbound).await else {
        warn!(server_id = %server_id, "relay: session actor gone before attach");
        return;
    };
    debug!(server_id = %server_id, socket_id = ?socket_id, "relay: socket attached");

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => handle.frame(socket_id, RelayFrame::Text(text.to_string())).await,
            Message::Binary(bytes) => handle.frame(socket_id, RelayFrame::Binary(bytes.to_vec())).await,
            Message::Close(_) => break,
            _ => {}
        }
    }
    handle.closed(socket_id).await;
}

pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(config: Arc<RelayConfig>) -> Result<()> {
    let addr: SocketAddr = config.listen.parse()?;
    let state = RelayState::new(config);
    let router = build_router(state);

    info!(addr = %addr, "relay listening (WebSocket + health on same port)");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
