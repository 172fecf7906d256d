//! v2 multi-connection protocol (spec §4.C "v2 protocol"): a daemon control
//! socket, per-`connectionId` daemon data sockets, and any number of client
//! sockets per `connectionId`, plus the control-liveness probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::relay::probe;
use crate::relay::session::{ProbeStage, SessionCommand};
use crate::relay::socket::{Attachment, OutboundSocket, RelayFrame, Role, SocketId};
use crate::relay::pending::PendingFifo;

struct Attached {
    id: SocketId,
    outbound: Box<dyn OutboundSocket>,
}

/// Per-socket bookkeeping needed at close time: which role it attached under
/// and, if any, the `connectionId` it belongs to.
#[derive(Clone)]
struct SocketMetaOwned {
    role: Role,
    connection_id: Option<String>,
}

pub struct V2Session {
    server_id: String,
    config: Arc<RelayConfig>,
    self_tx: mpsc::Sender<SessionCommand>,

    control: Option<Attached>,
    data: HashMap<String, Attached>,
    clients: HashMap<String, Vec<Attached>>,
    pending: HashMap<String, PendingFifo>,
    sockets: HashMap<SocketId, SocketMetaOwned>,
}

fn mint_connection_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("conn_{}", hex::encode(bytes))
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

impl V2Session {
    pub fn new(server_id: String, config: Arc<RelayConfig>, self_tx: mpsc::Sender<SessionCommand>) -> Self {
        Self {
            server_id,
            config,
            self_tx,
            control: None,
            data: HashMap::new(),
            clients: HashMap::new(),
            pending: HashMap::new(),
            sockets: HashMap::new(),
        }
    }

    pub async fn attach(&mut self, id: SocketId, attachment: Attachment, outbound: Box<dyn OutboundSocket>) {
        match (attachment.role, attachment.connection_id) {
            (Role::Server, None) => self.attach_control(id, outbound).await,
            (Role::Server, Some(cid)) => self.attach_data(id, cid, outbound).await,
            (Role::Client, cid) => {
                let cid = cid.unwrap_or_else(mint_connection_id);
                self.attach_client(id, cid, outbound).await
            }
        }
    }

    async fn attach_control(&mut self, id: SocketId, outbound: Box<dyn OutboundSocket>) {
        if let Some(old) = self.control.take() {
            self.sockets.remove(&old.id);
            old.outbound.close(1008, "Replaced by new connection").await;
        }
        self.sockets.insert(
            id,
            SocketMetaOwned {
                role: Role::Server,
                connection_id: None,
            },
        );
        self.control = Some(Attached { id, outbound });
        info!(server_id = %self.server_id, "v2: daemon control attached");

        let connection_ids: Vec<String> = self.clients.keys().cloned().collect();
        self.notify_control(serde_json::json!({
            "type": "sync",
            "connectionIds": connection_ids,
        }))
        .await;
    }

    async fn attach_data(&mut self, id: SocketId, cid: String, outbound: Box<dyn OutboundSocket>) {
        if let Some(old) = self.data.remove(&cid) {
            self.sockets.remove(&old.id);
            old.outbound.close(1008, "Replaced by new connection").await;
        }
        self.sockets.insert(
            id,
            SocketMetaOwned {
                role: Role::Server,
                connection_id: Some(cid.clone()),
            },
        );
        debug!(server_id = %self.server_id, connection_id = %cid, "v2: daemon data socket attached");

        // Flush any frames buffered while no data socket existed for `cid`,
        // in order. On the first failed send, re-buffer at the front and
        // stop — the next attach retries (spec §4.C).
        if let Some(fifo) = self.pending.get_mut(&cid) {
            while let Some(frame) = fifo.pop_front() {
                if outbound.send(frame.clone()).await.is_err() {
                    fifo.push_front(frame);
                    warn!(connection_id = %cid, "v2: pending flush send failed, stopping");
                    break;
                }
            }
            if fifo.is_empty() {
                self.pending.remove(&cid);
            }
        }

        self.data.insert(cid, Attached { id, outbound });
    }

    async fn attach_client(&mut self, id: SocketId, cid: String, outbound: Box<dyn OutboundSocket>) {
        self.sockets.insert(
            id,
            SocketMetaOwned {
                role: Role::Client,
                connection_id: Some(cid.clone()),
            },
        );
        self.clients.entry(cid.clone()).or_default().push(Attached { id, outbound });
        debug!(server_id = %self.server_id, connection_id = %cid, "v2: client attached");

        self.notify_control(serde_json::json!({
            "type": "connected",
            "connectionId": cid,
        }))
        .await;

        probe::schedule(
            self.self_tx.clone(),
            cid,
            ProbeStage::First,
            Duration::from_millis(self.config.control_probe_initial_delay_ms),
        );
    }

    pub async fn route(&mut self, from: SocketId, frame: RelayFrame) {
        let Some(meta) = self.sockets.get(&from).cloned() else {
            return;
        };
        match (meta.role, meta.connection_id) {
            (Role::Client, Some(cid)) => self.route_client_frame(cid, frame).await,
            (Role::Server, Some(cid)) => self.route_daemon_data_frame(cid, frame).await,
            (Role::Server, None) => self.route_daemon_control_frame(frame).await,
            _ => {}
        }
    }

    async fn route_client_frame(&mut self, cid: String, frame: RelayFrame) {
        if let Some(data) = self.data.get(&cid) {
            if data.outbound.send(frame).await.is_err() {
                warn!(connection_id = %cid, "v2: client->daemon forward failed");
            }
            return;
        }
        let max = self.config.max_pending_frames_per_connection;
        self.pending
            .entry(cid)
            .or_insert_with(|| PendingFifo::new(max))
            .push_back(frame);
    }

    async fn route_daemon_data_frame(&mut self, cid: String, frame: RelayFrame) {
        let Some(clients) = self.clients.get(&cid) else {
            return;
        };
        for client in clients {
            if client.outbound.send(frame.clone()).await.is_err() {
                warn!(connection_id = %cid, "v2: daemon->client forward failed; continuing");
            }
        }
    }

    async fn route_daemon_control_frame(&mut self, frame: RelayFrame) {
        let RelayFrame::Text(text) = frame else {
            return;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            return;
        };
        if value.get("type").and_then(Value::as_str) == Some("ping") {
            self.notify_control(serde_json::json!({
                "type": "pong",
                "ts": now_millis(),
            }))
            .await;
        }
    }

    /// Sends `payload` to the daemon control socket. On failure, closes it
    /// with 1011 "Control send failed" (spec §4.C).
    async fn notify_control(&mut self, payload: Value) {
        let Some(control) = &self.control else {
            return;
        };
        let text = payload.to_string();
        if control.outbound.send(RelayFrame::Text(text)).await.is_err() {
            warn!(server_id = %self.server_id, "v2: control send failed");
            if let Some(control) = self.control.take() {
                self.sockets.remove(&control.id);
                control.outbound.close(1011, "Control send failed").await;
            }
        }
    }

    pub async fn on_close(&mut self, id: SocketId) {
        let Some(meta) = self.sockets.remove(&id) else {
            return;
        };
        match (meta.role, meta.connection_id) {
            (Role::Server, None) => {
                if self.control.as_ref().map(|a| a.id) == Some(id) {
                    self.control = None;
                    debug!(server_id = %self.server_id, "v2: control closed, no cascade");
                }
            }
            (Role::Server, Some(cid)) => {
                if self.data.get(&cid).map(|a| a.id) == Some(id) {
                    self.data.remove(&cid);
                    if let Some(clients) = self.clients.remove(&cid) {
                        for client in clients {
                            self.sockets.remove(&client.id);
                            client.outbound.close(1012, "Server disconnected").await;
                        }
                    }
                }
            }
            (Role::Client, Some(cid)) => {
                let mut now_empty = false;
                if let Some(list) = self.clients.get_mut(&cid) {
                    list.retain(|c| c.id != id);
                    now_empty = list.is_empty();
                }
                if now_empty {
                    self.clients.remove(&cid);
                    self.pending.remove(&cid);
                    if let Some(data) = self.data.remove(&cid) {
                        self.sockets.remove(&data.id);
                        data.outbound.close(1001, "Client disconnected").await;
                    }
                    self.notify_control(serde_json::json!({
                        "type": "disconnected",
                        "connectionId": cid,
                    }))
                    .await;
                }
            }
            _ => {}
        }
    }

    /// A v2 session exists iff some socket is attached or some `connectionId`
    /// still has buffered frames waiting for a data socket (spec §3 "A
    /// session exists iff at least one socket of any role is attached or
    /// frames are buffered for it").
    pub fn is_empty(&self) -> bool {
        self.control.is_none() && self.data.is_empty() && self.clients.is_empty() && self.pending.is_empty()
    }

    pub async fn on_probe_tick(&mut self, cid: String, stage: ProbeStage) {
        let client_connected = self.clients.contains_key(&cid);
        let data_exists = self.data.contains_key(&cid);
        if !client_connected || data_exists {
            return;
        }
        match stage {
            ProbeStage::First => {
                let connection_ids: Vec<String> = self.clients.keys().cloned().collect();
                self.notify_control(serde_json::json!({
                    "type": "sync",
                    "connectionIds": connection_ids,
                }))
                .await;
                probe::schedule(
                    self.self_tx.clone(),
                    cid,
                    ProbeStage::Second,
                    Duration::from_millis(self.config.control_probe_second_delay_ms),
                );
            }
            ProbeStage::Second => {
                if let Some(control) = self.control.take() {
                    self.sockets.remove(&control.id);
                    control.outbound.close(1011, "Control unresponsive").await;
                }
            }
        }
    }
}
