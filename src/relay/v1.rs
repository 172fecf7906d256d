//! Legacy v1 protocol (spec §4.C "v1 protocol (legacy)"): exactly one
//! daemon socket and one client socket per `serverId`, verbatim forwarding,
//! no buffering, no control channel.

use tracing::{debug, warn};

use crate::relay::socket::{OutboundSocket, RelayFrame, Role, SocketId};

struct Attached {
    id: SocketId,
    outbound: Box<dyn OutboundSocket>,
}

#[derive(Default)]
pub struct V1Session {
    server: Option<Attached>,
    client: Option<Attached>,
}

impl V1Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a socket under `role`. Any existing socket of the same role
    /// is closed with 1008 "Replaced by new connection".
    pub async fn attach(&mut self, role: Role, id: SocketId, outbound: Box<dyn OutboundSocket>) {
        let slot = match role {
            Role::Server => &mut self.server,
            Role::Client => &mut self.client,
        };
        if let Some(old) = slot.take() {
            debug!(old_socket = ?old.id, "v1: replacing existing socket");
            old.outbound.close(1008, "Replaced by new connection").await;
        }
        *slot = Some(Attached { id, outbound });
    }

    /// Forwards `frame` verbatim to the opposite role's socket, if any. A
    /// send failure is logged and the other side's socket is left attached
    /// — the peer discovers the drop on its own next send (spec §4.C v1
    /// close semantics: "leave the other side open").
    pub async fn route(&mut self, from: SocketId, frame: RelayFrame) {
        let target = if self.server.as_ref().map(|a| a.id) == Some(from) {
            self.client.as_ref()
        } else if self.client.as_ref().map(|a| a.id) == Some(from) {
            self.server.as_ref()
        } else {
            None
        };
        let Some(target) = target else {
            return;
        };
        if target.outbound.send(frame).await.is_err() {
            warn!("v1: forward failed — destination socket gone");
        }
    }

    pub fn on_close(&mut self, id: SocketId) {
        if self.server.as_ref().map(|a| a.id) == Some(id) {
            self.server = None;
        }
        if self.client.as_ref().map(|a| a.id) == Some(id) {
            self.client = None;
        }
    }

    /// A v1 session exists iff either socket is attached (spec §3 "A session
    /// exists iff at least one socket of any role is attached or frames are
    /// buffered for it" — v1 never buffers, so this reduces to the sockets).
    pub fn is_empty(&self) -> bool {
        self.server.is_none() && self.client.is_none()
    }
}
