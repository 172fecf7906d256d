//! Per-`(version, serverId)` session actor (spec §5 "single-threaded
//! cooperative per session"): one task owns all mutable session state and
//! processes commands one at a time to completion, so different sessions
//! run in parallel but one session's handlers never interleave with
//! themselves. A tagged `SessionKind::V1 | V2` is picked once at spawn time
//! from the URL `v` parameter (spec §9 "Dual protocol versions in one
//! codebase") — routing logic inside each kind never re-examines version.
//!
//! The actor also owns its own teardown: once a session's socket set and
//! pending buffers go empty (spec §3 "a session exists iff at least one
//! socket of any role is attached or frames are buffered for it"), the
//! actor prunes its own entry from the shared session map and exits,
//! rather than living for the lifetime of the process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::RelayConfig;
use crate::relay::socket::{Attachment, OutboundSocket, RelayFrame, SocketId, Version};
use crate::relay::v1::V1Session;
use crate::relay::v2::V2Session;

/// Shared table of live sessions, keyed by `(protocol_version, serverId)`.
/// Handed to every spawned session actor so it can prune its own entry on
/// teardown — see `run`'s empty-check at the end of the command loop.
pub type SessionMap = Arc<Mutex<HashMap<(Version, String), SessionHandle>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    First,
    Second,
}

pub enum SessionCommand {
    Attach {
        attachment: Attachment,
        outbound: Box<dyn OutboundSocket>,
        reply: oneshot::Sender<SocketId>,
    },
    Frame {
        socket_id: SocketId,
        frame: RelayFrame,
    },
    Close {
        socket_id: SocketId,
    },
    ProbeTick {
        connection_id: String,
        stage: ProbeStage,
    },
}

enum SessionKind {
    V1(V1Session),
    V2(V2Session),
}

/// A cheap, cloneable handle to a running session actor. Every caller
/// (the websocket accept loop) talks to the session only through this.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn spawn(
        version: Version,
        server_id: String,
        config: Arc<RelayConfig>,
        sessions: SessionMap,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let kind = match version {
            Version::V1 => SessionKind::V1(V1Session::new()),
            Version::V2 => SessionKind::V2(V2Session::new(server_id.clone(), config, tx.clone())),
        };
        let key = (version, server_id);
        let self_tx = tx.clone();
        tokio::spawn(run(kind, rx, key, sessions, self_tx));
        SessionHandle { tx }
    }

    pub async fn attach(
        &self,
        attachment: Attachment,
        outbound: Box<dyn OutboundSocket>,
    ) -> Option<SocketId> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Attach {
                attachment,
                outbound,
                reply,
            })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn frame(&self, socket_id: SocketId, frame: RelayFrame) {
        let _ = self.tx.send(SessionCommand::Frame { socket_id, frame }).await;
    }

    pub async fn closed(&self, socket_id: SocketId) {
        let _ = self.tx.send(SessionCommand::Close { socket_id }).await;
    }
}

async fn apply(kind: &mut SessionKind, cmd: SessionCommand) {
    match cmd {
        SessionCommand::Attach {
            attachment,
            outbound,
            reply,
        } => {
            let id = SocketId::next();
            let role = attachment.role;
            match kind {
                SessionKind::V1(s) => s.attach(role, id, outbound).await,
                SessionKind::V2(s) => s.attach(id, attachment, outbound).await,
            }
            let _ = reply.send(id);
        }
        SessionCommand::Frame { socket_id, frame } => match kind {
            SessionKind::V1(s) => s.route(socket_id, frame).await,
            SessionKind::V2(s) => s.route(socket_id, frame).await,
        },
        SessionCommand::Close { socket_id } => match kind {
            SessionKind::V1(s) => s.on_close(socket_id),
            SessionKind::V2(s) => s.on_close(socket_id).await,
        },
        SessionCommand::ProbeTick {
            connection_id,
            stage,
        } => {
            if let SessionKind::V2(s) = kind {
                s.on_probe_tick(connection_id, stage).await;
            }
        }
    }
}

fn is_empty(kind: &SessionKind) -> bool {
    match kind {
        SessionKind::V1(s) => s.is_empty(),
        SessionKind::V2(s) => s.is_empty(),
    }
}

async fn run(
    mut kind: SessionKind,
    mut rx: mpsc::Receiver<SessionCommand>,
    key: (Version, String),
    sessions: SessionMap,
    self_tx: mpsc::Sender<SessionCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        apply(&mut kind, cmd).await;
        if !is_empty(&kind) {
            continue;
        }

        // The session just went idle. Drain anything already queued in our
        // own mailbox before tearing down — a concurrent attach may have
        // raced in while we were deciding to shut down, and dropping it
        // silently would violate spec §3's "exists iff" rule in the other
        // direction (a socket attached to a session that no longer exists).
        while let Ok(cmd) = rx.try_recv() {
            apply(&mut kind, cmd).await;
        }
        if !is_empty(&kind) {
            continue;
        }

        let mut sessions = sessions.lock().await;
        if sessions
            .get(&key)
            .is_some_and(|handle| handle.tx.same_channel(&self_tx))
        {
            sessions.remove(&key);
        }
        return;
    }
}
