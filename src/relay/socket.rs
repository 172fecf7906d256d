//! Tag-indexed socket set (spec §9 "Tag-indexed socket set"): every attached
//! socket is stored once, indexed by however many tags apply to it (`server`,
//! `server-control`, `server:<cid>`, `client`, `client:<cid>`). Lookups by tag
//! iterate in insertion order so frame delivery preserves arrival order
//! (spec §5 ordering guarantees).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;

/// Role a socket attached under (spec §3 "Socket attachment").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Protocol version a session was opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    V1,
    V2,
}

/// Serialized metadata pinned to every socket on attach (spec §3). Kept as a
/// plain struct rather than hibernation-API state since this relay targets a
/// self-hosted deployment with in-memory session state (spec §9 "Hibernation
/// attachment": "for self-hosted deployments the store is an in-memory map
/// keyed by socket identity").
#[derive(Debug, Clone)]
pub struct Attachment {
    pub server_id: String,
    pub role: Role,
    pub version: Version,
    pub connection_id: Option<String>,
    pub created_at: Instant,
}

/// Monotonic id identifying one attached socket within a relay process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

impl SocketId {
    pub fn next() -> Self {
        SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A frame as read off the underlying WebSocket, forwarded verbatim by the
/// relay — it never inspects the payload (spec §1: "forwarding only opaque
/// encrypted byte frames").
#[derive(Debug, Clone)]
pub enum RelayFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// What a session actor needs to push bytes back out over one attached
/// socket. Mirrors [`crate::channel::Transport`]'s shape at a different
/// layer: the relay forwards opaque frames, the channel encrypts plaintext.
#[async_trait]
pub trait OutboundSocket: Send + Sync {
    /// Enqueues `frame` for delivery. Errs only when the underlying socket
    /// is already gone — callers use this to distinguish "keep going" sends
    /// (log and continue) from the pending-FIFO flush, which must stop and
    /// re-buffer on the first failure (spec §4.C).
    async fn send(&self, frame: RelayFrame) -> Result<(), ()>;
    async fn close(&self, code: u16, reason: &str);
}

pub struct SocketEntry {
    pub attachment: Attachment,
    pub outbound: Box<dyn OutboundSocket>,
}

/// `tag -> ordered socket-ids` plus the reverse `socket-id -> entry` index
/// (spec §9). `by_id_tags` remembers which buckets in `by_tag` each socket
/// lives in, so `remove` only ever touches that socket's own tags — not
/// every bucket in the index — keeping insert/query/remove all O(log n) or
/// better as spec §9 requires.
#[derive(Default)]
pub struct TagIndex {
    by_tag: HashMap<String, Vec<SocketId>>,
    by_id: HashMap<SocketId, SocketEntry>,
    by_id_tags: HashMap<SocketId, Vec<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SocketId, tags: &[String], entry: SocketEntry) {
        for tag in tags {
            self.by_tag.entry(tag.clone()).or_default().push(id);
        }
        self.by_id.insert(id, entry);
        self.by_id_tags.insert(id, tags.to_vec());
    }

    pub fn remove(&mut self, id: SocketId) -> Option<SocketEntry> {
        let entry = self.by_id.remove(&id)?;
        if let Some(tags) = self.by_id_tags.remove(&id) {
            for tag in tags {
                if let Some(ids) = self.by_tag.get_mut(&tag) {
                    ids.retain(|existing| *existing != id);
                    if ids.is_empty() {
                        self.by_tag.remove(&tag);
                    }
                }
            }
        }
        Some(entry)
    }

    pub fn get(&self, id: SocketId) -> Option<&SocketEntry> {
        self.by_id.get(&id)
    }

    /// Sockets tagged `tag`, in the order they attached.
    pub fn tagged(&self, tag: &str) -> impl Iterator<Item = &SocketEntry> {
        self.by_tag
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.by_id.get(id))
    }

    pub fn tagged_ids(&self, tag: &str) -> Vec<SocketId> {
        self.by_tag.get(tag).cloned().unwrap_or_default()
    }

    pub fn count_tagged(&self, tag: &str) -> usize {
        self.by_tag.get(tag).map(Vec::len).unwrap_or(0)
    }
}
