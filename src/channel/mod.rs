//! End-to-end encrypted channel: handshake orchestration, open-state framing,
//! and re-handshake detection.
//!
//! Generalizes the teacher's `Arc<Mutex<Option<RelayE2e>>>` pattern
//! (`clawd`'s `relay/mod.rs`) into an explicit state machine with its own
//! handshake and rekey logic, since spec §4.B requires a full
//! `handshaking → open → closed` lifecycle (not just "present or absent")
//! plus client-initiated retries and daemon-side re-hello detection that
//! the teacher's single relay connection never needed.

mod wire;
pub mod transport;

pub use transport::{Transport, TransportError};
pub use wire::RawFrame;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{self, CryptoError, Keypair, SharedKey};
use wire::{HandshakeFrame, Inspected};

/// Upper bound on the outgoing-send queue buffered while `handshaking`.
/// Oldest frame is dropped on overflow (spec §4.B "Outgoing sends").
const MAX_PENDING_SENDS: usize = 200;

const RETRY_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid handshake: {0}")]
    InvalidHello(String),
    #[error("received plaintext frame on encrypted channel: {0}")]
    PlaintextFrameOnEncryptedChannel(String),
    #[error("decrypt failed: {0}")]
    DecryptError(#[from] CryptoError),
    #[error("channel is closed")]
    ChannelClosed,
    #[error("transport send failed: {0}")]
    Transport(String),
}

/// Either a byte string or a UTF-8 text string — spec §4.A notes the
/// channel preserves which kind of plaintext a caller handed to `send`.
#[derive(Debug, Clone)]
pub enum Plaintext {
    Bytes(Vec<u8>),
    Text(String),
}

impl Plaintext {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Plaintext::Bytes(b) => b,
            Plaintext::Text(t) => t.into_bytes(),
        }
    }
}

/// Application-facing events the channel fires. Default no-op methods, the
/// way a caller only implements the hooks it cares about.
pub trait ChannelEvents: Send + Sync {
    fn on_open(&self) {}
    fn on_message(&self, _plaintext: Vec<u8>) {}
    fn on_close(&self, _code: u16, _reason: String) {}
    fn on_error(&self, _message: String) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Handshaking,
    Open,
    Closed,
}

enum Side {
    Client {
        /// base64 of our ephemeral public key, resent on every retry.
        hello_key_b64: String,
    },
    Daemon {
        secret: StaticSecret,
        public: PublicKey,
    },
}

struct Inner {
    state: State,
    shared_key: Option<SharedKey>,
    pending: VecDeque<Plaintext>,
}

pub struct Channel {
    transport: Arc<dyn Transport>,
    events: Arc<dyn ChannelEvents>,
    side: Side,
    inner: Mutex<Inner>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.retry_task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Channel {
    // ─── Construction ──────────────────────────────────────────────────────

    /// Client-side construction (spec §4.B "Client construction"). Derives
    /// the shared key against the daemon's pinned public key, enters
    /// `handshaking`, and sends (then periodically retries) the hello.
    /// Never fails on a transient send error — those are reported through
    /// `events.on_error` instead of aborting construction.
    pub async fn create_client(
        transport: Arc<dyn Transport>,
        daemon_public_b64: &str,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Arc<Channel>, ChannelError> {
        let daemon_public = crypto::public_key_from_b64(daemon_public_b64)
            .map_err(|e| ChannelError::InvalidHello(e.to_string()))?;
        let kp = crypto::generate_keypair();
        let shared = crypto::derive_shared(&kp.secret, &daemon_public);
        let hello_key_b64 = crypto::b64_encode(kp.public.as_bytes());

        let channel = Arc::new(Channel {
            transport,
            events,
            side: Side::Client { hello_key_b64 },
            inner: Mutex::new(Inner {
                state: State::Handshaking,
                shared_key: Some(shared),
                pending: VecDeque::new(),
            }),
            retry_task: Mutex::new(None),
        });

        channel.send_hello().await;
        channel.spawn_retry();
        Ok(channel)
    }

    /// Daemon-side construction (spec §4.B "Daemon construction"). Reads
    /// exactly the first frame off `incoming` as the client's hello; any
    /// other shape rejects with a diagnostic. On success the channel opens
    /// immediately — there is no further window in which frames could
    /// arrive un-handled, so unlike the JS original there is no need to
    /// buffer messages that race the (here, synchronous) key derivation.
    pub async fn create_daemon<S>(
        transport: Arc<dyn Transport>,
        keypair: Keypair,
        events: Arc<dyn ChannelEvents>,
        incoming: &mut S,
    ) -> Result<Arc<Channel>, ChannelError>
    where
        S: futures_util::Stream<Item = RawFrame> + Unpin + Send,
    {
        let first = incoming
            .next()
            .await
            .ok_or_else(|| ChannelError::InvalidHello("transport closed before handshake".into()))?;

        let client_key_b64 = wire::parse_hello_strict(&first)?;
        let client_public = crypto::public_key_from_b64(&client_key_b64)
            .map_err(|e| ChannelError::InvalidHello(e.to_string()))?;
        let shared = crypto::derive_shared(&keypair.secret, &client_public);

        let channel = Arc::new(Channel {
            transport,
            events,
            side: Side::Daemon {
                secret: keypair.secret,
                public: keypair.public,
            },
            inner: Mutex::new(Inner {
                state: State::Open,
                shared_key: Some(shared),
                pending: VecDeque::new(),
            }),
            retry_task: Mutex::new(None),
        });

        channel
            .transport
            .send_text(HandshakeFrame::Ready.to_json())
            .await
            .map_err(|e| ChannelError::Transport(e.0))?;
        channel.events.on_open();
        Ok(channel)
    }

    // ─── Outgoing ───────────────────────────────────────────────────────────

    /// Sends `plaintext` over the channel. Buffers (bounded, drop-oldest)
    /// while `handshaking`, encrypts-and-sends while `open`, and fails with
    /// `ChannelClosed` once closed — spec §4.B "Outgoing sends".
    pub async fn send(self: &Arc<Self>, plaintext: Plaintext) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            State::Closed => Err(ChannelError::ChannelClosed),
            State::Handshaking => {
                if inner.pending.len() >= MAX_PENDING_SENDS {
                    inner.pending.pop_front();
                }
                inner.pending.push_back(plaintext);
                Ok(())
            }
            State::Open => {
                let key = inner
                    .shared_key
                    .clone()
                    .expect("shared key is always present once open");
                drop(inner);
                self.encrypt_and_send(&key, plaintext).await
            }
        }
    }

    async fn encrypt_and_send(&self, key: &SharedKey, plaintext: Plaintext) -> Result<(), ChannelError> {
        let framed = crypto::encrypt(key, &plaintext.into_bytes())?;
        let payload_b64 = crypto::b64_encode(&framed);
        self.transport
            .send_text(payload_b64)
            .await
            .map_err(|e| ChannelError::Transport(e.0))
    }

    async fn flush_pending(self: &Arc<Self>) {
        let (key, drained) = {
            let mut inner = self.inner.lock().await;
            let key = match inner.shared_key.clone() {
                Some(k) => k,
                None => return,
            };
            (key, std::mem::take(&mut inner.pending))
        };
        for plaintext in drained {
            if let Err(e) = self.encrypt_and_send(&key, plaintext).await {
                warn!("channel: failed to flush queued send: {e}");
            }
        }
    }

    // ─── Handshake retry (client only) ─────────────────────────────────────

    async fn send_hello(&self) {
        let Side::Client { hello_key_b64 } = &self.side else {
            return;
        };
        let frame = HandshakeFrame::hello(hello_key_b64.clone()).to_json();
        if let Err(e) = self.transport.send_text(frame).await {
            self.events.on_error(format!("failed to send e2ee_hello: {e}"));
        }
    }

    fn spawn_retry(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RETRY_INTERVAL).await;
                let Some(channel) = weak.upgrade() else {
                    return;
                };
                let still_handshaking = { channel.inner.lock().await.state == State::Handshaking };
                if !still_handshaking {
                    return;
                }
                channel.send_hello().await;
            }
        });
        // spawn_retry is only ever called right after construction, before
        // any other task could hold the lock, so try_lock cannot contend.
        if let Ok(mut guard) = self.retry_task.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn cancel_retry(&self) {
        if let Some(handle) = self.retry_task.lock().await.take() {
            handle.abort();
        }
    }

    // ─── Incoming ───────────────────────────────────────────────────────────

    /// Feeds one raw frame from the caller's own read loop into the channel
    /// state machine. This is the "consume from a sink" half of spec §9's
    /// redesign of the teacher's assignable-callback transport.
    pub async fn handle_incoming(self: &Arc<Self>, frame: RawFrame) {
        let state = self.inner.lock().await.state;
        match state {
            State::Closed => {}
            State::Handshaking => self.handle_handshaking_frame(frame).await,
            State::Open => self.handle_open_frame(frame).await,
        }
    }

    async fn handle_handshaking_frame(self: &Arc<Self>, frame: RawFrame) {
        match wire::inspect(&frame) {
            Inspected::Recognized(HandshakeFrame::Ready) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.state = State::Open;
                }
                self.cancel_retry().await;
                self.events.on_open();
                self.flush_pending().await;
            }
            // Any other frame received while handshaking is ignored, not
            // treated as an error — spec §4.B client construction step 6.
            _ => {}
        }
    }

    async fn handle_open_frame(self: &Arc<Self>, frame: RawFrame) {
        match wire::inspect(&frame) {
            Inspected::Recognized(HandshakeFrame::Hello { key }) => self.handle_rehello(key).await,
            Inspected::Recognized(HandshakeFrame::Ready) => {
                // Ignored in open state on both sides.
            }
            Inspected::UnrecognizedJson(v) => {
                let observed = v
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("<missing>")
                    .to_string();
                self.close_fatal(
                    1011,
                    format!("received plaintext frame on encrypted channel (type={observed})"),
                )
                .await;
            }
            Inspected::NotJson => self.handle_ciphertext(frame).await,
        }
    }

    /// Spec §4.B open-state step 1: `e2ee_hello` arriving on an already-open
    /// channel is either a retry (same key — resend ready, no rekey) or a
    /// logical client reconnect (different key — rekey and drop the queue).
    /// Ignored entirely on the client side.
    async fn handle_rehello(self: &Arc<Self>, client_key_b64: String) {
        let Side::Daemon { secret, .. } = &self.side else {
            return;
        };
        let client_public = match crypto::public_key_from_b64(&client_key_b64) {
            Ok(k) => k,
            Err(e) => {
                self.close_fatal(1011, format!("invalid e2ee_hello key on rehello: {e}"))
                    .await;
                return;
            }
        };
        let new_key = crypto::derive_shared(secret, &client_public);

        let same_key = {
            let inner = self.inner.lock().await;
            inner.shared_key.as_ref() == Some(&new_key)
        };

        if same_key {
            debug!("channel: rehello with unchanged key — resending e2ee_ready, no rekey");
        } else {
            info!("channel: rehello with new key — rekeying (open -> handshaking -> open)");
            let mut inner = self.inner.lock().await;
            inner.state = State::Handshaking;
            inner.shared_key = Some(new_key);
            inner.pending.clear();
            inner.state = State::Open;
        }

        if let Err(e) = self
            .transport
            .send_text(HandshakeFrame::Ready.to_json())
            .await
        {
            self.events.on_error(format!("failed to send e2ee_ready on rehello: {e}"));
        }
    }

    async fn handle_ciphertext(self: &Arc<Self>, frame: RawFrame) {
        let framed_bytes = match decode_ciphertext_envelope(&frame) {
            Ok(b) => b,
            Err(e) => {
                self.close_fatal(1011, format!("malformed ciphertext frame: {e}")).await;
                return;
            }
        };

        let key = {
            let inner = self.inner.lock().await;
            inner.shared_key.clone()
        };
        let Some(key) = key else {
            self.close_fatal(1011, "no shared key established".to_string()).await;
            return;
        };

        match crypto::decrypt(&key, &framed_bytes) {
            Ok(plaintext) => self.events.on_message(plaintext),
            Err(e) => self.close_fatal(1011, format!("decrypt failed: {e}")).await,
        }
    }

    /// Any protocol violation or decrypt failure is fatal: close the
    /// transport with 1011 and the error message, and — because higher
    /// layers must see a clean close to know to reconnect — never emit
    /// `on_error` for this path (spec §4.B rationale).
    async fn close_fatal(self: &Arc<Self>, code: u16, reason: String) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = State::Closed;
        }
        self.cancel_retry().await;
        self.transport.close(code, &reason).await;
        self.events.on_close(code, reason);
    }
}

/// Spec §4.B open-state step 2: text frames are base64; binary frames try
/// UTF-8 → base64 first and fall back to raw bytes.
fn decode_ciphertext_envelope(frame: &RawFrame) -> Result<Vec<u8>, CryptoError> {
    match frame {
        RawFrame::Text(t) => crypto::b64_decode(t),
        RawFrame::Binary(b) => match std::str::from_utf8(b) {
            Ok(t) => crypto::b64_decode(t).or_else(|_| Ok(b.clone())),
            Err(_) => Ok(b.clone()),
        },
    }
}

#[cfg(test)]
mod tests;
