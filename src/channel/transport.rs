//! The transport capability the E2EE channel needs from its host.
//!
//! Modeled as a trait rather than the teacher's JS-style assignable
//! `on_message`/`on_close`/`on_error` fields (spec §9 REDESIGN FLAGS): the
//! channel is a state machine that *consumes* incoming frames pushed to it
//! by the caller's own read loop (via [`crate::channel::Channel::handle_incoming`])
//! and only needs to *produce* outgoing sends and closes through this trait.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("transport send failed: {0}")]
pub struct TransportError(pub String);

/// Everything the channel needs to push bytes back out over whatever
/// carries it (a relay WebSocket, a raw TCP stream, anything text-capable).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text frame. The channel only ever sends text (handshake JSON
    /// or base64 ciphertext) — see spec §4.B / §6.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Best-effort close; never expected to fail in a way the caller must
    /// handle (spec §5: "all close calls are synchronous best-effort and
    /// never block the handler").
    async fn close(&self, code: u16, reason: &str);
}
