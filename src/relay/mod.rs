//! The routing engine: a relay bridges one long-lived daemon with many
//! short-lived clients, forwarding only opaque frames it never inspects for
//! content (spec §1). See `server` for the HTTP/WebSocket entrypoint,
//! `session` for the per-session actor, and `v1`/`v2` for the two protocol
//! dialects it speaks.

pub mod errors;
pub mod pending;
pub mod probe;
pub mod server;
pub mod session;
pub mod socket;
pub mod v1;
pub mod v2;

pub use server::{build_router, serve, RelayState};
pub use socket::{Attachment, RelayFrame, Role, Version};
