//! Request-level errors at the relay's HTTP/WebSocket attach boundary
//! (spec §7 "Request-level"). All map to a 4xx response with a short text
//! body; none of them ever reach a session actor.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("missing \"role\" query parameter")]
    MissingRole,
    #[error("\"role\" must be \"server\" or \"client\"")]
    InvalidRole,
    #[error("missing \"serverId\" query parameter")]
    MissingServerId,
    #[error("\"v\" must be \"1\" or \"2\"")]
    InvalidVersion,
}

impl IntoResponse for AttachError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}
