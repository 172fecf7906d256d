//! On-wire frame shapes for the E2EE channel.
//!
//! Only two plaintext frames exist (`e2ee_hello`, `e2ee_ready`); every other
//! application frame is opaque base64 ciphertext text. See spec §4.B / §6.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChannelError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum HandshakeFrame {
    #[serde(rename = "e2ee_hello")]
    Hello {
        /// base64 (standard alphabet) encoded 32-byte X25519 public key.
        key: String,
    },
    #[serde(rename = "e2ee_ready")]
    Ready,
}

impl HandshakeFrame {
    pub fn hello(key_b64: String) -> Self {
        HandshakeFrame::Hello { key: key_b64 }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("HandshakeFrame is always serializable")
    }
}

/// A raw frame as delivered by the underlying transport, preserving whether
/// it arrived as a text or binary frame (spec §4.B step 2: the decode path
/// differs for each).
#[derive(Debug, Clone)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// The outcome of inspecting an incoming raw frame for a plaintext JSON
/// handshake/control shape.
pub enum Inspected {
    /// Not JSON-shaped (did not decode as UTF-8 starting with `{`, or the
    /// JSON parse failed) — must be treated as ciphertext.
    NotJson,
    /// Parsed as JSON with a recognized `type`.
    Recognized(HandshakeFrame),
    /// Parsed as a JSON object but the `type` was not one this channel
    /// recognizes. Per spec this is fatal: any JSON-looking frame that
    /// isn't a known handshake/control frame is a plaintext violation.
    UnrecognizedJson(Value),
}

/// Inspects a raw frame the way spec §4.B step 1 describes: only frames
/// that decode as UTF-8 text starting with `{` are considered for JSON
/// parsing at all; binary frames and non-`{`-prefixed text are immediately
/// ciphertext candidates.
pub fn inspect(frame: &RawFrame) -> Inspected {
    let text = match frame {
        RawFrame::Text(t) => t.as_str(),
        RawFrame::Binary(b) => match std::str::from_utf8(b) {
            Ok(t) if t.starts_with('{') => t,
            _ => return Inspected::NotJson,
        },
    };
    if !text.starts_with('{') {
        return Inspected::NotJson;
    }
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Inspected::NotJson,
    };
    match serde_json::from_value::<HandshakeFrame>(value.clone()) {
        Ok(hs) => Inspected::Recognized(hs),
        Err(_) => Inspected::UnrecognizedJson(value),
    }
}

/// A ≤160-char preview of a raw frame for diagnostic error messages (spec
/// §4.B daemon handshake step 2).
pub fn preview(frame: &RawFrame) -> String {
    let s = match frame {
        RawFrame::Text(t) => t.clone(),
        RawFrame::Binary(b) => String::from_utf8_lossy(b).into_owned(),
    };
    if s.chars().count() > 160 {
        s.chars().take(160).collect()
    } else {
        s
    }
}

/// Strictly validates the very first frame of a daemon-side handshake.
///
/// On failure, builds the diagnostic spec §4.B requires: the observed
/// `type` (if any), whether a `key` field was present, and a frame preview.
pub fn parse_hello_strict(frame: &RawFrame) -> Result<String, ChannelError> {
    let text = match frame {
        RawFrame::Text(t) => t.as_str(),
        RawFrame::Binary(b) => std::str::from_utf8(b).map_err(|_| {
            ChannelError::InvalidHello(format!(
                "not valid UTF-8; preview={:?}",
                preview(frame)
            ))
        })?,
    };

    let value: Value = serde_json::from_str(text).map_err(|_| {
        ChannelError::InvalidHello(format!(
            "unparseable JSON; preview={:?}",
            preview(frame)
        ))
    })?;

    let observed_type = value.get("type").and_then(|t| t.as_str());
    if observed_type != Some("e2ee_hello") {
        return Err(ChannelError::InvalidHello(format!(
            "expected type=\"e2ee_hello\", observed type={:?}; preview={:?}",
            observed_type,
            preview(frame)
        )));
    }

    let key_present = value.get("key").is_some();
    let key = value.get("key").and_then(|k| k.as_str()).unwrap_or("");
    if key.is_empty() {
        return Err(ChannelError::InvalidHello(format!(
            "type=\"e2ee_hello\" but key field present={key_present} and empty or missing; preview={:?}",
            preview(frame)
        )));
    }

    Ok(key.to_string())
}
