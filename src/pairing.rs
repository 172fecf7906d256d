//! Pairing URL construction (spec §6 "Pairing URL"): a one-time fragment-encoded
//! offer handed from daemon to client, carrying the daemon's public key and the
//! relay endpoint the client should dial. Struct shape follows the public/private
//! split `clawd::pairing::model` uses for wire-facing records; everything else
//! about pairing (PIN issuance, QR rendering, keypair persistence) is out of
//! scope here — the daemon owns it and this crate only consumes the result.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;

pub const PROTOCOL_VERSION: u32 = 2;

/// The JSON object that gets URL-safe-base64-encoded into the pairing URL's
/// fragment (spec §6). `daemon_public_key_b64` is standard (not URL-safe)
/// base64, per the crypto primitives' own external representation.
#[derive(Debug, Clone, Serialize)]
pub struct PairingOffer {
    #[serde(rename = "v")]
    pub protocol_version: u32,
    #[serde(rename = "serverId")]
    pub server_id: String,
    #[serde(rename = "daemonPublicKeyB64")]
    pub daemon_public_key_b64: String,
    pub endpoint: String,
}

impl PairingOffer {
    pub fn new(server_id: impl Into<String>, daemon_public_key_b64: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_id: server_id.into(),
            daemon_public_key_b64: daemon_public_key_b64.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Builds `<app_base>#<offer>` — the fragment is never sent to a server, so
/// this is the only place a bare daemon public key is allowed to travel
/// outside the process.
pub fn build_pairing_url(app_base: &str, offer: &PairingOffer) -> serde_json::Result<String> {
    let json = serde_json::to_string(offer)?;
    let fragment = URL_SAFE_NO_PAD.encode(json);
    Ok(format!("{app_base}#{fragment}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_round_trips_the_offer() {
        let offer = PairingOffer::new("server1234", "dGVzdGtleQ==", "relay.example.com:8787");
        let url = build_pairing_url("https://app.example.com/pair", &offer).unwrap();
        let (base, fragment) = url.split_once('#').unwrap();
        assert_eq!(base, "https://app.example.com/pair");

        let decoded = URL_SAFE_NO_PAD.decode(fragment).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["serverId"], "server1234");
        assert_eq!(value["daemonPublicKeyB64"], "dGVzdGtleQ==");
        assert_eq!(value["endpoint"], "relay.example.com:8787");
        assert_eq!(value["v"], 2);
    }
}
