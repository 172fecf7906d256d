//! Relay configuration: CLI/env overriding an optional TOML file overriding
//! built-in defaults, the same layering `clawd::config::DaemonConfig` uses
//! (spec §6 "Configuration options", SPEC_FULL §3.3).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::error;

const DEFAULT_LISTEN: &str = "0.0.0.0:8787";
const DEFAULT_RELAY_ENDPOINT: &str = "127.0.0.1:8787";
const DEFAULT_MAX_PENDING_FRAMES: usize = 200;
const DEFAULT_PROBE_INITIAL_DELAY_MS: u64 = 10_000;
const DEFAULT_PROBE_SECOND_DELAY_MS: u64 = 5_000;
const DEFAULT_LOG: &str = "info";

/// `{config file}` — all fields are optional overrides.
/// Priority: CLI / env var > TOML > built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    listen: Option<String>,
    relay_endpoint: Option<String>,
    max_pending_frames_per_connection: Option<usize>,
    control_probe_initial_delay_ms: Option<u64>,
    control_probe_second_delay_ms: Option<u64>,
    log: Option<String>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse relay config file — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP `host:port` (or platform socket path) the relay binds to.
    pub listen: String,
    /// `host:port` advertised in pairing URLs and connected to by daemons.
    pub relay_endpoint: String,
    /// Bound size of the pending-frame FIFO and the channel's pending-send
    /// queue (spec §3, §4.C).
    pub max_pending_frames_per_connection: usize,
    /// Control-liveness probe first-stage delay (spec §4.C).
    pub control_probe_initial_delay_ms: u64,
    /// Control-liveness probe second-stage delay (spec §4.C).
    pub control_probe_second_delay_ms: u64,
    pub log: String,
}

impl RelayConfig {
    /// Builds config from CLI/env args plus an optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `config_path`, if given and readable
    ///   3. Built-in defaults
    pub fn new(
        listen: Option<String>,
        relay_endpoint: Option<String>,
        log: Option<String>,
        config_path: Option<PathBuf>,
    ) -> Self {
        let toml = config_path
            .as_deref()
            .and_then(load_toml)
            .unwrap_or_default();

        let listen = listen.or(toml.listen).unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let relay_endpoint = relay_endpoint
            .or(toml.relay_endpoint)
            .unwrap_or_else(|| DEFAULT_RELAY_ENDPOINT.to_string());
        let log = log.or(toml.log).unwrap_or_else(|| DEFAULT_LOG.to_string());
        let max_pending_frames_per_connection = toml
            .max_pending_frames_per_connection
            .unwrap_or(DEFAULT_MAX_PENDING_FRAMES);
        let control_probe_initial_delay_ms = toml
            .control_probe_initial_delay_ms
            .unwrap_or(DEFAULT_PROBE_INITIAL_DELAY_MS);
        let control_probe_second_delay_ms = toml
            .control_probe_second_delay_ms
            .unwrap_or(DEFAULT_PROBE_SECOND_DELAY_MS);

        Self {
            listen,
            relay_endpoint,
            max_pending_frames_per_connection,
            control_probe_initial_delay_ms,
            control_probe_second_delay_ms,
            log,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new(None, None, None, None)
    }
}
