use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

// =============================================================================
// Unified config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   relay.toml:      [session]
//                    confirm_on_delivery_only = true
//
//   env var:         RELAY_SESSION__CONFIRM_ON_DELIVERY_ONLY=true   (double underscore = nesting)
//
//   CLI flag:        relay serve --port 9000   (host/port only, highest priority)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Listener settings (lives under `[server]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Per-connection tunables (lives under `[session]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Only echo `(to X) You: ...` back to the sender when X was reached.
    #[serde(default)]
    pub confirm_on_delivery_only: bool,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
            confirm_on_delivery_only: false,
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_outbound_buffer() -> usize {
    64
}
fn default_max_frame_bytes() -> usize {
    64 * 1024
}

/// Build a figment that layers: defaults → relay.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///   `RELAY_SESSION__OUTBOUND_BUFFER=256`  →  `session.outbound_buffer = 256`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime config (resolved from FileConfig + CLI overrides)
// =============================================================================

/// Listener configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
}

/// Session loop configuration (runtime view).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    /// Condition the sender's private-message echo on actual delivery
    pub confirm_on_delivery_only: bool,
    /// Largest inbound frame the transport accepts
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_file(&SessionFileConfig::default())
    }
}

impl SessionConfig {
    pub fn from_file(fc: &SessionFileConfig) -> Self {
        Self {
            outbound_buffer: fc.outbound_buffer,
            confirm_on_delivery_only: fc.confirm_on_delivery_only,
            max_frame_bytes: fc.max_frame_bytes,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
}

impl RelayConfig {
    /// Load from `config_path` (missing file is fine) and the environment,
    /// then apply CLI overrides.
    pub fn load(config_path: &Path, host: Option<&str>, port: Option<u16>) -> Result<Self> {
        let fc: FileConfig = load_config(config_path)
            .extract()
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
        Self::from_file(&fc, host, port)
    }

    pub fn from_file(fc: &FileConfig, host: Option<&str>, port: Option<u16>) -> Result<Self> {
        let host = host.unwrap_or(&fc.server.host);
        let port = port.unwrap_or(fc.server.port);
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("Invalid listen address {host}:{port}"))?;

        if fc.session.outbound_buffer == 0 {
            bail!("session.outbound_buffer must be at least 1");
        }
        if fc.session.max_frame_bytes == 0 {
            bail!("session.max_frame_bytes must be at least 1");
        }

        Ok(Self {
            server: ServerConfig { addr },
            session: SessionConfig::from_file(&fc.session),
        })
    }
}
