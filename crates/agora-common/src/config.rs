//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > agora.toml > defaults

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// Called once at startup. Later calls return the first configuration.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load(config::File::with_name("agora").required(false))?;
    tracing::debug!(
        ring_timeout_secs = app_config.call.ring_timeout_secs,
        signaling = %app_config.signaling.url,
        "Configuration loaded"
    );
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration from defaults, one file source, and `AGORA__*` env vars.
pub fn load<S>(file: S) -> Result<AppConfig, config::ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8090)?
        .set_default("call.ring_timeout_secs", 30)?
        .set_default("call.duration_tick_ms", 1000)?
        .set_default("call.event_buffer", 256)?
        .set_default("signaling.url", "ws://127.0.0.1:8090/signaling")?
        .set_default("signaling.broadcast_capacity", 1024)?
        .set_default("signaling.request_timeout_ms", 10_000)?
        .add_source(file)
        // Environment variables (AGORA__SERVER__PORT, AGORA__CALL__RING_TIMEOUT_SECS, etc.)
        .add_source(
            config::Environment::with_prefix("AGORA")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub call: CallConfig,
    pub signaling: SignalingConfig,
    /// STUN/TURN servers handed to the media engine.
    #[serde(default = "IceServerConfig::defaults")]
    pub ice_servers: Vec<IceServerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port of the signaling relay.
    pub port: u16,
}

/// Timers and buffers of a single call session.
#[derive(Debug, Deserialize, Clone)]
pub struct CallConfig {
    /// Caller-side ring timeout before the call is marked missed.
    pub ring_timeout_secs: u64,
    /// Duration timer resolution.
    pub duration_tick_ms: u64,
    /// Capacity of the controller's command and event channels.
    pub event_buffer: usize,
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn duration_tick(&self) -> Duration {
        Duration::from_millis(self.duration_tick_ms.max(1))
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            duration_tick_ms: 1000,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// Relay WebSocket URL used by remote devices.
    pub url: String,
    /// Per-call fan-out buffer of the change feed.
    pub broadcast_capacity: usize,
    /// How long a client waits for the relay to acknowledge a write.
    pub request_timeout_ms: u64,
}

impl SignalingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8090/signaling".into(),
            broadcast_capacity: 1024,
            request_timeout_ms: 10_000,
        }
    }
}

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Default STUN servers (free, public).
    /// Add TURN servers for peers behind symmetric NAT.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun1.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            },
            Self {
                urls: vec!["stun:stun.cloudflare.com:3478".into()],
                username: None,
                credential: None,
            },
        ]
    }
}
