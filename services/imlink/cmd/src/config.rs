//! Configuration handling for the imlink client.
//!
//! Settings come from a YAML file, then `IMLINK_*` environment variables,
//! then command-line flags (applied by `main`).

use anyhow::{Context, Result};
use imlink_session::{
    CoordinatorConfig, HeartbeatMode, PoolConfig, ReconnectConfig, RetryConfig, SessionConfig,
    SessionType, TlsSettings,
};
use imlink_wire::ContentType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Durations as humantime strings (`"30s"`, `"1m 30s"`)
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint and session behaviour
    pub client: ServerConfig,
    /// Reconnect backoff
    pub reconnect: ReconnectSection,
    /// Message retry policy
    pub retry: RetrySection,
    /// Session pool limits
    pub pool: PoolSection,
    /// Content routing overrides
    pub routes: HashMap<ContentType, SessionType>,
}

/// Server endpoint and session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Session type used for sends
    pub session_type: SessionType,
    /// Initial heartbeat mode
    pub heartbeat_mode: HeartbeatMode,
    /// Reconnect after recoverable losses
    pub auto_reconnect: bool,
    /// Connect deadline
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// TLS settings
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            session_type: SessionType::Chat,
            heartbeat_mode: HeartbeatMode::Foreground,
            auto_reconnect: true,
            connect_timeout: Duration::from_secs(15),
            tls: TlsConfig::default(),
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// SNI override
    pub server_name: Option<String>,
    /// Path to CA certificate file
    pub ca_file: String,
    /// Path to client certificate file
    pub cert_file: String,
    /// Path to client private key file
    pub key_file: String,
}

/// Reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// First delay
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    /// Delay ceiling
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        let defaults = ReconnectConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay,
            max_delay: defaults.max_delay,
        }
    }
}

/// Message retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Retransmissions per message
    pub max_retries: u32,
    /// ACK wait per attempt
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_retries: defaults.max_retries,
            timeout: defaults.retry_timeout,
        }
    }
}

/// Pool limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Idle sessions per type
    pub max_per_type: usize,
    /// Idle time before eviction
    #[serde(with = "duration_str")]
    pub max_idle: Duration,
    /// Cleanup period
    #[serde(with = "duration_str")]
    pub cleanup_interval: Duration,
    /// Uses before retirement
    pub max_reuse: u32,
}

impl Default for PoolSection {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            max_per_type: defaults.max_per_type,
            max_idle: defaults.max_idle,
            cleanup_interval: defaults.cleanup_interval,
            max_reuse: defaults.max_reuse,
        }
    }
}

pub(crate) fn parse_heartbeat_mode(value: &str) -> Option<HeartbeatMode> {
    match value.to_lowercase().as_str() {
        "foreground" => Some(HeartbeatMode::Foreground),
        "background" => Some(HeartbeatMode::Background),
        "low_power" | "lowpower" => Some(HeartbeatMode::LowPower),
        "suspended" => Some(HeartbeatMode::Suspended),
        _ => None,
    }
}

fn read_pem(path: &str) -> Result<Option<String>> {
    if path.is_empty() {
        return Ok(None);
    }
    let pem = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    Ok(Some(pem))
}

impl ClientConfig {
    /// Load configuration from file and environment variables. A missing
    /// file yields defaults; a malformed one is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        info!(
            "Final client configuration: server={}:{}, session_type={}, tls={}",
            config.client.host,
            config.client.port,
            config.client.session_type,
            config.client.tls.enabled
        );
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        if let Ok(host) = std::env::var("IMLINK_HOST") {
            info!("Host overridden by environment: {}", host);
            self.client.host = host;
        }

        if let Ok(port) = std::env::var("IMLINK_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.client.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid IMLINK_PORT: {}", port),
            }
        }

        if let Ok(use_tls) = std::env::var("IMLINK_USE_TLS") {
            self.client.tls.enabled =
                matches!(use_tls.to_lowercase().as_str(), "1" | "true" | "yes");
            info!("TLS overridden by environment: {}", self.client.tls.enabled);
        }

        if let Ok(mode) = std::env::var("IMLINK_HEARTBEAT") {
            match parse_heartbeat_mode(&mode) {
                Some(mode) => {
                    self.client.heartbeat_mode = mode;
                    info!("Heartbeat mode overridden by environment: {:?}", mode);
                }
                None => warn!("Ignoring invalid IMLINK_HEARTBEAT: {}", mode),
            }
        }
    }

    /// Session template for every connection
    pub fn session_config(&self) -> Result<SessionConfig> {
        let tls = &self.client.tls;
        let tls_settings = if tls.enabled {
            TlsSettings {
                server_name: tls.server_name.clone(),
                ca_pem: read_pem(&tls.ca_file)?,
                cert_pem: read_pem(&tls.cert_file)?,
                key_pem: read_pem(&tls.key_file)?,
            }
        } else {
            TlsSettings::default()
        };

        Ok(SessionConfig {
            use_tls: tls.enabled,
            tls: tls_settings,
            auto_reconnect: self.client.auto_reconnect,
            connect_timeout: self.client.connect_timeout,
            reconnect: ReconnectConfig {
                max_attempts: self.reconnect.max_attempts,
                base_delay: self.reconnect.base_delay,
                max_delay: self.reconnect.max_delay,
            },
            retry: RetryConfig {
                max_retries: self.retry.max_retries,
                retry_timeout: self.retry.timeout,
            },
            ..SessionConfig::new(
                self.client.session_type,
                self.client.host.clone(),
                self.client.port,
            )
        })
    }

    /// Coordinator settings with routing overrides applied on top of the defaults
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let mut config = CoordinatorConfig {
            pool: PoolConfig {
                max_per_type: self.pool.max_per_type,
                max_idle: self.pool.max_idle,
                cleanup_interval: self.pool.cleanup_interval,
                max_reuse: self.pool.max_reuse,
            },
            session: self.session_config()?,
            ..CoordinatorConfig::default()
        };
        config
            .routes
            .extend(self.routes.iter().map(|(content, session)| (*content, *session)));
        Ok(config)
    }
}
