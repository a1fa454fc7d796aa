//! Application settings and configuration structures.
//!
//! Configuration can be loaded from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{environment}.toml)
//! - .env files (via dotenvy)

use std::collections::HashMap;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Root configuration structure containing all application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server configuration (host, port)
    pub server: ServerSettings,

    /// Fan-out and connection lifecycle tuning
    pub realtime: RealtimeSettings,

    /// Membership roster for the in-memory membership service
    #[serde(default)]
    pub membership: MembershipSettings,

    /// Current environment (development, staging, production)
    pub environment: String,
}

/// Server binding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,

    /// Port number to listen on
    pub port: u16,
}

/// Real-time core configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeSettings {
    /// Frames buffered per connection before the oldest is dropped
    pub outbound_queue_capacity: usize,

    /// Overflow episodes tolerated before a slow consumer is evicted
    pub overflow_close_threshold: u32,

    /// Heartbeat interval advertised to clients in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Connections silent for this long are closed
    pub idle_timeout_ms: u64,

    /// Upper bound on flushing queued frames while closing
    pub drain_timeout_ms: u64,

    /// Maximum message size in bytes
    pub max_message_size: usize,

    /// Maximum frame size in bytes
    pub max_frame_size: usize,
}

/// Channel roster: channel name -> member user ids.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MembershipSettings {
    #[serde(default)]
    pub channels: HashMap<String, Vec<i64>>,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 64,
            overflow_close_threshold: 3,
            heartbeat_interval_ms: 30_000,
            idle_timeout_ms: 90_000,
            drain_timeout_ms: 2_000,
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

impl RealtimeSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Transport limits for accepted sockets
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_frame_size);
        config
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Message(
                "realtime.outbound_queue_capacity must be greater than 0".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Message(
                "realtime.heartbeat_interval_ms must be greater than 0".into(),
            ));
        }
        if self.idle_timeout_ms < self.heartbeat_interval_ms {
            return Err(ConfigError::Message(format!(
                "realtime.idle_timeout_ms ({}) must not be shorter than heartbeat_interval_ms ({})",
                self.idle_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from environment variables and configuration files.
    ///
    /// The loading order is:
    /// 1. config/default.toml (base configuration)
    /// 2. config/{RUN_ENV}.toml (environment-specific overrides)
    /// 3. Environment variables (highest priority)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration cannot be loaded or parsed,
    /// or if the realtime limits are inconsistent.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        // Determine the running environment
        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());
        let defaults = RealtimeSettings::default();

        Config::builder()
            // Start with default values
            .set_default("environment", environment.clone())?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default(
                "realtime.outbound_queue_capacity",
                defaults.outbound_queue_capacity as i64,
            )?
            .set_default(
                "realtime.overflow_close_threshold",
                i64::from(defaults.overflow_close_threshold),
            )?
            .set_default("realtime.heartbeat_interval_ms", defaults.heartbeat_interval_ms)?
            .set_default("realtime.idle_timeout_ms", defaults.idle_timeout_ms)?
            .set_default("realtime.drain_timeout_ms", defaults.drain_timeout_ms)?
            .set_default("realtime.max_message_size", defaults.max_message_size as i64)?
            .set_default("realtime.max_frame_size", defaults.max_frame_size as i64)?
            // Load from config files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Load from environment variables
            // APP__REALTIME__OUTBOUND_QUEUE_CAPACITY=128 -> realtime.outbound_queue_capacity = 128
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            // Map simple environment variables
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .build()?
            .try_deserialize()
            .and_then(|settings: Self| {
                settings.realtime.validate()?;
                Ok(settings)
            })
    }

    /// Get the full server address as a string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
