//! # Configuration Management
//!
//! This module handles loading and managing gateway configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, CORS_ORIGINS)
//! 2. Environment variables (APP__SERVER__PORT, APP__RELAY__IDLE_TIMEOUT_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! All values are read once at startup. Nothing in the core mutates configuration
//! after the server is running.

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables
use std::time::Duration;

use crate::relay::RelaySettings;
use crate::session::reaper::RetentionPolicy;

/// Main gateway configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, relay, sessions, downstream, ingest)
/// mirrors the components that consume them. Each component only ever sees its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub sessions: SessionsConfig,
    pub downstream: DownstreamConfig,
    pub ingest: IngestConfig,
}

/// HTTP listener settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to (e.g., "127.0.0.1", "0.0.0.0")
/// - `port`: TCP port number to listen on
/// - `cors_origins`: Browser origins allowed to call the API; empty or `*` allows any origin
/// - `max_payload_bytes`: Upper bound for a single `POST /api/v1/voice` body
/// - `workers`: Number of actix worker threads (0 means one per CPU core)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub max_payload_bytes: usize,
    pub workers: usize,
}

/// Stream relay tuning.
///
/// ## Backpressure:
/// `outbound_buffer` is the maximum number of sink replies waiting to be written to the
/// socket. When it is full the relay stops reading inbound frames. If it stays full for
/// longer than `backpressure_grace_ms` the connection is closed with a capacity error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub idle_timeout_secs: u64,
    pub outbound_buffer: usize,
    pub backpressure_grace_ms: u64,
    pub session_check_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub max_frame_bytes: usize,
    /// Frames accepted from the socket but not yet picked up by the relay
    pub inbound_buffer: usize,
}

/// Session registry policy.
///
/// ## Fields:
/// - `id_strategy`: "uuid" (random v4) or "monotonic" (node salt + counter)
/// - `idle_timeout_secs`: Active sessions without activity for this long are ended
/// - `retention_secs`: Ended sessions are kept this long before being purged
/// - `reap_interval_secs`: How often the background reaper sweeps the registry
/// - `max_active`: Maximum number of concurrently active sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    pub id_strategy: String,
    pub idle_timeout_secs: u64,
    pub retention_secs: u64,
    pub reap_interval_secs: u64,
    pub max_active: usize,
}

/// Downstream processing pipeline.
///
/// When `url` is absent and `echo_fallback` is true, the gateway runs in degraded echo
/// mode: frames are reflected back verbatim instead of being processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub echo_fallback: bool,
}

/// Ingest endpoint bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Maximum number of correlation records kept for polling
    pub max_tracked: usize,
    /// Maximum number of payloads handed to the sink at once
    pub max_in_flight: usize,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the gateway can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
                cors_origins: Vec::new(),       // Any origin
                max_payload_bytes: 1024 * 1024, // 1 MiB voice payload
                workers: 0,
            },
            relay: RelayConfig {
                idle_timeout_secs: 60,
                outbound_buffer: 32,
                backpressure_grace_ms: 5_000,
                session_check_interval_ms: 1_000,
                heartbeat_interval_secs: 30,
                max_frame_bytes: 256 * 1024,
                inbound_buffer: 8,
            },
            sessions: SessionsConfig {
                id_strategy: "uuid".to_string(),
                idle_timeout_secs: 15 * 60,
                retention_secs: 60 * 60,
                reap_interval_secs: 30,
                max_active: 10_000,
            },
            downstream: DownstreamConfig {
                url: None,
                timeout_ms: 10_000,
                echo_fallback: true,  // Development default; production sets a url
            },
            ingest: IngestConfig {
                max_tracked: 10_000,
                max_in_flight: 256,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP__
    /// 4. Handle special cases for HOST, PORT and CORS_ORIGINS
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__RELAY__OUTBOUND_BUFFER=64`: Override the backpressure bound
    /// - `APP__DOWNSTREAM__URL=http://inference:8000/process`: Enable the HTTP sink
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `CORS_ORIGINS=https://a.example,https://b.example`: Comma separated allow-list
    ///
    /// The separator is a double underscore because several keys contain single
    /// underscores (`idle_timeout_secs`, `max_payload_bytes`).
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(origins) = env::var("CORS_ORIGINS") {
            settings = settings.set_override("server.cors_origins", parse_origins(&origins))?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Every buffer bound and timeout is greater than 0 (a zero bound would deadlock the relay)
    /// - The id strategy is one we know how to build
    /// - Either a downstream url is configured or echo fallback is explicitly allowed
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_payload_bytes == 0 {
            return Err(anyhow::anyhow!("Max payload size must be greater than 0"));
        }

        if self.relay.outbound_buffer == 0 || self.relay.inbound_buffer == 0 {
            return Err(anyhow::anyhow!("Relay buffers must be greater than 0"));
        }

        if self.relay.idle_timeout_secs == 0
            || self.relay.backpressure_grace_ms == 0
            || self.relay.session_check_interval_ms == 0
            || self.relay.heartbeat_interval_secs == 0
        {
            return Err(anyhow::anyhow!("Relay timeouts and intervals must be greater than 0"));
        }

        if self.relay.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if !matches!(self.sessions.id_strategy.as_str(), "uuid" | "monotonic") {
            return Err(anyhow::anyhow!(
                "Unknown session id strategy '{}' (expected 'uuid' or 'monotonic')",
                self.sessions.id_strategy
            ));
        }

        if self.sessions.idle_timeout_secs == 0
            || self.sessions.retention_secs == 0
            || self.sessions.reap_interval_secs == 0
        {
            return Err(anyhow::anyhow!("Session timeouts must be greater than 0"));
        }

        if self.sessions.max_active == 0 {
            return Err(anyhow::anyhow!("Max active sessions must be greater than 0"));
        }

        if self.downstream.url.is_none() && !self.downstream.echo_fallback {
            return Err(anyhow::anyhow!(
                "downstream.url is required unless downstream.echo_fallback is enabled"
            ));
        }

        if self.ingest.max_tracked == 0 || self.ingest.max_in_flight == 0 {
            return Err(anyhow::anyhow!("Ingest tracking capacity and in-flight bound must be greater than 0"));
        }

        // Records still being processed are never evicted.
        if self.ingest.max_tracked < self.ingest.max_in_flight {
            return Err(anyhow::anyhow!(
                "ingest.max_tracked ({}) must be at least ingest.max_in_flight ({})",
                self.ingest.max_tracked,
                self.ingest.max_in_flight
            ));
        }

        Ok(())
    }

    /// Relay settings in the shape the relay state machine consumes.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            idle_timeout: Duration::from_secs(self.relay.idle_timeout_secs),
            outbound_capacity: self.relay.outbound_buffer,
            backpressure_grace: Duration::from_millis(self.relay.backpressure_grace_ms),
            session_check_interval: Duration::from_millis(self.relay.session_check_interval_ms),
        }
    }

    /// Idle and retention windows for the session reaper.
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            idle_timeout: Duration::from_secs(self.sessions.idle_timeout_secs),
            retention: Duration::from_secs(self.sessions.retention_secs),
        }
    }

    /// True when any browser origin may call the API.
    pub fn allows_any_origin(&self) -> bool {
        self.server.cors_origins.is_empty() || self.server.cors_origins.iter().any(|o| o == "*")
    }
}

/// Split a comma separated origin list, dropping blanks.
fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.downstream.echo_fallback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.outbound_buffer = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sessions.id_strategy = "constant".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.ingest.max_tracked = 4;
        config.ingest.max_in_flight = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_downstream_required_without_fallback() {
        let mut config = AppConfig::default();
        config.downstream.echo_fallback = false;
        assert!(config.validate().is_err());

        config.downstream.url = Some("http://127.0.0.1:9000/process".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml_file() {
        let raw = r#"
            [server]
            host = "0.0.0.0"
            port = 9090
            cors_origins = ["https://app.example"]
            max_payload_bytes = 2048
            workers = 2

            [relay]
            idle_timeout_secs = 30
            outbound_buffer = 4
            backpressure_grace_ms = 250
            session_check_interval_ms = 100
            heartbeat_interval_secs = 10
            max_frame_bytes = 65536
            inbound_buffer = 2

            [sessions]
            id_strategy = "monotonic"
            idle_timeout_secs = 120
            retention_secs = 600
            reap_interval_secs = 5
            max_active = 50

            [downstream]
            url = "http://inference:8000/process"
            timeout_ms = 2000
            echo_fallback = false

            [ingest]
            max_tracked = 100
            max_in_flight = 8
        "#;

        let config: AppConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_ok());
        assert!(!config.allows_any_origin());

        let relay = config.relay_settings();
        assert_eq!(relay.outbound_capacity, 4);
        assert_eq!(relay.backpressure_grace, Duration::from_millis(250));
        assert_eq!(config.retention_policy().retention, Duration::from_secs(600));
    }

    #[test]
    fn test_parse_origins() {
        assert_eq!(
            parse_origins(" https://a.example, ,https://b.example "),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert!(parse_origins("").is_empty());

        let mut config = AppConfig::default();
        config.server.cors_origins = vec!["*".to_string()];
        assert!(config.allows_any_origin());
    }
}
