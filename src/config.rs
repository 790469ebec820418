//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **struct**: Custom data types that group related fields together
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, ENGINE_AGENT_ID, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, engine, stream,
/// performance) makes it easier to understand and maintain as the
/// application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub stream: StreamConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
/// - `port = 8080`: Common development port (production often uses 80 or 443)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Conversation engine connection settings.
///
/// ## Fields:
/// - `ws_url`: Base websocket URL of the engine's realtime conversation API
/// - `agent_id`: Which configured agent answers the calls
/// - `api_key`: Optional API key; private agents reject connections without one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub ws_url: String,
    pub agent_id: String,
    pub api_key: Option<String>,
}

/// Media stream tuning.
///
/// ## Fields:
/// - `queue_capacity`: How many outbound audio chunks may wait for the socket
///   before the oldest is dropped
/// - `drain_wait_ms`: How long the outbound pump waits for audio before
///   re-checking whether the call is still alive
/// - `heartbeat_interval_secs`: How often the media socket pings the provider
/// - `client_timeout_secs`: How long without any pong before the socket is
///   considered dead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub queue_capacity: usize,
    pub drain_wait_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// Each live call holds a websocket to the provider, a websocket to the
/// engine, and a pump task, so the ceiling mostly protects the engine quota
/// rather than local memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_streams: usize,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration
/// file exists. They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,                     // Common development port
            },
            engine: EngineConfig {
                ws_url: "wss://api.elevenlabs.io/v1/convai/conversation".to_string(),
                agent_id: String::new(),  // Must be set via config.toml or ENGINE_AGENT_ID
                api_key: None,
            },
            stream: StreamConfig {
                queue_capacity: 64,        // ~1.3s of audio at 160-byte chunks
                drain_wait_ms: 100,
                heartbeat_interval_secs: 5,
                client_timeout_secs: 15,
            },
            performance: PerformanceConfig {
                max_concurrent_streams: 10,
            },
        }
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for deployment and secret variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    /// - `ENGINE_WS_URL`, `ENGINE_AGENT_ID`, `ENGINE_API_KEY`: Engine settings,
    ///   kept out of the APP_ scheme so the API key can live in the platform's
    ///   secret store under its own name
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists) - required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Example: APP_SERVER_HOST becomes server.host in the config
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Handle special environment variables used by deployment platforms
        // These don't follow the APP_ prefix convention but are commonly used
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // Engine settings have multi-word keys that the APP_ separator scheme
        // cannot address, so they get explicit overrides
        if let Ok(ws_url) = env::var("ENGINE_WS_URL") {
            settings = settings.set_override("engine.ws_url", ws_url)?;
        }

        if let Ok(agent_id) = env::var("ENGINE_AGENT_ID") {
            settings = settings.set_override("engine.agent_id", agent_id)?;
        }

        if let Ok(api_key) = env::var("ENGINE_API_KEY") {
            settings = settings.set_override("engine.api_key", api_key)?;
        }

        // Build the final configuration and convert it back to our AppConfig struct
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 (port 0 is reserved and can't be used)
    /// - Stream queue and pump timings are non-zero
    /// - The heartbeat fires at least once before the client timeout
    /// - Max concurrent streams is greater than 0
    ///
    /// ## Why validate:
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.stream.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Stream queue capacity must be greater than 0"));
        }

        if self.stream.drain_wait_ms == 0 {
            return Err(anyhow::anyhow!("Stream drain wait must be greater than 0"));
        }

        if self.stream.heartbeat_interval_secs >= self.stream.client_timeout_secs {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be shorter than the client timeout"
            ));
        }

        if self.performance.max_concurrent_streams == 0 {
            return Err(anyhow::anyhow!("Max concurrent streams must be greater than 0"));
        }

        Ok(())  // All validation passed
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// This method allows updating only some fields, not the entire configuration.
    /// For example, you can send just `{"server": {"port": 9000}}` to change only the port.
    ///
    /// Engine credentials are deliberately not updatable here; they stay in
    /// the environment and the secret store.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        // Parse the JSON string into a generic value
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        // Update server configuration if provided
        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;  // Convert u64 to u16 for port number
            }
        }

        // Update stream tuning if provided
        if let Some(stream) = partial_config.get("stream") {
            if let Some(capacity) = stream.get("queue_capacity").and_then(|v| v.as_u64()) {
                self.stream.queue_capacity = capacity as usize;
            }
            if let Some(wait) = stream.get("drain_wait_ms").and_then(|v| v.as_u64()) {
                self.stream.drain_wait_ms = wait;
            }
            if let Some(interval) = stream.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.stream.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = stream.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.stream.client_timeout_secs = timeout;
            }
        }

        // Update performance configuration if provided
        if let Some(performance) = partial_config.get("performance") {
            if let Some(streams) = performance.get("max_concurrent_streams").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_streams = streams as usize;
            }
        }

        // Validate the updated configuration to ensure it's still valid
        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;  // Import everything from the parent module

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.performance.max_concurrent_streams, 10);
        // Ensure the default config passes validation
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;  // Invalid port
        // Validation should fail for port 0
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_must_beat_timeout() {
        let mut config = AppConfig::default();
        config.stream.heartbeat_interval_secs = 20;
        config.stream.client_timeout_secs = 15;
        assert!(config.validate().is_err());
    }

    /// Test that runtime configuration updates work correctly.
    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}}"#;  // Update only the port
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);  // Port should be updated
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        let json = r#"{"stream": {"queue_capacity": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
