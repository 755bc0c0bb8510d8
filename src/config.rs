//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_ENGINE__MODEL`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names with
//! underscores survive: `APP_SESSION__ACQUIRE_TIMEOUT_MS` is `session.acquire_timeout_ms`.
//!
//! The configuration is read once at startup and never changes afterwards; in
//! particular the engine is never reconfigured while sessions are running.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub session: SessionConfig,
}

/// Where the HTTP/websocket server listens.
///
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Recognition engine bootstrap settings, fixed for the lifetime of the process.
///
/// ## Fields:
/// - `model`: Local directory holding `config.json`, `tokenizer.json` and
///   `model.safetensors`, or a HuggingFace repository id to download them from
/// - `tokenizer`: Optional path overriding the vocabulary file found with the model
/// - `language`: Language hint for multilingual models ("en", "de", ...); leave unset
///   for English-only (`.en`) models
/// - `max_decode_tokens`: Upper bound on tokens decoded per 30 second window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model: String,
    pub tokenizer: Option<String>,
    pub language: Option<String>,
    pub max_decode_tokens: usize,
}

/// Per-connection behavior.
///
/// ## Fields:
/// - `heartbeat_interval_secs`: How often the server pings idle clients
/// - `client_timeout_secs`: Silence after which a connection is considered dead
/// - `acquire_timeout_ms`: Optional deadline for waiting on the engine; unset means
///   wait as long as it takes
/// - `max_frame_bytes`: Largest websocket frame accepted
/// - `max_queued_frames`: Frames a connection may buffer while its session is busy
///   (waiting for the engine or decoding); one more closes the connection with 1013.
///   Together with `max_frame_bytes` this bounds the memory a single client can pin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub acquire_timeout_ms: Option<u64>,
    pub max_frame_bytes: usize,
    pub max_queued_frames: usize,
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            engine: EngineConfig {
                model: "openai/whisper-tiny.en".to_string(),
                tokenizer: None,
                language: None,
                max_decode_tokens: 224,   // Whisper's own limit: half the 448 target positions
            },
            session: SessionConfig {
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                acquire_timeout_ms: None,
                max_frame_bytes: 1024 * 1024,
                max_queued_frames: 1024,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.engine.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine model must be set"));
        }

        if self.engine.max_decode_tokens == 0 {
            return Err(anyhow::anyhow!("Max decode tokens must be greater than 0"));
        }

        if self.session.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.session.client_timeout_secs <= self.session.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.session.client_timeout_secs,
                self.session.heartbeat_interval_secs
            ));
        }

        if self.session.acquire_timeout_ms == Some(0) {
            return Err(anyhow::anyhow!("Acquire timeout must be greater than 0 when set"));
        }

        if self.session.max_frame_bytes < 2 {
            return Err(anyhow::anyhow!("Max frame size must hold at least one sample"));
        }

        if self.session.max_queued_frames == 0 {
            return Err(anyhow::anyhow!("Max queued frames must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.acquire_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.client_timeout_secs = config.session.heartbeat_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.acquire_timeout_ms = Some(0);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.model = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.max_queued_frames = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nested_keys_from_toml() {
        let toml = r#"
            [session]
            acquire_timeout_ms = 1500

            [engine]
            language = "de"
        "#;
        let config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.session.acquire_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.engine.language.as_deref(), Some("de"));
        assert_eq!(config.engine.model, "openai/whisper-tiny.en");
        assert_eq!(config.session.heartbeat_interval(), Duration::from_secs(30));
    }
}
