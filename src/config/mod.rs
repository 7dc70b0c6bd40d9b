//! Configuration module for the booking voice gateway
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use booking_voice_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod validation;
mod yaml;

pub use env::{
    DEFAULT_AUDIO_FRAME_MS, DEFAULT_HOST, DEFAULT_IDLE_TIMEOUT_SECONDS, DEFAULT_MAX_CONNECTIONS_PER_IP,
    DEFAULT_PORT, DEFAULT_PROCESSING_DELAY_MS, DEFAULT_RATE_LIMIT_BURST, DEFAULT_RATE_LIMIT_RPS,
    DEFAULT_TRANSCRIPTION_MODEL, DEFAULT_VOICE,
};
pub use yaml::YamlConfig;

use crate::core::realtime::openai::DEFAULT_REALTIME_MODEL;

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// Contains all configuration needed to run the gateway:
/// - Server settings (host, port, TLS)
/// - Realtime provider credentials and session defaults
/// - Booking flow timing
/// - Security settings (CORS, rate limiting, connection limits)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Realtime provider
    /// OpenAI API key for the Realtime API
    pub openai_api_key: Option<String>,
    /// Override for the realtime WebSocket endpoint (tests, proxies)
    pub realtime_url: Option<String>,
    pub realtime_model: String,
    /// Default voice; clients may pick another per session
    pub realtime_voice: String,
    /// Input transcription model. `None` disables user transcripts.
    pub transcription_model: Option<String>,

    // Booking flow
    /// Simulated backend latency before a booking completes
    pub booking_processing_delay_ms: u64,
    /// Length of each microphone frame sent to the model
    pub audio_frame_ms: u64,
    /// Close sessions with no client traffic for this long
    pub idle_timeout_seconds: u64,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,

    // Rate limiting configuration
    /// Maximum requests per second per IP address
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,

    // Connection limits
    /// Maximum concurrent WebSocket connections
    /// Default: None (unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    /// Default: 100
    pub max_connections_per_ip: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: None,
            openai_api_key: None,
            realtime_url: None,
            realtime_model: DEFAULT_REALTIME_MODEL.to_string(),
            realtime_voice: DEFAULT_VOICE.to_string(),
            transcription_model: Some(DEFAULT_TRANSCRIPTION_MODEL.to_string()),
            booking_processing_delay_ms: DEFAULT_PROCESSING_DELAY_MS,
            audio_frame_ms: DEFAULT_AUDIO_FRAME_MS,
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: DEFAULT_RATE_LIMIT_RPS,
            rate_limit_burst_size: DEFAULT_RATE_LIMIT_BURST,
            max_websocket_connections: None,
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
        }
    }
}

/// Zeroize the API key when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.openai_api_key {
            key.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables and defaults.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// After loading and merging, performs validation on the final configuration.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        // .env is loaded in main.rs at startup, so it is already part of the
        // environment by the time we get here.
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Get the API key for a realtime provider
    ///
    /// # Returns
    /// * `Result<String, String>` - The API key on success, or an error message on failure
    pub fn get_api_key(&self, provider: &str) -> Result<String, String> {
        match provider.to_lowercase().as_str() {
            "openai" => self
                .openai_api_key
                .clone()
                .ok_or_else(|| "OpenAI API key not configured (set OPENAI_API_KEY)".to_string()),
            other => Err(format!("Unsupported realtime provider: {other}")),
        }
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.booking_processing_delay_ms)
    }

    pub fn audio_frame_duration(&self) -> Duration {
        Duration::from_millis(self.audio_frame_ms)
    }

    /// `None` when idle sessions are kept open indefinitely.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0).then(|| Duration::from_secs(self.idle_timeout_seconds))
    }
}
