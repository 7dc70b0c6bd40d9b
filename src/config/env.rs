//! Environment variable loading.

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ServerConfig, TlsConfig};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_VOICE: &str = "alloy";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";
pub const DEFAULT_PROCESSING_DELAY_MS: u64 = 1500;
pub const DEFAULT_AUDIO_FRAME_MS: u64 = 100;
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_RATE_LIMIT_RPS: u32 = 60;
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: u32 = 100;

/// Read a variable, treating empty values as unset.
pub(crate) fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a variable, failing loudly on malformed values.
pub(crate) fn parse_env<T>(name: &str) -> Result<Option<T>, Box<dyn Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name}: {raw:?} ({e})").into()),
        None => Ok(None),
    }
}

pub(crate) fn parse_bool(name: &str) -> Result<Option<bool>, Box<dyn Error>> {
    match env_var(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(format!("Invalid boolean for {name}: {raw:?}").into()),
        },
        None => Ok(None),
    }
}

fn tls_from_env() -> Result<Option<TlsConfig>, Box<dyn Error>> {
    if !parse_bool("TLS_ENABLED")?.unwrap_or(false) {
        return Ok(None);
    }

    let cert_path = env_var("TLS_CERT_PATH")
        .ok_or("TLS_ENABLED is true but TLS_CERT_PATH is not set")?;
    let key_path =
        env_var("TLS_KEY_PATH").ok_or("TLS_ENABLED is true but TLS_KEY_PATH is not set")?;

    Ok(Some(TlsConfig {
        cert_path: PathBuf::from(cert_path),
        key_path: PathBuf::from(key_path),
    }))
}

/// Build a configuration from environment variables and defaults.
///
/// `.env` is loaded by the binary before this runs, so its values show up
/// here as ordinary environment variables.
pub fn load_from_env() -> Result<ServerConfig, Box<dyn Error>> {
    let mut config = ServerConfig::default();

    if let Some(host) = env_var("HOST") {
        config.host = host;
    }
    if let Some(port) = parse_env("PORT")? {
        config.port = port;
    }
    config.tls = tls_from_env()?;

    config.openai_api_key = env_var("OPENAI_API_KEY");
    config.realtime_url = env_var("REALTIME_URL");
    if let Some(model) = env_var("REALTIME_MODEL") {
        config.realtime_model = model;
    }
    if let Some(voice) = env_var("REALTIME_VOICE") {
        config.realtime_voice = voice;
    }
    // Present-but-empty disables transcription.
    if let Ok(model) = env::var("TRANSCRIPTION_MODEL") {
        config.transcription_model = Some(model.trim().to_string()).filter(|m| !m.is_empty());
    }

    if let Some(delay) = parse_env("BOOKING_PROCESSING_DELAY_MS")? {
        config.booking_processing_delay_ms = delay;
    }
    if let Some(frame) = parse_env("AUDIO_FRAME_MS")? {
        config.audio_frame_ms = frame;
    }
    if let Some(timeout) = parse_env("IDLE_TIMEOUT_SECONDS")? {
        config.idle_timeout_seconds = timeout;
    }

    config.cors_allowed_origins = env_var("CORS_ALLOWED_ORIGINS");
    if let Some(rps) = parse_env("RATE_LIMIT_REQUESTS_PER_SECOND")? {
        config.rate_limit_requests_per_second = rps;
    }
    if let Some(burst) = parse_env("RATE_LIMIT_BURST_SIZE")? {
        config.rate_limit_burst_size = burst;
    }
    config.max_websocket_connections = parse_env("MAX_WEBSOCKET_CONNECTIONS")?;
    if let Some(per_ip) = parse_env("MAX_CONNECTIONS_PER_IP")? {
        config.max_connections_per_ip = per_ip;
    }

    Ok(config)
}
