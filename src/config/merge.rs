//! Apply YAML overrides on top of the environment configuration.

use std::error::Error;
use std::path::PathBuf;

use super::env::load_from_env;
use super::yaml::YamlConfig;
use super::{ServerConfig, TlsConfig};

/// Load the environment configuration and overlay `yaml` when given.
pub fn merge_config(yaml: Option<YamlConfig>) -> Result<ServerConfig, Box<dyn Error>> {
    let mut config = load_from_env()?;

    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
        if let Some(tls) = server.tls {
            match tls.enabled {
                Some(false) => config.tls = None,
                Some(true) => {
                    let cert_path = tls
                        .cert_path
                        .ok_or("server.tls.enabled is true but cert_path is missing")?;
                    let key_path = tls
                        .key_path
                        .ok_or("server.tls.enabled is true but key_path is missing")?;
                    config.tls = Some(TlsConfig {
                        cert_path: PathBuf::from(cert_path),
                        key_path: PathBuf::from(key_path),
                    });
                }
                None => {}
            }
        }
    }

    if let Some(realtime) = yaml.realtime {
        if let Some(key) = realtime.api_key {
            config.openai_api_key = Some(key);
        }
        if let Some(url) = realtime.url {
            config.realtime_url = Some(url);
        }
        if let Some(model) = realtime.model {
            config.realtime_model = model;
        }
        if let Some(voice) = realtime.voice {
            config.realtime_voice = voice;
        }
        if let Some(model) = realtime.transcription_model {
            config.transcription_model = Some(model).filter(|m| !m.trim().is_empty());
        }
    }

    if let Some(booking) = yaml.booking {
        if let Some(delay) = booking.processing_delay_ms {
            config.booking_processing_delay_ms = delay;
        }
        if let Some(frame) = booking.audio_frame_ms {
            config.audio_frame_ms = frame;
        }
        if let Some(timeout) = booking.idle_timeout_seconds {
            config.idle_timeout_seconds = timeout;
        }
    }

    if let Some(security) = yaml.security {
        if let Some(origins) = security.cors_allowed_origins {
            config.cors_allowed_origins = Some(origins);
        }
        if let Some(rps) = security.rate_limit_requests_per_second {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = security.rate_limit_burst_size {
            config.rate_limit_burst_size = burst;
        }
        if let Some(max) = security.max_websocket_connections {
            config.max_websocket_connections = Some(max);
        }
        if let Some(per_ip) = security.max_connections_per_ip {
            config.max_connections_per_ip = per_ip;
        }
    }

    Ok(config)
}
