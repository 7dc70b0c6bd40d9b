//! Configuration validation.

use std::error::Error;

use super::{ServerConfig, TlsConfig};
use crate::core::realtime::openai::{KNOWN_REALTIME_MODELS, OpenAIRealtimeVoice};

pub const MIN_AUDIO_FRAME_MS: u64 = 10;
pub const MAX_AUDIO_FRAME_MS: u64 = 1000;

pub fn validate_tls(tls: &Option<TlsConfig>) -> Result<(), Box<dyn Error>> {
    if let Some(tls) = tls {
        if !tls.cert_path.exists() {
            return Err(format!(
                "TLS certificate not found: {}",
                tls.cert_path.display()
            )
            .into());
        }
        if !tls.key_path.exists() {
            return Err(format!("TLS key not found: {}", tls.key_path.display()).into());
        }
    }
    Ok(())
}

pub fn validate_voice(voice: &str) -> Result<(), Box<dyn Error>> {
    if OpenAIRealtimeVoice::parse(voice).is_none() {
        let known: Vec<&str> = OpenAIRealtimeVoice::all()
            .iter()
            .map(|v| v.as_str())
            .collect();
        return Err(format!(
            "Unknown realtime voice {voice:?}; expected one of: {}",
            known.join(", ")
        )
        .into());
    }
    Ok(())
}

pub fn validate_audio_frame(frame_ms: u64) -> Result<(), Box<dyn Error>> {
    if !(MIN_AUDIO_FRAME_MS..=MAX_AUDIO_FRAME_MS).contains(&frame_ms) {
        return Err(format!(
            "audio_frame_ms must be between {MIN_AUDIO_FRAME_MS} and {MAX_AUDIO_FRAME_MS}, got {frame_ms}"
        )
        .into());
    }
    Ok(())
}

pub fn validate_rate_limit(rps: u32, burst: u32) -> Result<(), Box<dyn Error>> {
    if rps == 0 {
        return Err("rate_limit_requests_per_second must be greater than 0".into());
    }
    if burst == 0 {
        return Err("rate_limit_burst_size must be greater than 0".into());
    }
    Ok(())
}

pub fn validate_connection_limits(
    max_websocket_connections: Option<usize>,
    max_connections_per_ip: u32,
) -> Result<(), Box<dyn Error>> {
    if max_websocket_connections == Some(0) {
        return Err("max_websocket_connections must be greater than 0 when set".into());
    }
    if max_connections_per_ip == 0 {
        return Err("max_connections_per_ip must be greater than 0".into());
    }
    Ok(())
}

/// Unlisted models are accepted with a warning.
pub fn check_model(model: &str) -> bool {
    let known = KNOWN_REALTIME_MODELS.contains(&model);
    if !known {
        tracing::warn!(model, "Realtime model is not in the known model list");
    }
    known
}

/// Run every check against a merged configuration.
pub fn validate(config: &ServerConfig) -> Result<(), Box<dyn Error>> {
    validate_tls(&config.tls)?;
    check_model(&config.realtime_model);
    validate_voice(&config.realtime_voice)?;
    validate_audio_frame(config.audio_frame_ms)?;
    validate_rate_limit(
        config.rate_limit_requests_per_second,
        config.rate_limit_burst_size,
    )?;
    validate_connection_limits(
        config.max_websocket_connections,
        config.max_connections_per_ip,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_check_model() {
        assert!(check_model("gpt-4o-realtime-preview"));
        assert!(!check_model("gpt-5-voice"));
    }

    #[test]
    fn test_validate_voice() {
        assert!(validate_voice("alloy").is_ok());
        assert!(validate_voice("Verse").is_ok());
        let err = validate_voice("gravel").unwrap_err().to_string();
        assert!(err.contains("gravel"));
        assert!(err.contains("alloy"));
    }

    #[test]
    fn test_validate_audio_frame_bounds() {
        assert!(validate_audio_frame(10).is_ok());
        assert!(validate_audio_frame(1000).is_ok());
        assert!(validate_audio_frame(5).is_err());
        assert!(validate_audio_frame(1001).is_err());
    }

    #[test]
    fn test_validate_rate_limit_and_connections() {
        assert!(validate_rate_limit(60, 10).is_ok());
        assert!(validate_rate_limit(0, 10).is_err());
        assert!(validate_rate_limit(60, 0).is_err());

        assert!(validate_connection_limits(None, 100).is_ok());
        assert!(validate_connection_limits(Some(0), 100).is_err());
        assert!(validate_connection_limits(Some(5), 0).is_err());
    }

    #[test]
    fn test_validate_tls_missing_files() {
        let tls = Some(TlsConfig {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        });
        let err = validate_tls(&tls).unwrap_err().to_string();
        assert!(err.contains("certificate not found"));
        assert!(validate_tls(&None).is_ok());
    }
}
