//! Hosted realtime speech providers.
//!
//! - `BaseRealtime` trait for provider abstraction
//! - [`create_realtime_provider`] factory selecting an implementation by name
//! - A single ordered event callback per session
//!
//! # Example
//!
//! ```rust,ignore
//! use booking_voice_gateway::core::realtime::{create_realtime_provider, RealtimeConfig};
//! use std::sync::Arc;
//!
//! let mut provider = create_realtime_provider("openai", RealtimeConfig {
//!     api_key: "sk-...".to_string(),
//!     ..Default::default()
//! })?;
//! provider.on_event(Arc::new(|event| Box::pin(async move {
//!     println!("{event:?}");
//! })))?;
//! provider.connect().await?;
//! ```

mod base;
pub mod openai;

pub use base::{
    BaseRealtime, BoxedRealtime, ConnectionState, FunctionCallRequest, InputTranscriptionConfig,
    RealtimeAudioData, RealtimeConfig, RealtimeError, RealtimeEvent, RealtimeEventCallback,
    RealtimeResult, ReconnectionConfig, ReconnectionEvent, SpeechEvent, ToolDefinition,
    TranscriptResult, TranscriptRole, TurnDetectionConfig,
};
pub use openai::{OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, OpenAIRealtime};

/// Supported realtime providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeProvider {
    OpenAI,
}

impl RealtimeProvider {
    /// Case-insensitive parse.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(RealtimeProvider::OpenAI),
            _ => None,
        }
    }
}

impl std::fmt::Display for RealtimeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RealtimeProvider::OpenAI => write!(f, "openai"),
        }
    }
}

/// Names accepted by [`create_realtime_provider`].
pub fn get_supported_realtime_providers() -> Vec<&'static str> {
    vec!["openai"]
}

/// Create a realtime provider by name.
pub fn create_realtime_provider(
    provider_type: &str,
    config: RealtimeConfig,
) -> RealtimeResult<BoxedRealtime> {
    match RealtimeProvider::parse(provider_type) {
        Some(RealtimeProvider::OpenAI) => Ok(Box::new(OpenAIRealtime::new(config)?)),
        None => Err(RealtimeError::InvalidConfiguration(format!(
            "Unsupported realtime provider: {provider_type}. Supported providers: {}",
            get_supported_realtime_providers().join(", ")
        ))),
    }
}
