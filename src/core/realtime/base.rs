//! Base trait and types for hosted realtime speech sessions.
//!
//! A realtime provider keeps one bidirectional streaming session open with a
//! hosted conversational model: microphone audio goes up, synthesized speech,
//! transcripts and function calls come back down. Everything the provider
//! emits is delivered through a single ordered [`RealtimeEvent`] callback.
//!
//! # Audio Format
//!
//! Audio in both directions is PCM 16-bit signed little-endian, mono, 24kHz.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during realtime operations.
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    /// Connection to the provider failed or was lost for good
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Error event reported by the provider
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

impl RealtimeError {
    /// Short machine-readable code for UI error messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::WebSocketError(_) => "websocket_error",
            Self::ProviderError(_) => "provider_error",
            Self::NotConnected => "not_connected",
        }
    }

    /// Whether the session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::AuthenticationFailed(_)
        )
    }
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Automatic reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Reconnect when the connection drops unexpectedly.
    pub enabled: bool,

    /// Attempts before giving up. 0 means unlimited.
    pub max_attempts: u32,

    /// Delay before the first attempt (milliseconds).
    pub initial_delay_ms: u64,

    /// Upper bound on the delay (milliseconds).
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    pub backoff_multiplier: f32,

    /// Spread delays by up to 25% in either direction.
    pub jitter: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectionConfig {
    /// Config with reconnection turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Backoff delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = (base * (self.backoff_multiplier as f64).powi(exponent))
            .min(self.max_delay_ms as f64);

        let delay = if self.jitter {
            delay + jitter(delay * 0.25)
        } else {
            delay
        };
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }
}

/// Pseudo-random value in `[-range, range]` from a clock-seeded LCG.
fn jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(1103515245).wrapping_add(12345) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}

/// Configuration for a realtime session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// API key for authentication
    pub api_key: String,

    /// Override for the provider endpoint (e.g. a local test server)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Model to use (e.g., "gpt-4o-realtime-preview")
    #[serde(default)]
    pub model: String,

    /// Voice for synthesized speech
    #[serde(default)]
    pub voice: Option<String>,

    /// System instructions for the assistant
    #[serde(default)]
    pub instructions: Option<String>,

    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Transcribe the caller's speech
    #[serde(default)]
    pub input_audio_transcription: Option<InputTranscriptionConfig>,

    /// Turn detection (VAD) settings
    #[serde(default)]
    pub turn_detection: Option<TurnDetectionConfig>,

    /// Functions the model may call
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,

    /// Tool choice strategy ("auto", "none", "required")
    #[serde(default)]
    pub tool_choice: Option<String>,

    /// Reconnection behavior, defaults to [`ReconnectionConfig::default`]
    #[serde(default)]
    pub reconnection: Option<ReconnectionConfig>,
}

/// Input audio transcription settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputTranscriptionConfig {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
}

/// Turn detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetectionConfig {
    /// Server-side voice activity detection
    ServerVad {
        #[serde(default)]
        threshold: Option<f32>,
        #[serde(default)]
        prefix_padding_ms: Option<u32>,
        #[serde(default)]
        silence_duration_ms: Option<u32>,
        #[serde(default)]
        create_response: Option<bool>,
        #[serde(default)]
        interrupt_response: Option<bool>,
    },
    /// Semantic end-of-turn detection
    SemanticVad {
        #[serde(default)]
        eagerness: Option<String>,
        #[serde(default)]
        create_response: Option<bool>,
        #[serde(default)]
        interrupt_response: Option<bool>,
    },
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        TurnDetectionConfig::ServerVad {
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
            create_response: Some(true),
            interrupt_response: Some(true),
        }
    }
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: serde_json::Value,
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of a realtime provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Transcript of either party's speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub text: String,
    pub role: TranscriptRole,
    /// False for accumulated partial assistant transcripts
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

/// Speaker of a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Chunk of synthesized speech.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeAudioData {
    /// PCM 16-bit little-endian mono
    pub data: Bytes,
    pub sample_rate: u32,
    /// Conversation item the audio belongs to
    pub item_id: Option<String>,
    pub response_id: Option<String>,
}

/// Function call emitted by the model once its arguments are complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRequest {
    pub call_id: String,
    pub name: String,
    /// JSON-encoded arguments object
    pub arguments: String,
    pub item_id: Option<String>,
}

/// Voice activity on the caller's side.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Started {
        audio_start_ms: u64,
        item_id: Option<String>,
    },
    Stopped {
        audio_end_ms: u64,
        item_id: Option<String>,
    },
}

/// Outcome of an automatic reconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionEvent {
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
}

/// Everything a provider reports, in arrival order.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    SessionCreated { session_id: String },
    Transcript(TranscriptResult),
    Audio(RealtimeAudioData),
    FunctionCall(FunctionCallRequest),
    Speech(SpeechEvent),
    /// The model started a response; no new `create_response` until it is done
    ResponseCreated { response_id: String },
    ResponseDone { response_id: String },
    Reconnected(ReconnectionEvent),
    Error(RealtimeError),
}

/// Callback receiving provider events.
pub type RealtimeEventCallback =
    Arc<dyn Fn(RealtimeEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// =============================================================================
// Base Trait
// =============================================================================

/// A hosted realtime speech session.
#[async_trait]
pub trait BaseRealtime: Send + Sync {
    /// Create a new provider instance. Does not connect.
    fn new(config: RealtimeConfig) -> RealtimeResult<Self>
    where
        Self: Sized;

    /// Open the session and push the session configuration.
    async fn connect(&mut self) -> RealtimeResult<()>;

    /// Close the session. No reconnection is attempted afterwards.
    async fn disconnect(&mut self) -> RealtimeResult<()>;

    fn is_ready(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// Append PCM16 24kHz audio to the input buffer.
    async fn send_audio(&mut self, audio_data: Bytes) -> RealtimeResult<()>;

    /// Add a user text message to the conversation.
    async fn send_text(&mut self, text: &str) -> RealtimeResult<()>;

    /// Ask the model to respond.
    async fn create_response(&mut self) -> RealtimeResult<()>;

    /// Cancel the in-progress response.
    async fn cancel_response(&mut self) -> RealtimeResult<()>;

    /// Drop unplayed audio of an assistant item after `audio_end_ms`.
    async fn truncate_item(&mut self, item_id: &str, audio_end_ms: u32) -> RealtimeResult<()>;

    /// Discard audio not yet committed to the conversation.
    async fn clear_audio_buffer(&mut self) -> RealtimeResult<()>;

    /// Register the event callback, replacing any previous one.
    fn on_event(&mut self, callback: RealtimeEventCallback) -> RealtimeResult<()>;

    /// Return the output of a function call to the model.
    async fn submit_function_result(&mut self, call_id: &str, result: &str) -> RealtimeResult<()>;

    fn provider_info(&self) -> serde_json::Value;
}

/// Boxed provider.
pub type BoxedRealtime = Box<dyn BaseRealtime>;
