//! OpenAI Realtime API client.
//!
//! - Endpoint: `wss://api.openai.com/v1/realtime?model=<model>`
//! - Protocol: WebSocket with JSON events
//! - Audio: PCM 16-bit, 24kHz, mono, little-endian, base64 encoded
//!
//! One spawned task owns the socket. Outgoing events reach it through an
//! mpsc channel; incoming events are decoded by [`EventDecoder`] and handed
//! to the registered [`RealtimeEventCallback`] in arrival order. When the
//! socket drops unexpectedly the task reconnects with exponential backoff and
//! replays the last session configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::config::{
    DEFAULT_REALTIME_MODEL, KNOWN_REALTIME_MODELS, OPENAI_REALTIME_SAMPLE_RATE,
    OPENAI_REALTIME_URL, OpenAIRealtimeVoice,
};
use super::messages::{
    ClientEvent, ConversationItem, InputAudioTranscription, ServerEvent, SessionConfig, ToolDef,
    TurnDetection,
};
use crate::core::realtime::base::{
    BaseRealtime, ConnectionState, FunctionCallRequest, RealtimeAudioData, RealtimeConfig,
    RealtimeError, RealtimeEvent, RealtimeEventCallback, RealtimeResult, ReconnectionConfig,
    ReconnectionEvent, SpeechEvent, TranscriptResult, TranscriptRole, TurnDetectionConfig,
};

/// Channel capacity for outgoing events.
const WS_CHANNEL_CAPACITY: usize = 256;

/// Error code the API returns when cancelling with no response in flight.
const CANCEL_NOT_ACTIVE: &str = "response_cancel_not_active";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// =============================================================================
// Event decoding
// =============================================================================

/// Turns raw server events into [`RealtimeEvent`]s.
///
/// Function call names arrive on `response.output_item.added` while the
/// arguments arrive later on `response.function_call_arguments.done`, so the
/// decoder keeps a `call_id -> name` map between the two.
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
    assistant_transcript: String,
    pending_function_calls: HashMap<String, String>,
}

impl EventDecoder {
    pub(crate) fn decode(&mut self, event: ServerEvent) -> Option<RealtimeEvent> {
        match event {
            ServerEvent::SessionCreated { session } => {
                tracing::info!(session_id = %session.id, model = ?session.model, "Realtime session created");
                Some(RealtimeEvent::SessionCreated {
                    session_id: session.id,
                })
            }

            ServerEvent::SessionUpdated { session } => {
                tracing::debug!(session_id = %session.id, "Realtime session updated");
                None
            }

            ServerEvent::Error { error } => {
                if error.code.as_deref() == Some(CANCEL_NOT_ACTIVE) {
                    tracing::debug!("Cancel ignored, no active response");
                    return None;
                }
                tracing::error!(
                    error_type = %error.error_type,
                    code = ?error.code,
                    "Realtime error: {}",
                    error.message
                );
                Some(RealtimeEvent::Error(RealtimeError::ProviderError(format!(
                    "{}: {}",
                    error.error_type, error.message
                ))))
            }

            ServerEvent::SpeechStarted {
                audio_start_ms,
                item_id,
            } => Some(RealtimeEvent::Speech(SpeechEvent::Started {
                audio_start_ms,
                item_id,
            })),

            ServerEvent::SpeechStopped {
                audio_end_ms,
                item_id,
            } => Some(RealtimeEvent::Speech(SpeechEvent::Stopped {
                audio_end_ms,
                item_id,
            })),

            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
            } => Some(RealtimeEvent::Transcript(TranscriptResult {
                text: transcript,
                role: TranscriptRole::User,
                is_final: true,
                item_id: Some(item_id),
            })),

            ServerEvent::TranscriptionFailed { item_id, error } => {
                tracing::warn!(%item_id, "Input transcription failed: {}", error.message);
                None
            }

            ServerEvent::AudioTranscriptDelta { item_id, delta } => {
                self.assistant_transcript.push_str(&delta);
                Some(RealtimeEvent::Transcript(TranscriptResult {
                    text: self.assistant_transcript.clone(),
                    role: TranscriptRole::Assistant,
                    is_final: false,
                    item_id: Some(item_id),
                }))
            }

            ServerEvent::AudioTranscriptDone {
                item_id,
                transcript,
            } => {
                self.assistant_transcript.clear();
                Some(RealtimeEvent::Transcript(TranscriptResult {
                    text: transcript,
                    role: TranscriptRole::Assistant,
                    is_final: true,
                    item_id: Some(item_id),
                }))
            }

            ServerEvent::AudioDelta {
                response_id,
                item_id,
                delta,
            } => match ServerEvent::decode_audio_delta(&delta) {
                Ok(audio) => Some(RealtimeEvent::Audio(RealtimeAudioData {
                    data: Bytes::from(audio),
                    sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
                    item_id: Some(item_id),
                    response_id: Some(response_id),
                })),
                Err(e) => {
                    tracing::error!("Failed to decode audio delta: {}", e);
                    None
                }
            },

            ServerEvent::OutputItemAdded { item } => {
                if item.item_type == "function_call"
                    && let (Some(call_id), Some(name)) = (item.call_id, item.name)
                {
                    tracing::debug!(%call_id, %name, "Tracking function call");
                    self.pending_function_calls.insert(call_id, name);
                }
                None
            }

            ServerEvent::FunctionCallArgumentsDone {
                item_id,
                call_id,
                arguments,
            } => {
                let name = self
                    .pending_function_calls
                    .remove(&call_id)
                    .unwrap_or_else(|| {
                        tracing::warn!(%call_id, "Function name not found for call");
                        String::new()
                    });
                tracing::debug!(%name, %call_id, %arguments, "Function call complete");
                Some(RealtimeEvent::FunctionCall(FunctionCallRequest {
                    call_id,
                    name,
                    arguments,
                    item_id: Some(item_id),
                }))
            }

            ServerEvent::ResponseCreated { response } => {
                tracing::debug!(response_id = %response.id, "Response created");
                Some(RealtimeEvent::ResponseCreated {
                    response_id: response.id,
                })
            }

            ServerEvent::ResponseDone { response } => {
                tracing::debug!(response_id = %response.id, status = ?response.status, "Response done");
                Some(RealtimeEvent::ResponseDone {
                    response_id: response.id,
                })
            }

            ServerEvent::Other => None,
        }
    }

    /// Forget per-connection state after a reconnect.
    pub(crate) fn reset(&mut self) {
        self.assistant_transcript.clear();
        self.pending_function_calls.clear();
    }
}

// =============================================================================
// Shared connection state
// =============================================================================

/// State shared between the client handle and its connection task.
#[derive(Clone, Default)]
struct Shared {
    state: Arc<RwLock<ConnectionState>>,
    connected: Arc<AtomicBool>,
    session_id: Arc<RwLock<Option<String>>>,
    ws_sender: Arc<Mutex<Option<mpsc::Sender<ClientEvent>>>>,
    event_callback: Arc<Mutex<Option<RealtimeEventCallback>>>,
    intentional_disconnect: Arc<AtomicBool>,
    last_session_config: Arc<RwLock<Option<SessionConfig>>>,
}

impl Shared {
    async fn emit(&self, event: RealtimeEvent) {
        let callback = self.event_callback.lock().await.clone();
        if let Some(cb) = callback {
            cb(event).await;
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        self.connected
            .store(state == ConnectionState::Connected, Ordering::SeqCst);
        *self.state.write().await = state;
    }
}

// =============================================================================
// OpenAI Realtime Client
// =============================================================================

pub struct OpenAIRealtime {
    config: RealtimeConfig,
    voice: OpenAIRealtimeVoice,
    reconnection_config: ReconnectionConfig,
    shared: Shared,
    connection_handle: Option<JoinHandle<()>>,
}

impl OpenAIRealtime {
    pub fn voice(&self) -> OpenAIRealtimeVoice {
        self.voice
    }

    pub fn model(&self) -> &str {
        if self.config.model.is_empty() {
            DEFAULT_REALTIME_MODEL
        } else {
            &self.config.model
        }
    }

    /// Session ID reported by the server, if connected.
    pub async fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().await.clone()
    }

    fn ws_url(&self) -> String {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .unwrap_or(OPENAI_REALTIME_URL);
        format!("{}?model={}", endpoint, self.model())
    }

    fn build_session_config(&self) -> SessionConfig {
        SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: self.config.instructions.clone(),
            voice: Some(self.voice.as_str().to_string()),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: self.config.input_audio_transcription.as_ref().map(|t| {
                InputAudioTranscription {
                    model: t.model.clone(),
                }
            }),
            turn_detection: self.config.turn_detection.as_ref().map(|td| match td {
                TurnDetectionConfig::ServerVad {
                    threshold,
                    prefix_padding_ms,
                    silence_duration_ms,
                    create_response,
                    interrupt_response,
                } => TurnDetection::ServerVad {
                    threshold: *threshold,
                    prefix_padding_ms: *prefix_padding_ms,
                    silence_duration_ms: *silence_duration_ms,
                    create_response: *create_response,
                    interrupt_response: *interrupt_response,
                },
                TurnDetectionConfig::SemanticVad {
                    eagerness,
                    create_response,
                    interrupt_response,
                } => TurnDetection::SemanticVad {
                    eagerness: eagerness.clone(),
                    create_response: *create_response,
                    interrupt_response: *interrupt_response,
                },
            }),
            tools: self
                .config
                .tools
                .iter()
                .map(|tool| ToolDef {
                    tool_type: "function".to_string(),
                    name: tool.name.clone(),
                    description: Some(tool.description.clone()),
                    parameters: Some(tool.parameters.clone()),
                })
                .collect(),
            tool_choice: self.config.tool_choice.clone(),
            temperature: self.config.temperature,
        }
    }

    async fn send_event(&self, event: ClientEvent) -> RealtimeResult<()> {
        let sender = self.shared.ws_sender.lock().await.clone();
        match sender {
            Some(sender) => sender
                .send(event)
                .await
                .map_err(|e| RealtimeError::WebSocketError(e.to_string())),
            None => Err(RealtimeError::NotConnected),
        }
    }

    async fn send_ready(&self, event: ClientEvent) -> RealtimeResult<()> {
        if !self.is_ready() {
            return Err(RealtimeError::NotConnected);
        }
        self.send_event(event).await
    }

    /// Send a session update and keep it for replay after reconnection.
    async fn send_session_update(&self, session: SessionConfig) -> RealtimeResult<()> {
        *self.shared.last_session_config.write().await = Some(session.clone());
        self.send_event(ClientEvent::SessionUpdate { session }).await
    }
}

/// Open an authenticated WebSocket to the realtime endpoint.
async fn open_socket(url: &str, api_key: &str) -> RealtimeResult<WsStream> {
    let mut request = url
        .into_client_request()
        .map_err(|e| RealtimeError::InvalidConfiguration(format!("Invalid endpoint: {e}")))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|_| RealtimeError::InvalidConfiguration("API key is not a valid header".into()))?;
    let headers = request.headers_mut();
    headers.insert("Authorization", bearer);
    headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(connect_error)?;
    Ok(ws_stream)
}

fn connect_error(error: tungstenite::Error) -> RealtimeError {
    if let tungstenite::Error::Http(response) = &error {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return RealtimeError::AuthenticationFailed(format!("HTTP {status}"));
        }
    }
    RealtimeError::ConnectionFailed(error.to_string())
}

/// Socket loop with reconnection. Runs until an intentional disconnect or
/// until reconnection gives up.
async fn run_connection(
    mut sink: WsSink,
    mut source: WsSource,
    mut outgoing: mpsc::Receiver<ClientEvent>,
    shared: Shared,
    reconnection: ReconnectionConfig,
    url: String,
    api_key: String,
) {
    let mut decoder = EventDecoder::default();
    let mut attempt: u32 = 0;

    'outer: loop {
        loop {
            tokio::select! {
                Some(event) = outgoing.recv() => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(event = event.event_type(), "Failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }

                Some(msg) = source.next() => {
                    match msg {
                        Ok(Message::Text(text)) => {
                            attempt = 0;
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    if let Some(event) = decoder.decode(event) {
                                        if let RealtimeEvent::SessionCreated { session_id } = &event {
                                            *shared.session_id.write().await = Some(session_id.clone());
                                        }
                                        shared.emit(event).await;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("Failed to parse server event: {} - {}", e, text);
                                }
                            }
                        }
                        Ok(Message::Ping(data)) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                tracing::error!("Failed to send pong: {}", e);
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            tracing::info!(?frame, "Realtime WebSocket closed by server");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Realtime WebSocket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }

                else => break,
            }
        }

        shared.connected.store(false, Ordering::SeqCst);

        if shared.intentional_disconnect.load(Ordering::SeqCst) {
            shared.set_state(ConnectionState::Disconnected).await;
            break 'outer;
        }

        loop {
            if !reconnection.should_retry(attempt) {
                tracing::warn!(attempt, "Giving up on realtime connection");
                shared.set_state(ConnectionState::Failed).await;
                shared
                    .emit(RealtimeEvent::Error(RealtimeError::ConnectionFailed(
                        format!("Connection lost after {attempt} reconnection attempts"),
                    )))
                    .await;
                break 'outer;
            }

            attempt += 1;
            shared.set_state(ConnectionState::Reconnecting).await;
            let delay = reconnection.delay_for(attempt);
            tracing::info!(attempt, ?delay, "Reconnecting to realtime API");
            tokio::time::sleep(delay).await;

            if shared.intentional_disconnect.load(Ordering::SeqCst) {
                shared.set_state(ConnectionState::Disconnected).await;
                break 'outer;
            }

            match open_socket(&url, &api_key).await {
                Ok(ws_stream) => {
                    let (new_sink, new_source) = ws_stream.split();
                    sink = new_sink;
                    source = new_source;
                    decoder.reset();
                    *shared.session_id.write().await = None;
                    shared.set_state(ConnectionState::Connected).await;

                    let saved = shared.last_session_config.read().await.clone();
                    if let Some(session) = saved
                        && let Ok(json) = serde_json::to_string(&ClientEvent::SessionUpdate { session })
                        && let Err(e) = sink.send(Message::Text(json.into())).await
                    {
                        tracing::error!("Failed to restore session config: {}", e);
                    }

                    tracing::info!(attempt, "Reconnected to realtime API");
                    shared
                        .emit(RealtimeEvent::Reconnected(ReconnectionEvent {
                            attempt,
                            success: true,
                            error: None,
                        }))
                        .await;
                    continue 'outer;
                }
                Err(e) => {
                    tracing::error!(attempt, "Reconnection attempt failed: {}", e);
                }
            }
        }
    }

    *shared.ws_sender.lock().await = None;
    tracing::info!("Realtime connection task ended");
}

#[async_trait]
impl BaseRealtime for OpenAIRealtime {
    fn new(config: RealtimeConfig) -> RealtimeResult<Self> {
        if config.api_key.is_empty() {
            return Err(RealtimeError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }

        let voice = config
            .voice
            .as_deref()
            .map(OpenAIRealtimeVoice::from_str_or_default)
            .unwrap_or_default();
        let reconnection_config = config.reconnection.clone().unwrap_or_default();

        Ok(Self {
            config,
            voice,
            reconnection_config,
            shared: Shared::default(),
            connection_handle: None,
        })
    }

    async fn connect(&mut self) -> RealtimeResult<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.shared
            .intentional_disconnect
            .store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting).await;

        let url = self.ws_url();
        let ws_stream = match open_socket(&url, &self.config.api_key).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                self.shared.set_state(ConnectionState::Failed).await;
                return Err(e);
            }
        };
        tracing::info!(model = self.model(), voice = %self.voice, "Connected to realtime API");

        let (sink, source) = ws_stream.split();
        let (tx, rx) = mpsc::channel::<ClientEvent>(WS_CHANNEL_CAPACITY);
        *self.shared.ws_sender.lock().await = Some(tx);
        self.shared.set_state(ConnectionState::Connected).await;

        self.connection_handle = Some(tokio::spawn(run_connection(
            sink,
            source,
            rx,
            self.shared.clone(),
            self.reconnection_config.clone(),
            url,
            self.config.api_key.clone(),
        )));

        self.send_session_update(self.build_session_config()).await
    }

    async fn disconnect(&mut self) -> RealtimeResult<()> {
        self.shared
            .intentional_disconnect
            .store(true, Ordering::SeqCst);
        *self.shared.ws_sender.lock().await = None;

        if let Some(handle) = self.connection_handle.take() {
            handle.abort();
        }

        self.shared.set_state(ConnectionState::Disconnected).await;
        *self.shared.session_id.write().await = None;
        tracing::info!("Disconnected from realtime API");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> ConnectionState {
        match self.shared.state.try_read() {
            Ok(state) => *state,
            Err(_) if self.is_ready() => ConnectionState::Connected,
            Err(_) => ConnectionState::Disconnected,
        }
    }

    async fn send_audio(&mut self, audio_data: Bytes) -> RealtimeResult<()> {
        self.send_ready(ClientEvent::audio_append(&audio_data)).await
    }

    async fn send_text(&mut self, text: &str) -> RealtimeResult<()> {
        self.send_ready(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        })
        .await
    }

    async fn create_response(&mut self) -> RealtimeResult<()> {
        self.send_ready(ClientEvent::ResponseCreate).await
    }

    async fn cancel_response(&mut self) -> RealtimeResult<()> {
        self.send_ready(ClientEvent::ResponseCancel).await
    }

    async fn truncate_item(&mut self, item_id: &str, audio_end_ms: u32) -> RealtimeResult<()> {
        self.send_ready(ClientEvent::ConversationItemTruncate {
            item_id: item_id.to_string(),
            content_index: 0,
            audio_end_ms,
        })
        .await
    }

    async fn clear_audio_buffer(&mut self) -> RealtimeResult<()> {
        self.send_ready(ClientEvent::InputAudioBufferClear).await
    }

    fn on_event(&mut self, callback: RealtimeEventCallback) -> RealtimeResult<()> {
        // Register synchronously when possible so no early event is missed.
        if let Ok(mut guard) = self.shared.event_callback.try_lock() {
            *guard = Some(callback);
        } else {
            let slot = self.shared.event_callback.clone();
            tokio::spawn(async move {
                *slot.lock().await = Some(callback);
            });
        }
        Ok(())
    }

    async fn submit_function_result(&mut self, call_id: &str, result: &str) -> RealtimeResult<()> {
        self.send_ready(ClientEvent::ConversationItemCreate {
            item: ConversationItem::function_output(call_id, result),
        })
        .await
    }

    fn provider_info(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": "openai",
            "api_type": "WebSocket Realtime",
            "endpoint": self.config.endpoint.as_deref().unwrap_or(OPENAI_REALTIME_URL),
            "model": self.model(),
            "voice": self.voice.as_str(),
            "supported_models": KNOWN_REALTIME_MODELS,
            "supported_voices": OpenAIRealtimeVoice::all()
                .iter()
                .map(|v| v.as_str())
                .collect::<Vec<_>>(),
            "sample_rate": OPENAI_REALTIME_SAMPLE_RATE,
            "features": {
                "function_calling": true,
                "transcription": self.config.input_audio_transcription.is_some(),
                "reconnection": self.reconnection_config.enabled
            }
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
