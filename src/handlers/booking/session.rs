//! Per-connection booking session.
//!
//! The session is the single owner of the booking state machine, the
//! realtime provider and the audio bridge. Provider callbacks and finished
//! fulfillments arrive as [`SessionSignal`]s on one channel, so everything
//! that touches the machine runs in arrival order on the session task.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::core::audio::{AudioBridge, AudioBridgeConfig, SampleEncoding};
use crate::core::booking::{
    BOOKING_INSTRUCTIONS, BookingState, BookingStateMachine, Fulfillment, ToolResponse,
    Transition, booking_tools, parse_function_call,
};
use crate::core::realtime::{
    BoxedRealtime, FunctionCallRequest, InputTranscriptionConfig, OPENAI_REALTIME_SAMPLE_RATE,
    RealtimeConfig, RealtimeEvent, SpeechEvent, TurnDetectionConfig,
};
use crate::state::AppState;

use super::messages::{
    BookingIncomingMessage, BookingMessageRoute, BookingOutgoingMessage, StartOptions,
};

/// Capacity of the provider/fulfillment signal channel.
const SIGNAL_BUFFER_SIZE: usize = 1024;

/// Sent to the model when the user asks for a new booking mid-conversation.
const START_OVER_TEXT: &str =
    "I want to start a new booking from the beginning. Please ask me for the reference number.";

/// Work delivered to the session from other tasks.
#[derive(Debug)]
pub enum SessionSignal {
    /// Event from the realtime provider
    Provider(RealtimeEvent),
    /// Mock backend finished; `generation` guards against stale results
    Fulfilled {
        generation: u64,
        fulfillment: Fulfillment,
    },
}

pub struct BookingSession {
    app_state: Arc<AppState>,
    machine: BookingStateMachine,
    provider: Option<BoxedRealtime>,
    bridge: Option<AudioBridge>,
    outgoing: mpsc::Sender<BookingMessageRoute>,
    signal_tx: mpsc::Sender<SessionSignal>,
    session_id: Option<String>,
    /// Call id of `confirm_booking`, answered once fulfillment completes
    pending_call: Option<String>,
    generation: u64,
    /// The model is generating; `response.create` would be rejected
    response_active: bool,
    /// A response is owed once the active one is done
    response_requested: bool,
}

impl BookingSession {
    pub fn new(
        app_state: Arc<AppState>,
        outgoing: mpsc::Sender<BookingMessageRoute>,
    ) -> (Self, mpsc::Receiver<SessionSignal>) {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER_SIZE);
        let session = Self {
            app_state,
            machine: BookingStateMachine::new(),
            provider: None,
            bridge: None,
            outgoing,
            signal_tx,
            session_id: None,
            pending_call: None,
            generation: 0,
            response_active: false,
            response_requested: false,
        };
        (session, signal_rx)
    }

    pub fn state(&self) -> BookingState {
        self.machine.state()
    }

    pub fn machine(&self) -> &BookingStateMachine {
        &self.machine
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Handle a validated message from the UI.
    pub async fn handle_message(&mut self, msg: BookingIncomingMessage) {
        match msg {
            BookingIncomingMessage::Start(options) => self.start(options).await,
            BookingIncomingMessage::Text { text } => self.send_text(&text).await,
            BookingIncomingMessage::Interrupt => self.interrupt_playback(true).await,
            BookingIncomingMessage::StartOver => self.start_over().await,
            BookingIncomingMessage::Stop => self.stop().await,
            BookingIncomingMessage::MicrophoneError { message } => {
                self.fail(
                    "microphone_error",
                    format!("Microphone unavailable: {message}"),
                )
                .await
            }
        }
    }

    /// Forward captured microphone audio to the model, framed and encoded.
    pub async fn handle_audio(&mut self, data: Bytes) {
        let (Some(bridge), Some(provider)) = (self.bridge.as_mut(), self.provider.as_mut()) else {
            debug!("No active booking session, dropping audio");
            return;
        };
        if !provider.is_ready() {
            debug!("Provider not ready, dropping audio");
            return;
        }

        let frames = match bridge.capture(&data) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, bytes = data.len(), "Rejected microphone audio");
                self.send(BookingOutgoingMessage::error("audio_error", e.to_string()))
                    .await;
                return;
            }
        };

        for frame in frames {
            if let Err(e) = provider.send_audio(frame).await {
                warn!(error = %e, "Failed to forward audio frame");
                break;
            }
        }
    }

    pub async fn handle_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Provider(event) => self.on_provider_event(event).await,
            SessionSignal::Fulfilled {
                generation,
                fulfillment,
            } => self.on_fulfilled(generation, fulfillment).await,
        }
    }

    /// Disconnect the provider and drop audio state. The machine is left as is.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    async fn start(&mut self, options: StartOptions) {
        if let Err(e) = self.machine.begin_connect() {
            self.send(BookingOutgoingMessage::error("invalid_state", e.to_string()))
                .await;
            return;
        }
        self.generation += 1;
        self.pending_call = None;
        self.emit_state().await;

        let config = &self.app_state.config;
        let output_encoding = options.output_encoding.unwrap_or(SampleEncoding::Pcm16);
        let bridge_config = AudioBridgeConfig {
            input_sample_rate: options
                .input_sample_rate
                .unwrap_or(OPENAI_REALTIME_SAMPLE_RATE),
            input_encoding: options.input_encoding.unwrap_or_default(),
            output_encoding,
            model_sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
            frame_duration: config.audio_frame_duration(),
        };
        let bridge = match AudioBridge::new(bridge_config) {
            Ok(bridge) => bridge,
            Err(e) => {
                self.fail(
                    "microphone_error",
                    format!("Microphone audio format not supported: {e}"),
                )
                .await;
                return;
            }
        };

        let api_key = match config.get_api_key("openai") {
            Ok(key) => key,
            Err(e) => {
                self.fail("missing_api_key", e).await;
                return;
            }
        };

        let voice = options
            .voice
            .unwrap_or_else(|| config.realtime_voice.clone())
            .trim()
            .to_lowercase();
        let model = config.realtime_model.clone();
        let realtime_config = build_realtime_config(config, api_key, &voice);

        let mut provider = match self.app_state.create_realtime(realtime_config) {
            Ok(provider) => provider,
            Err(e) => {
                self.fail("provider_error", format!("Failed to create provider: {e}"))
                    .await;
                return;
            }
        };

        let signal_tx = self.signal_tx.clone();
        let registered = provider.on_event(Arc::new(move |event: RealtimeEvent| {
            let tx = signal_tx.clone();
            Box::pin(async move {
                let _ = tx.send(SessionSignal::Provider(event)).await;
            })
        }));
        if let Err(e) = registered {
            self.fail("provider_error", format!("Failed to register events: {e}"))
                .await;
            return;
        }

        info!(%model, %voice, "Connecting booking session to realtime provider");
        if let Err(e) = provider.connect().await {
            let _ = provider.disconnect().await;
            self.fail(
                "connection_error",
                format!("Could not reach the voice assistant: {e}"),
            )
            .await;
            return;
        }

        if let Err(e) = self.machine.connected() {
            warn!(error = %e, "Connected outside of a connecting state");
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        self.session_id = Some(session_id.clone());
        self.provider = Some(provider);
        self.bridge = Some(bridge);

        self.send(BookingOutgoingMessage::SessionStarted {
            session_id: session_id.clone(),
            model,
            voice,
            output_sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
            output_encoding,
        })
        .await;
        self.emit_state().await;
        info!(%session_id, "Booking session started");

        // Let the assistant greet the user and ask for the reference number.
        self.request_response().await;
    }

    async fn send_text(&mut self, text: &str) {
        let Some(provider) = self.provider.as_mut().filter(|p| p.is_ready()) else {
            self.send(BookingOutgoingMessage::error(
                "not_connected",
                "Start a booking before sending messages",
            ))
            .await;
            return;
        };

        // Speech captured before the typed text goes first.
        if let Some(bridge) = self.bridge.as_mut() {
            match bridge.finish_capture() {
                Ok(frames) => {
                    for frame in frames {
                        if let Err(e) = provider.send_audio(frame).await {
                            warn!(error = %e, "Failed to forward audio tail");
                            break;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Dropping buffered microphone audio"),
            }
        }

        if let Err(e) = provider.send_text(text).await {
            self.send(BookingOutgoingMessage::error(
                "text_error",
                format!("Failed to send text: {e}"),
            ))
            .await;
            return;
        }
        self.request_response().await;
    }

    async fn start_over(&mut self) {
        if let Err(e) = self.machine.start_over() {
            self.send(BookingOutgoingMessage::error("invalid_state", e.to_string()))
                .await;
            return;
        }
        self.generation += 1;
        self.pending_call = None;
        self.interrupt_playback(true).await;
        self.emit_state().await;
        info!(session_id = ?self.session_id, "Booking restarted");

        // Speech from the previous booking must not reach the new one.
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.discard_capture();
        }
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        if let Err(e) = provider.clear_audio_buffer().await {
            debug!(error = %e, "Failed to clear the input audio buffer");
        }
        if let Err(e) = provider.send_text(START_OVER_TEXT).await {
            warn!(error = %e, "Failed to tell the assistant about the restart");
            return;
        }
        self.request_response().await;
    }

    async fn stop(&mut self) {
        self.teardown().await;
        self.machine.reset();
        self.session_id = None;
        self.emit_state().await;
        info!("Booking session stopped");
    }

    /// Move to the terminal error state with a user-facing message.
    async fn fail(&mut self, code: &str, message: impl Into<String>) {
        let message = message.into();
        self.teardown().await;
        self.machine.fail(message.clone());
        self.emit_state().await;
        self.send(BookingOutgoingMessage::error(code, message)).await;
    }

    async fn teardown(&mut self) {
        self.generation += 1;
        self.pending_call = None;
        self.response_active = false;
        self.response_requested = false;
        self.bridge = None;
        if let Some(mut provider) = self.provider.take()
            && let Err(e) = provider.disconnect().await
        {
            warn!(error = %e, "Failed to disconnect realtime provider");
        }
    }

    // -------------------------------------------------------------------------
    // Provider events
    // -------------------------------------------------------------------------

    async fn on_provider_event(&mut self, event: RealtimeEvent) {
        if self.provider.is_none() {
            debug!("Dropping provider event for an inactive session");
            return;
        }

        match event {
            RealtimeEvent::SessionCreated { session_id } => {
                debug!(provider_session = %session_id, "Realtime session created");
            }
            RealtimeEvent::Transcript(transcript) => {
                self.send(BookingOutgoingMessage::transcript(transcript))
                    .await;
            }
            RealtimeEvent::Audio(audio) => {
                let Some(bridge) = self.bridge.as_mut() else {
                    return;
                };
                match bridge.play(&audio) {
                    Ok(playback) => {
                        let _ = self
                            .outgoing
                            .send(BookingMessageRoute::Audio(playback.data))
                            .await;
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed model audio"),
                }
            }
            RealtimeEvent::FunctionCall(call) => self.on_function_call(call).await,
            RealtimeEvent::Speech(speech) => {
                self.send(BookingOutgoingMessage::speech(&speech)).await;
                if matches!(speech, SpeechEvent::Started { .. }) {
                    // The server cancels its own response on barge-in.
                    self.interrupt_playback(false).await;
                }
            }
            RealtimeEvent::ResponseCreated { response_id } => {
                debug!(%response_id, "Model response started");
                self.response_active = true;
            }
            RealtimeEvent::ResponseDone { response_id } => {
                self.response_active = false;
                self.send(BookingOutgoingMessage::ResponseDone { response_id })
                    .await;
                if std::mem::take(&mut self.response_requested) {
                    self.request_response().await;
                }
            }
            RealtimeEvent::Reconnected(reconnection) => {
                if reconnection.success {
                    info!(attempt = reconnection.attempt, "Realtime provider reconnected");
                    self.send(BookingOutgoingMessage::Reconnected {
                        attempt: reconnection.attempt,
                    })
                    .await;
                    self.resume_after_reconnect().await;
                }
            }
            RealtimeEvent::Error(error) => {
                if error.is_fatal() {
                    self.fail(
                        "connection_error",
                        format!("Lost connection to the voice assistant: {error}"),
                    )
                    .await;
                } else {
                    warn!(code = error.code(), %error, "Realtime provider error");
                    self.send(BookingOutgoingMessage::error(error.code(), error.to_string()))
                        .await;
                }
            }
        }
    }

    async fn on_function_call(&mut self, call: FunctionCallRequest) {
        let event = match parse_function_call(&call) {
            Ok(event) => event,
            Err(e) => {
                warn!(name = %call.name, error = %e, "Ignoring unusable function call");
                let response =
                    ToolResponse::rejected(&e, self.machine.state(), self.machine.record());
                self.answer_call(&call.call_id, &response).await;
                return;
            }
        };

        let transition = self.machine.apply(event);
        if transition.is_advanced() {
            self.emit_state().await;
        }

        if transition.is_advanced() && self.machine.state() == BookingState::Processing {
            self.pending_call = Some(call.call_id);
            self.spawn_fulfillment().await;
            return;
        }

        let response =
            ToolResponse::from_transition(&transition, self.machine.state(), self.machine.record());
        self.answer_call(&call.call_id, &response).await;
    }

    async fn spawn_fulfillment(&mut self) {
        let record = self.machine.record();
        let (Some(reference), Some(token)) =
            (record.reference_number.clone(), record.token_number.clone())
        else {
            self.fail("booking_error", "Booking details are incomplete")
                .await;
            return;
        };

        let fulfillment = self.app_state.fulfillment.clone();
        let signal_tx = self.signal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = fulfillment.fulfill(&reference, &token).await;
            let _ = signal_tx
                .send(SessionSignal::Fulfilled {
                    generation,
                    fulfillment: result,
                })
                .await;
        });
    }

    async fn on_fulfilled(&mut self, generation: u64, fulfillment: Fulfillment) {
        if generation != self.generation || self.machine.state() != BookingState::Processing {
            debug!(generation, current = self.generation, "Discarding stale fulfillment");
            return;
        }

        if let Err(e) = self.machine.complete(fulfillment) {
            self.fail("booking_error", format!("Booking could not be completed: {e}"))
                .await;
            return;
        }

        self.emit_state().await;
        let record = self.machine.record().clone();
        info!(
            session_id = ?self.session_id,
            container = ?record.container_number,
            gate_time = ?record.gate_time,
            "Booking complete"
        );
        self.send(BookingOutgoingMessage::BookingComplete { record })
            .await;

        if let Some(call_id) = self.pending_call.take() {
            let transition = Transition::Advanced {
                from: BookingState::Processing,
                to: BookingState::Success,
            };
            let response = ToolResponse::from_transition(
                &transition,
                self.machine.state(),
                self.machine.record(),
            );
            self.answer_call(&call_id, &response).await;
        } else {
            // The call belonged to a session lost on reconnect.
            self.send_context().await;
        }
    }

    /// The server session after a reconnect has no conversation history.
    async fn resume_after_reconnect(&mut self) {
        self.pending_call = None;
        self.response_active = false;
        self.response_requested = false;
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.discard_capture();
            bridge.reset_playback();
        }
        self.send_context().await;
    }

    /// Tell the model where the booking stands and let it continue.
    async fn send_context(&mut self) {
        let text = resume_text(&self.machine);
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        if let Err(e) = provider.send_text(&text).await {
            warn!(error = %e, "Failed to restore booking context");
            return;
        }
        self.request_response().await;
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Return a function result and ask the model to continue. Results from
    /// one response share a single follow-up once that response is done.
    async fn answer_call(&mut self, call_id: &str, response: &ToolResponse) {
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        if let Err(e) = provider
            .submit_function_result(call_id, &response.to_json())
            .await
        {
            warn!(%call_id, error = %e, "Failed to submit function result");
            return;
        }
        self.request_response().await;
    }

    async fn request_response(&mut self) {
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        if self.response_active {
            self.response_requested = true;
            return;
        }
        match provider.create_response().await {
            Ok(()) => self.response_active = true,
            Err(e) => warn!(error = %e, "Failed to request a response"),
        }
    }

    /// Cut assistant playback short and truncate the model's copy of the item.
    async fn interrupt_playback(&mut self, cancel_response: bool) {
        let Some(bridge) = self.bridge.as_mut() else {
            return;
        };
        let interruption = bridge.interrupt();

        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        if cancel_response && let Err(e) = provider.cancel_response().await {
            debug!(error = %e, "Cancel response failed");
        }

        let Some(interruption) = interruption else {
            return;
        };
        if let Some(item_id) = &interruption.item_id
            && let Err(e) = provider
                .truncate_item(item_id, interruption.played_ms())
                .await
        {
            debug!(%item_id, error = %e, "Truncate failed");
        }

        let played_ms = interruption.played_ms();
        debug!(item_id = ?interruption.item_id, played_ms, "Playback interrupted");
        self.send(BookingOutgoingMessage::Interrupted {
            item_id: interruption.item_id,
            played_ms,
        })
        .await;
    }

    async fn emit_state(&self) {
        self.send(BookingOutgoingMessage::state(self.machine.snapshot()))
            .await;
    }

    async fn send(&self, message: BookingOutgoingMessage) {
        let _ = self
            .outgoing
            .send(BookingMessageRoute::Outgoing(message))
            .await;
    }
}

/// Booking progress as a user message, for a model session without history.
fn resume_text(machine: &BookingStateMachine) -> String {
    let state = machine.state();
    let record = machine.record();
    let mut text = format!(
        "The connection was interrupted. We are at the step \"{}\".",
        state.as_str()
    );
    if let Some(reference) = &record.reference_number {
        text.push_str(&format!(" My reference number is {reference}."));
    }
    if let Some(token) = &record.token_number {
        text.push_str(&format!(" My token number is {token}."));
    }
    if let Some(container) = &record.container_number {
        text.push_str(&format!(" The booking is done: container {container}"));
        if let Some(location) = &record.location {
            text.push_str(&format!(", {location}"));
        }
        if let Some(gate_time) = &record.gate_time {
            text.push_str(&format!(", gate time {gate_time}"));
        }
        text.push('.');
    }
    text.push(' ');
    text.push_str(state.prompt());
    text
}

/// Session configuration sent to the model for a booking conversation.
pub fn build_realtime_config(config: &ServerConfig, api_key: String, voice: &str) -> RealtimeConfig {
    RealtimeConfig {
        api_key,
        endpoint: config.realtime_url.clone(),
        model: config.realtime_model.clone(),
        voice: Some(voice.to_string()),
        instructions: Some(BOOKING_INSTRUCTIONS.to_string()),
        input_audio_transcription: config
            .transcription_model
            .clone()
            .map(|model| InputTranscriptionConfig { model }),
        turn_detection: Some(TurnDetectionConfig::default()),
        tools: booking_tools(),
        tool_choice: Some("auto".to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::encode_pcm16;
    use crate::core::realtime::{
        BaseRealtime, ConnectionState, RealtimeAudioData, RealtimeError, RealtimeEventCallback,
        RealtimeResult, ReconnectionEvent,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    type CallLog = Arc<Mutex<Vec<String>>>;

    /// Provider double that records every call.
    struct ScriptedRealtime {
        log: CallLog,
        fail_connect: bool,
        connected: bool,
    }

    #[async_trait]
    impl BaseRealtime for ScriptedRealtime {
        fn new(_config: RealtimeConfig) -> RealtimeResult<Self> {
            Ok(Self {
                log: Arc::default(),
                fail_connect: false,
                connected: false,
            })
        }

        async fn connect(&mut self) -> RealtimeResult<()> {
            self.log.lock().unwrap().push("connect".to_string());
            if self.fail_connect {
                return Err(RealtimeError::ConnectionFailed("refused".to_string()));
            }
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> RealtimeResult<()> {
            self.log.lock().unwrap().push("disconnect".to_string());
            self.connected = false;
            Ok(())
        }

        fn is_ready(&self) -> bool {
            self.connected
        }

        fn connection_state(&self) -> ConnectionState {
            if self.connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        }

        async fn send_audio(&mut self, audio_data: Bytes) -> RealtimeResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("audio:{}", audio_data.len()));
            Ok(())
        }

        async fn send_text(&mut self, text: &str) -> RealtimeResult<()> {
            self.log.lock().unwrap().push(format!("text:{text}"));
            Ok(())
        }

        async fn create_response(&mut self) -> RealtimeResult<()> {
            self.log.lock().unwrap().push("create_response".to_string());
            Ok(())
        }

        async fn cancel_response(&mut self) -> RealtimeResult<()> {
            self.log.lock().unwrap().push("cancel_response".to_string());
            Ok(())
        }

        async fn truncate_item(&mut self, item_id: &str, audio_end_ms: u32) -> RealtimeResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("truncate:{item_id}:{audio_end_ms}"));
            Ok(())
        }

        async fn clear_audio_buffer(&mut self) -> RealtimeResult<()> {
            self.log.lock().unwrap().push("clear_audio_buffer".to_string());
            Ok(())
        }

        fn on_event(&mut self, _callback: RealtimeEventCallback) -> RealtimeResult<()> {
            Ok(())
        }

        async fn submit_function_result(&mut self, call_id: &str, result: &str) -> RealtimeResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("result:{call_id}:{result}"));
            Ok(())
        }

        fn provider_info(&self) -> serde_json::Value {
            serde_json::json!({ "provider": "scripted" })
        }
    }

    fn app_state(api_key: Option<&str>, fail_connect: bool) -> (Arc<AppState>, CallLog) {
        let log: CallLog = Arc::default();
        let mut config = ServerConfig::default();
        config.openai_api_key = api_key.map(str::to_string);
        config.booking_processing_delay_ms = 0;

        let factory_log = log.clone();
        let state = AppState::with_realtime_factory(
            config,
            Arc::new(move |_config: RealtimeConfig| {
                Ok(Box::new(ScriptedRealtime {
                    log: factory_log.clone(),
                    fail_connect,
                    connected: false,
                }) as BoxedRealtime)
            }),
        );
        (state, log)
    }

    fn session(
        state: Arc<AppState>,
    ) -> (
        BookingSession,
        mpsc::Receiver<SessionSignal>,
        mpsc::Receiver<BookingMessageRoute>,
    ) {
        let (tx, rx) = mpsc::channel(1024);
        let (session, signals) = BookingSession::new(state, tx);
        (session, signals, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<BookingMessageRoute>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(route) = rx.try_recv() {
            if let BookingMessageRoute::Outgoing(msg) = route {
                out.push(serde_json::to_value(&msg).unwrap());
            }
        }
        out
    }

    fn states(messages: &[serde_json::Value]) -> Vec<String> {
        messages
            .iter()
            .filter(|m| m["type"] == "state")
            .map(|m| m["state"].as_str().unwrap().to_string())
            .collect()
    }

    fn call(id: &str, name: &str, arguments: &str) -> SessionSignal {
        SessionSignal::Provider(RealtimeEvent::FunctionCall(FunctionCallRequest {
            call_id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
            item_id: None,
        }))
    }

    fn created(id: &str) -> SessionSignal {
        SessionSignal::Provider(RealtimeEvent::ResponseCreated {
            response_id: id.to_string(),
        })
    }

    fn done(id: &str) -> SessionSignal {
        SessionSignal::Provider(RealtimeEvent::ResponseDone {
            response_id: id.to_string(),
        })
    }

    fn reconnected() -> SessionSignal {
        SessionSignal::Provider(RealtimeEvent::Reconnected(ReconnectionEvent {
            attempt: 1,
            success: true,
            error: None,
        }))
    }

    fn create_count(log: &CallLog) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .filter(|l| *l == "create_response")
            .count()
    }

    /// 50 ms of Float32 microphone audio at 24 kHz, less than one frame
    fn short_capture() -> Bytes {
        std::iter::repeat_n(0.1f32.to_le_bytes(), 1200)
            .flatten()
            .collect::<Vec<u8>>()
            .into()
    }

    async fn started() -> (
        BookingSession,
        mpsc::Receiver<SessionSignal>,
        mpsc::Receiver<BookingMessageRoute>,
        CallLog,
    ) {
        let (state, log) = app_state(Some("sk-test"), false);
        let (mut session, signals, mut rx) = session(state);
        session
            .handle_message(BookingIncomingMessage::Start(StartOptions::default()))
            .await;
        assert_eq!(session.state(), BookingState::ListeningRef);
        drain(&mut rx);
        (session, signals, rx, log)
    }

    #[tokio::test]
    async fn test_start_connects_and_greets() {
        let (state, log) = app_state(Some("sk-test"), false);
        let (mut session, _signals, mut rx) = session(state);

        session
            .handle_message(BookingIncomingMessage::Start(StartOptions {
                voice: Some("Verse".to_string()),
                ..Default::default()
            }))
            .await;

        let messages = drain(&mut rx);
        assert_eq!(states(&messages), vec!["connecting", "listening_ref"]);
        let started = messages
            .iter()
            .find(|m| m["type"] == "session_started")
            .expect("session_started sent");
        assert_eq!(started["voice"], "verse");
        assert_eq!(started["output_sample_rate"], 24000);
        assert!(session.session_id().is_some());

        let log = log.lock().unwrap().clone();
        assert_eq!(log, vec!["connect", "create_response"]);
    }

    #[tokio::test]
    async fn test_full_booking_flow() {
        let (mut session, mut signals, mut rx, log) = started().await;

        session
            .handle_signal(call(
                "c1",
                "submit_reference_number",
                r#"{"reference_number":"123 45 67"}"#,
            ))
            .await;
        session
            .handle_signal(call("c2", "confirm_reference_number", r#"{"confirmed":true}"#))
            .await;
        session
            .handle_signal(call("c3", "submit_token_number", r#"{"token_number":"654321"}"#))
            .await;
        session
            .handle_signal(call("c4", "confirm_token_number", r#"{"confirmed":"yes"}"#))
            .await;
        session
            .handle_signal(call("c5", "confirm_booking", r#"{"proceed":true}"#))
            .await;
        assert_eq!(session.state(), BookingState::Processing);

        let fulfilled = tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .expect("fulfillment in time")
            .expect("signal");
        session.handle_signal(fulfilled).await;
        assert_eq!(session.state(), BookingState::Success);

        let record = session.machine().record();
        assert_eq!(record.reference_number.as_deref(), Some("1234567"));
        assert_eq!(record.token_number.as_deref(), Some("654321"));
        assert!(record.is_complete());

        let messages = drain(&mut rx);
        assert_eq!(
            states(&messages),
            vec![
                "confirming_ref",
                "listening_token",
                "confirming_token",
                "confirming_booking",
                "processing",
                "success"
            ]
        );
        let complete = messages
            .iter()
            .find(|m| m["type"] == "booking_complete")
            .expect("booking_complete sent");
        assert!(complete["record"]["container_number"].as_str().is_some());

        let log = log.lock().unwrap().clone();
        let results: Vec<&String> = log.iter().filter(|l| l.starts_with("result:")).collect();
        assert_eq!(results.len(), 5);
        assert!(results[4].starts_with("result:c5:"));
        assert!(results[4].contains(r#""state":"success""#));
    }

    #[tokio::test]
    async fn test_function_results_share_one_follow_up_response() {
        let (mut session, _signals, _rx, log) = started().await;
        session.handle_signal(done("resp_greet")).await;
        session.handle_signal(created("resp_1")).await;
        log.lock().unwrap().clear();

        // Two calls from the same response, before its response.done
        session
            .handle_signal(call(
                "c1",
                "submit_reference_number",
                r#"{"reference_number":"1234567"}"#,
            ))
            .await;
        session
            .handle_signal(call("c2", "confirm_reference_number", r#"{"confirmed":true}"#))
            .await;
        assert_eq!(session.state(), BookingState::ListeningToken);
        {
            let log = log.lock().unwrap();
            assert_eq!(log.len(), 2);
            assert!(log[0].starts_with("result:c1:"));
            assert!(log[1].starts_with("result:c2:"));
        }

        session.handle_signal(done("resp_1")).await;
        assert_eq!(create_count(&log), 1);
        assert_eq!(
            log.lock().unwrap().last().map(String::as_str),
            Some("create_response")
        );

        // Nothing is owed after the follow-up finishes.
        session.handle_signal(done("resp_2")).await;
        assert_eq!(create_count(&log), 1);
    }

    #[tokio::test]
    async fn test_text_waits_for_active_response() {
        let (mut session, _signals, _rx, log) = started().await;
        assert_eq!(create_count(&log), 1);

        session
            .handle_message(BookingIncomingMessage::Text {
                text: "my reference is 1234567".to_string(),
            })
            .await;
        assert_eq!(create_count(&log), 1);

        session.handle_signal(done("resp_greet")).await;
        assert_eq!(create_count(&log), 2);
    }

    #[tokio::test]
    async fn test_malformed_reference_is_ignored() {
        let (mut session, _signals, mut rx, log) = started().await;

        session
            .handle_signal(call(
                "c1",
                "submit_reference_number",
                r#"{"reference_number":"12345"}"#,
            ))
            .await;
        assert_eq!(session.state(), BookingState::ListeningRef);
        assert!(states(&drain(&mut rx)).is_empty());

        session
            .handle_signal(call("c2", "submit_reference_number", "{not json"))
            .await;
        assert_eq!(session.state(), BookingState::ListeningRef);

        let log = log.lock().unwrap().clone();
        assert!(log.iter().any(|l| l.starts_with("result:c1:") && l.contains("ignored")));
        assert!(log.iter().any(|l| l.starts_with("result:c2:") && l.contains("error")));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails() {
        let (state, log) = app_state(None, false);
        let (mut session, _signals, mut rx) = session(state);

        session
            .handle_message(BookingIncomingMessage::Start(StartOptions::default()))
            .await;

        assert_eq!(session.state(), BookingState::Error);
        assert!(session.machine().error_message().unwrap().contains("OPENAI_API_KEY"));
        let messages = drain(&mut rx);
        assert!(messages.iter().any(|m| m["code"] == "missing_api_key"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connection_failure_fails_then_retry_allowed() {
        let (state, _log) = app_state(Some("sk-test"), true);
        let (mut session, _signals, mut rx) = session(state);

        session
            .handle_message(BookingIncomingMessage::Start(StartOptions::default()))
            .await;
        assert_eq!(session.state(), BookingState::Error);
        let messages = drain(&mut rx);
        assert_eq!(states(&messages), vec!["connecting", "error"]);
        assert!(messages.iter().any(|m| m["code"] == "connection_error"));

        // Error is left by starting again.
        session
            .handle_message(BookingIncomingMessage::Start(StartOptions::default()))
            .await;
        assert_eq!(states(&drain(&mut rx))[0], "connecting");
    }

    #[tokio::test]
    async fn test_unsupported_input_rate_is_microphone_error() {
        let (state, _log) = app_state(Some("sk-test"), false);
        let (mut session, _signals, mut rx) = session(state);

        session
            .handle_message(BookingIncomingMessage::Start(StartOptions {
                input_sample_rate: Some(1000),
                ..Default::default()
            }))
            .await;
        assert_eq!(session.state(), BookingState::Error);
        assert!(drain(&mut rx).iter().any(|m| m["code"] == "microphone_error"));
    }

    #[tokio::test]
    async fn test_microphone_error_message() {
        let (mut session, _signals, mut rx, log) = started().await;

        session
            .handle_message(BookingIncomingMessage::MicrophoneError {
                message: "Permission denied".to_string(),
            })
            .await;

        assert_eq!(session.state(), BookingState::Error);
        assert_eq!(
            session.machine().error_message(),
            Some("Microphone unavailable: Permission denied")
        );
        assert_eq!(states(&drain(&mut rx)), vec!["error"]);
        assert!(log.lock().unwrap().contains(&"disconnect".to_string()));
    }

    #[tokio::test]
    async fn test_audio_is_framed_before_forwarding() {
        let (mut session, _signals, _rx, log) = started().await;

        // 150 ms of Float32 at 24 kHz: one 100 ms frame goes out, 50 ms waits.
        let samples: Vec<u8> = std::iter::repeat_n(0.1f32.to_le_bytes(), 3600)
            .flatten()
            .collect();
        session.handle_audio(Bytes::from(samples)).await;

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log.iter().filter(|l| l.starts_with("audio:")).collect::<Vec<_>>(),
            vec!["audio:4800"]
        );
    }

    #[tokio::test]
    async fn test_barge_in_interrupts_playback() {
        let (mut session, _signals, mut rx, log) = started().await;

        session
            .handle_signal(SessionSignal::Provider(RealtimeEvent::Audio(
                RealtimeAudioData {
                    data: encode_pcm16(&vec![0.2; 24000]),
                    sample_rate: 24000,
                    item_id: Some("item_7".to_string()),
                    response_id: Some("resp_1".to_string()),
                },
            )))
            .await;
        assert!(matches!(
            rx.try_recv(),
            Ok(BookingMessageRoute::Audio(data)) if data.len() == 48000
        ));

        session
            .handle_signal(SessionSignal::Provider(RealtimeEvent::Speech(
                SpeechEvent::Started {
                    audio_start_ms: 900,
                    item_id: None,
                },
            )))
            .await;

        let messages = drain(&mut rx);
        assert_eq!(messages[0]["type"], "speech_event");
        let interrupted = messages
            .iter()
            .find(|m| m["type"] == "interrupted")
            .expect("interrupted sent");
        assert_eq!(interrupted["item_id"], "item_7");

        let log = log.lock().unwrap().clone();
        assert!(log.iter().any(|l| l.starts_with("truncate:item_7:")));
        // Server-side VAD cancels the response itself.
        assert!(!log.contains(&"cancel_response".to_string()));
    }

    #[tokio::test]
    async fn test_start_over_after_success() {
        let (mut session, mut signals, mut rx, log) = started().await;
        for (id, name, args) in [
            ("c1", "submit_reference_number", r#"{"reference_number":"7654321"}"#),
            ("c2", "confirm_reference_number", r#"{"confirmed":true}"#),
            ("c3", "submit_token_number", r#"{"token_number":"111222"}"#),
            ("c4", "confirm_token_number", r#"{"confirmed":true}"#),
            ("c5", "confirm_booking", r#"{"proceed":true}"#),
        ] {
            session.handle_signal(call(id, name, args)).await;
        }
        let fulfilled = signals.recv().await.unwrap();
        session.handle_signal(fulfilled).await;
        assert_eq!(session.state(), BookingState::Success);
        drain(&mut rx);

        session.handle_message(BookingIncomingMessage::StartOver).await;
        assert_eq!(session.state(), BookingState::ListeningRef);
        assert_eq!(session.machine().record(), &Default::default());
        assert_eq!(states(&drain(&mut rx)), vec!["listening_ref"]);
        assert!(
            log.lock()
                .unwrap()
                .iter()
                .any(|l| l.starts_with("text:") && l.contains("new booking"))
        );
    }

    #[tokio::test]
    async fn test_stop_discards_pending_fulfillment() {
        let (mut session, mut signals, mut rx, log) = started().await;
        for (id, name, args) in [
            ("c1", "submit_reference_number", r#"{"reference_number":"7654321"}"#),
            ("c2", "confirm_reference_number", r#"{"confirmed":true}"#),
            ("c3", "submit_token_number", r#"{"token_number":"111222"}"#),
            ("c4", "confirm_token_number", r#"{"confirmed":true}"#),
            ("c5", "confirm_booking", r#"{"proceed":true}"#),
        ] {
            session.handle_signal(call(id, name, args)).await;
        }
        assert_eq!(session.state(), BookingState::Processing);

        session.handle_message(BookingIncomingMessage::Stop).await;
        assert_eq!(session.state(), BookingState::Idle);

        let fulfilled = signals.recv().await.unwrap();
        session.handle_signal(fulfilled).await;
        assert_eq!(session.state(), BookingState::Idle);
        assert!(drain(&mut rx).iter().all(|m| m["type"] != "booking_complete"));
        assert!(!log.lock().unwrap().iter().any(|l| l.starts_with("result:c5")));
    }

    #[tokio::test]
    async fn test_reconnect_restores_booking_context() {
        let (mut session, _signals, mut rx, log) = started().await;
        for (id, name, args) in [
            ("c1", "submit_reference_number", r#"{"reference_number":"7654321"}"#),
            ("c2", "confirm_reference_number", r#"{"confirmed":true}"#),
            ("c3", "submit_token_number", r#"{"token_number":"111222"}"#),
        ] {
            session.handle_signal(call(id, name, args)).await;
        }
        assert_eq!(session.state(), BookingState::ConfirmingToken);
        drain(&mut rx);
        log.lock().unwrap().clear();

        // The old response never finishes on the new server session.
        session.handle_signal(reconnected()).await;
        assert_eq!(session.state(), BookingState::ConfirmingToken);

        let log = log.lock().unwrap().clone();
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with("text:"));
        assert!(log[0].contains("confirming_token"));
        assert!(log[0].contains("7654321"));
        assert!(log[0].contains("111222"));
        assert_eq!(log[1], "create_response");
        assert!(drain(&mut rx).iter().any(|m| m["type"] == "reconnected"));
    }

    #[tokio::test]
    async fn test_reconnect_while_processing_drops_stale_call() {
        let (mut session, mut signals, _rx, log) = started().await;
        for (id, name, args) in [
            ("c1", "submit_reference_number", r#"{"reference_number":"7654321"}"#),
            ("c2", "confirm_reference_number", r#"{"confirmed":true}"#),
            ("c3", "submit_token_number", r#"{"token_number":"111222"}"#),
            ("c4", "confirm_token_number", r#"{"confirmed":true}"#),
            ("c5", "confirm_booking", r#"{"proceed":true}"#),
        ] {
            session.handle_signal(call(id, name, args)).await;
        }
        assert_eq!(session.state(), BookingState::Processing);

        session.handle_signal(reconnected()).await;
        let fulfilled = tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .expect("fulfillment in time")
            .expect("signal");
        session.handle_signal(fulfilled).await;
        assert_eq!(session.state(), BookingState::Success);

        let container = session
            .machine()
            .record()
            .container_number
            .clone()
            .expect("container assigned");
        let log = log.lock().unwrap().clone();
        assert!(!log.iter().any(|l| l.starts_with("result:c5")));
        assert!(
            log.iter()
                .any(|l| l.starts_with("text:") && l.contains("success") && l.contains(&container))
        );
    }

    #[tokio::test]
    async fn test_start_over_discards_buffered_microphone_audio() {
        let (mut session, _signals, _rx, log) = started().await;

        session.handle_audio(short_capture()).await;
        session.handle_message(BookingIncomingMessage::StartOver).await;
        assert!(log.lock().unwrap().contains(&"clear_audio_buffer".to_string()));

        // 60 ms more; with the old 50 ms still buffered this would fill a frame.
        let more: Vec<u8> = std::iter::repeat_n(0.1f32.to_le_bytes(), 1440)
            .flatten()
            .collect();
        session.handle_audio(Bytes::from(more)).await;
        assert!(!log.lock().unwrap().iter().any(|l| l.starts_with("audio:")));
    }

    #[tokio::test]
    async fn test_text_flushes_buffered_microphone_audio() {
        let (mut session, _signals, _rx, log) = started().await;

        session.handle_audio(short_capture()).await;
        session
            .handle_message(BookingIncomingMessage::Text {
                text: "hello".to_string(),
            })
            .await;

        let log = log.lock().unwrap().clone();
        let audio = log.iter().position(|l| l == "audio:2400").expect("tail sent");
        let text = log.iter().position(|l| l == "text:hello").expect("text sent");
        assert!(audio < text);
    }

    #[tokio::test]
    async fn test_fatal_provider_error_moves_to_error() {
        let (mut session, _signals, mut rx, _log) = started().await;

        session
            .handle_signal(SessionSignal::Provider(RealtimeEvent::Error(
                RealtimeError::ConnectionFailed("Connection lost after 5 reconnection attempts".to_string()),
            )))
            .await;
        assert_eq!(session.state(), BookingState::Error);
        assert!(drain(&mut rx).iter().any(|m| m["code"] == "connection_error"));
    }

    #[tokio::test]
    async fn test_text_requires_session() {
        let (state, _log) = app_state(Some("sk-test"), false);
        let (mut session, _signals, mut rx) = session(state);

        session
            .handle_message(BookingIncomingMessage::Text {
                text: "hello".to_string(),
            })
            .await;
        assert!(drain(&mut rx).iter().any(|m| m["code"] == "not_connected"));
    }

    #[test]
    fn test_build_realtime_config() {
        let mut config = ServerConfig::default();
        config.realtime_url = Some("ws://127.0.0.1:9000".to_string());
        config.transcription_model = None;

        let realtime = build_realtime_config(&config, "sk-test".to_string(), "sage");
        assert_eq!(realtime.api_key, "sk-test");
        assert_eq!(realtime.endpoint.as_deref(), Some("ws://127.0.0.1:9000"));
        assert_eq!(realtime.voice.as_deref(), Some("sage"));
        assert_eq!(realtime.tools.len(), 5);
        assert!(realtime.input_audio_transcription.is_none());
        assert!(realtime.instructions.unwrap().contains("reference number"));
    }
}
