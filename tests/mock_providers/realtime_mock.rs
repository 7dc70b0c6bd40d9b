//! Realtime API Mock Server
//!
//! Speaks the subset of the OpenAI Realtime protocol the gateway uses:
//! - sends `session.created` on connect and `session.updated` on update
//! - plays one scripted batch of server events per `response.create`
//! - rejects `response.create` while a response is still active, like the
//!   hosted API does
//! - records every client event for assertions

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Path the mock serves; clients connect to `url()`
pub const REALTIME_PATH: &str = "/v1/realtime";

/// Behavior of the mock server
#[derive(Clone, Debug, Default)]
pub struct MockScript {
    /// One batch of server events per `response.create`, in order
    pub responses: Vec<Vec<Value>>,
    /// Reject the handshake with 401
    pub reject_auth: bool,
    /// Drop the first connection right after `session.update`
    pub drop_first_connection: bool,
    /// Delay before each batch's closing `response.done`
    pub response_latency: Duration,
}

/// Shared server state
#[derive(Default)]
struct MockState {
    responses: Mutex<VecDeque<Vec<Value>>>,
    received: Mutex<Vec<Value>>,
    authorization: Mutex<Vec<String>>,
    paths: Mutex<Vec<String>>,
    connection_count: AtomicU64,
    response_count: AtomicU64,
    rejected_responses: AtomicU64,
}

pub struct MockRealtimeServer {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockRealtimeServer {
    pub async fn start(script: MockScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock realtime server");
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(MockState {
            responses: Mutex::new(script.responses.clone().into()),
            ..Default::default()
        });

        let server_state = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = server_state.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state, script).await;
                });
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// Endpoint to configure as `realtime_url`
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, REALTIME_PATH)
    }

    pub fn connection_count(&self) -> u64 {
        self.state.connection_count.load(Ordering::SeqCst)
    }

    /// `response.create` events refused because a response was active
    pub fn rejected_response_count(&self) -> u64 {
        self.state.rejected_responses.load(Ordering::SeqCst)
    }

    pub async fn received(&self) -> Vec<Value> {
        self.state.received.lock().await.clone()
    }

    pub async fn received_types(&self) -> Vec<String> {
        self.received()
            .await
            .iter()
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect()
    }

    /// Client events of one type, in arrival order
    pub async fn received_of(&self, event_type: &str) -> Vec<Value> {
        self.received()
            .await
            .into_iter()
            .filter(|event| event["type"] == event_type)
            .collect()
    }

    pub async fn authorization_headers(&self) -> Vec<String> {
        self.state.authorization.lock().await.clone()
    }

    pub async fn request_paths(&self) -> Vec<String> {
        self.state.paths.lock().await.clone()
    }

    /// Poll until `count` events of `event_type` arrived or `timeout` elapsed
    pub async fn wait_for(&self, event_type: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.received_of(event_type).await.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<MockState>,
    script: MockScript,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut authorization = None;
    let mut path = None;
    let reject = script.reject_auth;
    let callback = |request: &Request, response: Response| {
        authorization = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        path = Some(request.uri().to_string());
        if reject {
            let mut error = ErrorResponse::new(Some("invalid api key".to_string()));
            *error.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(error);
        }
        Ok(response)
    };
    let ws_stream = accept_hdr_async(stream, callback).await;

    if let Some(value) = authorization {
        state.authorization.lock().await.push(value);
    }
    if let Some(value) = path {
        state.paths.lock().await.push(value);
    }
    let ws_stream = ws_stream?;

    let connection = state.connection_count.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut write, mut read) = ws_stream.split();

    // Responses are played from their own tasks, so writes go through a channel.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let close = matches!(message, Message::Close(_));
            if write.send(message).await.is_err() || close {
                break;
            }
        }
    });
    let send = |event: Value| {
        let _ = out_tx.send(Message::Text(event.to_string().into()));
    };

    send(json!({
        "type": "session.created",
        "session": { "id": format!("sess_mock_{connection}"), "model": "gpt-4o-realtime-preview" }
    }));

    let response_active = Arc::new(AtomicBool::new(false));

    while let Some(msg) = read.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let event: Value = serde_json::from_str(&text)?;
        let event_type = event["type"].as_str().unwrap_or_default().to_string();
        state.received.lock().await.push(event);

        match event_type.as_str() {
            "session.update" => {
                send(json!({
                    "type": "session.updated",
                    "session": { "id": format!("sess_mock_{connection}") }
                }));

                if script.drop_first_connection && connection == 1 {
                    let _ = out_tx.send(Message::Close(None));
                    break;
                }
            }
            "response.create" => {
                if response_active.swap(true, Ordering::SeqCst) {
                    state.rejected_responses.fetch_add(1, Ordering::SeqCst);
                    send(json!({
                        "type": "error",
                        "error": {
                            "type": "invalid_request_error",
                            "code": "conversation_already_has_active_response",
                            "message": "Conversation already has an active response"
                        }
                    }));
                    continue;
                }

                let n = state.response_count.fetch_add(1, Ordering::SeqCst) + 1;
                let batch = state.responses.lock().await.pop_front();
                let mut batch = batch.unwrap_or_else(|| vec![response_done(&format!("resp_{n}"))]);
                let done = match batch.last() {
                    Some(last) if last["type"] == "response.done" => batch.pop(),
                    _ => None,
                };
                let response_id = done
                    .as_ref()
                    .and_then(|d| d["response"]["id"].as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("resp_{n}"));

                let out_tx = out_tx.clone();
                let active = response_active.clone();
                let latency = script.response_latency;
                tokio::spawn(async move {
                    let send = |event: &Value| {
                        let _ = out_tx.send(Message::Text(event.to_string().into()));
                    };
                    send(&json!({
                        "type": "response.created",
                        "response": { "id": response_id, "status": "in_progress" }
                    }));
                    for event in &batch {
                        send(event);
                    }
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    active.store(false, Ordering::SeqCst);
                    if let Some(done) = &done {
                        send(done);
                    }
                });
            }
            _ => {}
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

// =============================================================================
// Scripted server events
// =============================================================================

pub fn response_done(response_id: &str) -> Value {
    json!({
        "type": "response.done",
        "response": { "id": response_id, "status": "completed" }
    })
}

/// Model response that only calls one function
pub fn function_call_turn(response_id: &str, call_id: &str, name: &str, arguments: Value) -> Vec<Value> {
    let item_id = format!("item_{call_id}");
    vec![
        json!({
            "type": "response.output_item.added",
            "response_id": response_id,
            "output_index": 0,
            "item": { "id": item_id, "type": "function_call", "call_id": call_id, "name": name }
        }),
        json!({
            "type": "response.function_call_arguments.done",
            "response_id": response_id,
            "item_id": item_id,
            "call_id": call_id,
            "arguments": arguments.to_string()
        }),
        response_done(response_id),
    ]
}

/// Model response with speech: transcript plus `audio_ms` of PCM16 audio
pub fn spoken_turn(response_id: &str, item_id: &str, text: &str, audio_ms: u32) -> Vec<Value> {
    let samples = (24_000 * audio_ms / 1000) as usize;
    let pcm: Vec<u8> = std::iter::repeat_n(1000i16.to_le_bytes(), samples)
        .flatten()
        .collect();
    vec![
        json!({
            "type": "response.audio.delta",
            "response_id": response_id,
            "item_id": item_id,
            "output_index": 0,
            "content_index": 0,
            "delta": BASE64_STANDARD.encode(&pcm)
        }),
        json!({
            "type": "response.audio_transcript.done",
            "item_id": item_id,
            "transcript": text
        }),
        response_done(response_id),
    ]
}
