//! One streaming HTTP request per turn, plus the session control endpoints.
//!
//! `send` posts the user's utterance and consumes the SSE-framed response
//! stream until it ends, the server reports `error`/`interrupted`, or the
//! local cancellation token fires. Cancellation is cooperative and biased:
//! once the token fires, no further event reaches the consumer even if
//! decoded bytes are already sitting in the parser.
//!
//! Exactly one cancellation token exists per in-flight turn. Cancelling is
//! idempotent, and cancelling after the stream finished is harmless.

use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dialog::TurnId;
use crate::error::{ConfabError, Result};
use crate::protocol::{sse::SseParser, Event};

/// Server endpoint layout. The exact paths are a collaborator contract;
/// these defaults match the reference server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL without trailing slash (e.g. `http://127.0.0.1:8000`).
    pub base_url: String,
    pub start_session_path: String,
    pub end_session_path: String,
    pub send_turn_path: String,
    pub interrupt_path: String,
    /// Connect timeout for every request. Streaming reads have no overall
    /// deadline — responses legitimately run for many seconds.
    pub connect_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            start_session_path: "/api/call/start".into(),
            end_session_path: "/api/call/end".into(),
            send_turn_path: "/api/voice-chat/stream".into(),
            interrupt_path: "/api/call/interrupt".into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ApiConfig {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Everything needed to send one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    /// Client-side association token; not part of the wire body.
    pub turn_id: TurnId,
    /// Base64 data-URI audio payload.
    pub audio: Option<String>,
    /// Typed text, for text turns.
    pub text: Option<String>,
    /// Last VAD level, for server-side gain hints.
    pub audio_level: Option<f32>,
}

#[derive(Serialize)]
struct TurnBody<'a> {
    session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_level: Option<f32>,
}

#[derive(Deserialize)]
struct StartSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct SessionBody<'a> {
    session_id: &'a str,
}

/// How a turn's stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Server closed the stream normally.
    Completed,
    /// Server sent an `error` event; the message is user-surfaceable.
    ServerError(String),
    /// Server acknowledged an interrupt and stopped.
    Interrupted,
    /// The local cancellation token fired.
    Cancelled,
}

/// Owns the HTTP client and the active turn's cancellation token.
pub struct ResponseStreamController {
    client: reqwest::Client,
    api: ApiConfig,
    active_cancel: Mutex<Option<CancellationToken>>,
}

impl ResponseStreamController {
    pub fn new(api: ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(api.connect_timeout)
            .build()
            .map_err(|e| ConfabError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            api,
            active_cancel: Mutex::new(None),
        })
    }

    /// Open a server session; returns the session id.
    pub async fn start_session(&self) -> Result<String> {
        let resp = self
            .client
            .post(self.api.url(&self.api.start_session_path))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| ConfabError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ConfabError::Connection(format!(
                "start session failed: HTTP {}",
                resp.status()
            )));
        }

        let body: StartSessionResponse = resp
            .json()
            .await
            .map_err(|e| ConfabError::Protocol(format!("start session response: {e}")))?;
        Ok(body.session_id)
    }

    /// Tell the server the call ended. Best-effort; failures are logged.
    pub async fn end_session(&self, session_id: &str) {
        let result = self
            .client
            .post(self.api.url(&self.api.end_session_path))
            .json(&SessionBody { session_id })
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to notify server of call end");
        }
    }

    /// Tell the server to stop generating for this session. Best-effort —
    /// local cancellation never waits on this.
    pub async fn interrupt_session(&self, session_id: &str) {
        let result = self
            .client
            .post(self.api.url(&self.api.interrupt_path))
            .json(&SessionBody { session_id })
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to deliver interrupt to server");
        }
    }

    /// Send one turn and consume its response stream.
    ///
    /// `on_event` sees every decoded event in arrival order, including the
    /// terminal `Error`/`Interrupted` event when the server sends one.
    pub async fn send(
        &self,
        request: &TurnRequest,
        on_event: impl FnMut(Event),
    ) -> Result<StreamOutcome> {
        let cancel = CancellationToken::new();
        *self.active_cancel.lock() = Some(cancel.clone());

        let body = TurnBody {
            session_id: &request.session_id,
            audio: request.audio.as_deref(),
            text: request.text.as_deref(),
            audio_level: request.audio_level,
        };

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            resp = self
                .client
                .post(self.api.url(&self.api.send_turn_path))
                .json(&body)
                .send() => resp.map_err(|e| ConfabError::Connection(e.to_string()))?,
        };

        if !resp.status().is_success() {
            return Err(ConfabError::Connection(format!(
                "send turn failed: HTTP {}",
                resp.status()
            )));
        }

        debug!(turn = %request.turn_id, "response stream open");
        // Box::pin: the body stream is not Unpin.
        consume_stream(Box::pin(resp.bytes_stream()), cancel, on_event).await
    }

    /// Abort the in-flight turn's stream, if any. Idempotent; cancelling a
    /// turn that already finished is a no-op.
    pub fn cancel_active(&self) {
        if let Some(token) = self.active_cancel.lock().take() {
            token.cancel();
        }
    }
}

/// Drain an SSE byte stream into events until a terminal condition.
///
/// Kept free of HTTP types so the turn lifecycle is testable with scripted
/// byte streams.
async fn consume_stream<B, E, S, F>(
    mut stream: S,
    cancel: CancellationToken,
    mut on_event: F,
) -> Result<StreamOutcome>
where
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    S: futures_util::Stream<Item = std::result::Result<B, E>> + Unpin,
    F: FnMut(Event),
{
    let mut parser = SseParser::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.push(bytes.as_ref()) {
                    match event {
                        Event::Error(message) => {
                            on_event(Event::Error(message.clone()));
                            return Ok(StreamOutcome::ServerError(message));
                        }
                        Event::Interrupted => {
                            on_event(Event::Interrupted);
                            return Ok(StreamOutcome::Interrupted);
                        }
                        other => on_event(other),
                    }
                }
            }
            Some(Err(e)) => return Err(ConfabError::Connection(e.to_string())),
            None => {
                if parser.has_partial() {
                    warn!("stream ended with a partial record buffered");
                }
                return Ok(StreamOutcome::Completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    type Chunk = std::result::Result<Vec<u8>, Infallible>;

    fn ok(bytes: &[u8]) -> Chunk {
        Ok(bytes.to_vec())
    }

    #[tokio::test]
    async fn normal_stream_completes_after_forwarding_events() {
        let chunks = vec![
            ok(b"data: {\"type\":\"text\",\"content\":\"Hel\"}\n\n"),
            ok(b"data: {\"type\":\"text\",\"content\":\"lo\"}\n\n"),
        ];
        let mut seen = Vec::new();
        let outcome = consume_stream(
            stream::iter(chunks),
            CancellationToken::new(),
            |ev| seen.push(ev),
        )
        .await
        .unwrap();

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(
            seen,
            vec![Event::Text("Hel".into()), Event::Text("lo".into())]
        );
    }

    #[tokio::test]
    async fn server_error_event_terminates_the_stream_early() {
        let chunks = vec![
            ok(b"data: {\"type\":\"text\",\"content\":\"a\"}\n\n"),
            ok(b"data: {\"type\":\"error\",\"content\":\"model unavailable\"}\n\n"),
            ok(b"data: {\"type\":\"text\",\"content\":\"never\"}\n\n"),
        ];
        let mut seen = Vec::new();
        let outcome = consume_stream(
            stream::iter(chunks),
            CancellationToken::new(),
            |ev| seen.push(ev),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            StreamOutcome::ServerError("model unavailable".into())
        );
        // The post-error event never reached the consumer
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], Event::Error("model unavailable".into()));
    }

    #[tokio::test]
    async fn server_interrupt_acknowledgement_stops_quietly() {
        let chunks = vec![ok(b"data: {\"type\":\"interrupted\"}\n\n")];
        let mut seen = Vec::new();
        let outcome = consume_stream(
            stream::iter(chunks),
            CancellationToken::new(),
            |ev| seen.push(ev),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StreamOutcome::Interrupted);
        assert_eq!(seen, vec![Event::Interrupted]);
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_reads() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = consume_stream(
            stream::pending::<Chunk>(),
            cancel,
            |_| panic!("no event may be delivered after cancellation"),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_suppresses_already_buffered_chunks() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Bytes are sitting in the stream, but the biased select must
        // observe the token first.
        let chunks = vec![ok(b"data: {\"type\":\"text\",\"content\":\"ghost\"}\n\n")];
        let outcome = consume_stream(stream::iter(chunks), cancel, |_| {
            panic!("ghost event leaked past cancellation")
        })
        .await
        .unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
    }

    #[tokio::test]
    async fn record_split_across_chunks_is_reassembled() {
        let chunks = vec![
            ok(b"data: {\"type\":\"audio\",\"content\":\"AA"),
            ok(b"AA\"}\n\n"),
        ];
        let mut seen = Vec::new();
        let outcome = consume_stream(
            stream::iter(chunks),
            CancellationToken::new(),
            |ev| seen.push(ev),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(seen, vec![Event::Audio("AAAA".into())]);
    }

    #[test]
    fn cancel_active_is_idempotent() {
        let controller = ResponseStreamController::new(ApiConfig::default()).unwrap();
        controller.cancel_active();
        controller.cancel_active();
    }

    #[test]
    fn api_config_joins_urls_without_double_slashes() {
        let api = ApiConfig {
            base_url: "http://localhost:8000/".into(),
            ..ApiConfig::default()
        };
        assert_eq!(
            api.url(&api.send_turn_path),
            "http://localhost:8000/api/voice-chat/stream"
        );
    }
}
