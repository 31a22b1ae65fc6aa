//! Streaming cloud recognizer over WebSocket.
//!
//! ## Session state machine
//!
//! ```text
//! Idle ─► TokenExchange ─► Connecting ─► Starting ─► Streaming ─► Draining ─► Idle
//!              ▲                                         │
//!              └───────────────── Backoff ◄──────────────┘
//! ```
//!
//! The long-lived API key is traded for a short-lived bearer before every
//! connection (`POST /v1/token` on the https twin of the connection URL).
//! Audio is only sent in the Streaming state. On reconnect, audio queued
//! during the outage is discarded except for a smoothing ring of at most
//! one second — raw PCM only, so a replay can never re-emit a final.
//!
//! Wire protocol (JSON text frames from the server, binary PCM16 to it):
//!
//! ```text
//! client → {"type":"start","language":"eo","enablePartials":true,"diarization":true}
//! server → {"type":"recognition_started"}
//! server → {"type":"partial","text":"Bonan","speaker":"S1"}
//! server → {"type":"final","text":"Bonan tagon.","speaker":"S1","startedAt":3.1,"endedAt":4.4}
//! server → {"type":"error","code":"auth_expired","message":"..."}
//! client → {"type":"eos"}
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::frame::FrameQueue;
use crate::backend::{send_event, RecognizerBackend};
use crate::config::CloudConfig;
use crate::error::{ParoloError, Result};
use crate::events::{FinalUtterance, TranscriptEvent};
use crate::util::backoff::Backoff;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// No `recognition_started` within this window aborts the attempt.
const START_TIMEOUT: Duration = Duration::from_secs(10);
/// How long Draining waits for trailing finals after end-of-stream.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Auth rejections in a row before the key is considered dead.
const AUTH_REJECTIONS_FATAL: u32 = 2;
/// Smoothing ring replayed across a reconnect, in seconds of audio.
const REPLAY_SECONDS: f64 = 1.0;

pub struct CloudBackend {
    config: CloudConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Everything the server can say, one tagged blob.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    started_at: Option<f64>,
    #[serde(default)]
    ended_at: Option<f64>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

enum SessionEnd {
    /// Socket lost or server errored — reconnect after backoff.
    Reconnect,
    /// Input drained or cancellation observed — wind down for good.
    Shutdown,
}

impl CloudBackend {
    pub fn new(config: CloudConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// The https twin of the ws connection URL, pointing at the token
    /// endpoint.
    fn token_url(&self) -> Result<url::Url> {
        let mut token_url = url::Url::parse(&self.config.connection_url)
            .map_err(|e| ParoloError::BackendTransient(format!("connection URL: {e}")))?;
        let scheme = if token_url.scheme() == "ws" { "http" } else { "https" };
        token_url
            .set_scheme(scheme)
            .map_err(|_| ParoloError::BackendTransient("cannot derive token URL".into()))?;
        token_url.set_path("/v1/token");
        token_url.set_query(None);
        Ok(token_url)
    }

    /// TokenExchange: long-lived key in, short-lived bearer out.
    ///
    /// Returns `Ok(None)` on a 401/403 — the caller counts those toward the
    /// fatal threshold. Other failures are transient.
    async fn exchange_token(&self) -> Result<Option<String>> {
        let url = self.token_url()?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
            .map_err(|e| ParoloError::BackendTransient(format!("token exchange: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            warn!(%status, "token exchange rejected");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ParoloError::BackendTransient(format!(
                "token exchange returned {status}"
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ParoloError::BackendTransient(format!("token response: {e}")))?;
        Ok(Some(body.token))
    }

    async fn run_session(
        &self,
        bearer: &str,
        frames: &FrameQueue,
        events: &mpsc::Sender<TranscriptEvent>,
        cancel: &CancellationToken,
        replay: &mut VecDeque<Vec<u8>>,
    ) -> Result<SessionEnd> {
        // ── Connecting ───────────────────────────────────────────────────
        let mut request = self
            .config
            .connection_url
            .clone()
            .into_client_request()
            .map_err(|e| ParoloError::BackendTransient(format!("ws request: {e}")))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {bearer}"))
                .map_err(|e| ParoloError::BackendTransient(format!("bearer header: {e}")))?,
        );

        let connect = tokio_tungstenite::connect_async(request);
        let (ws, _response) = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                warn!(error = %e, "websocket connect failed");
                return Ok(SessionEnd::Reconnect);
            }
            Err(_) => {
                warn!("websocket connect timed out");
                return Ok(SessionEnd::Reconnect);
            }
        };
        let (mut write, mut read) = ws.split();

        // ── Starting ─────────────────────────────────────────────────────
        let start_msg = serde_json::json!({
            "type": "start",
            "language": self.config.language,
            "enablePartials": true,
            "diarization": true,
        });
        if write.send(Message::Text(start_msg.to_string().into())).await.is_err() {
            return Ok(SessionEnd::Reconnect);
        }

        let started = tokio::time::timeout(START_TIMEOUT, async {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(event) = serde_json::from_str::<ServerEvent>(&text) else {
                            continue;
                        };
                        match event.kind.as_str() {
                            "recognition_started" => return Ok(()),
                            "error" => return Err(classify_server_error(&event)),
                            _ => {}
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => {
                        return Err(ParoloError::BackendTransient("closed before start".into()))
                    }
                    _ => {}
                }
            }
            Err(ParoloError::BackendTransient("stream ended before start".into()))
        })
        .await;

        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_fatal() => return Err(e),
            Ok(Err(e)) => {
                warn!(error = %e, "session start rejected");
                return Ok(SessionEnd::Reconnect);
            }
            Err(_) => {
                warn!("no recognition_started within {}s", START_TIMEOUT.as_secs());
                return Ok(SessionEnd::Reconnect);
            }
        }

        // ── Streaming ────────────────────────────────────────────────────
        let session_id = Uuid::new_v4().to_string();
        let session_epoch = Utc::now();
        let mut utterance_seq = 0u64;
        info!(session_id = session_id.as_str(), "recognition session established");

        // Frames queued while we were disconnected are stale; the smoothing
        // ring already holds the newest second of audio.
        let mut discarded = 0usize;
        while frames.try_pop().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "discarded frames queued during downtime");
        }
        for pcm in replay.iter() {
            if write.send(Message::Binary(pcm.clone().into())).await.is_err() {
                return Ok(SessionEnd::Reconnect);
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.drain(&mut write, &mut read, events, &session_id,
                                      session_epoch, &mut utterance_seq).await;
                }

                frame = frames.pop() => {
                    match frame {
                        Some(frame) => {
                            push_replay(replay, frame.pcm.clone(), frame.sample_rate);
                            if write.send(Message::Binary(frame.pcm.into())).await.is_err() {
                                warn!("audio send failed — reconnecting");
                                return Ok(SessionEnd::Reconnect);
                            }
                        }
                        None => {
                            // Capture stopped for good.
                            return self.drain(&mut write, &mut read, events, &session_id,
                                              session_epoch, &mut utterance_seq).await;
                        }
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match self.handle_server_text(
                                &text, events, &session_id, session_epoch, &mut utterance_seq,
                            ).await {
                                Ok(true) => {}
                                Ok(false) => return Ok(SessionEnd::Shutdown),
                                Err(e) if e.is_fatal() => return Err(e),
                                Err(e) => {
                                    warn!(error = %e, "server error — reconnecting");
                                    return Ok(SessionEnd::Reconnect);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            warn!(?frame, "server closed the session");
                            return Ok(SessionEnd::Reconnect);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read error");
                            return Ok(SessionEnd::Reconnect);
                        }
                        None => return Ok(SessionEnd::Reconnect),
                    }
                }
            }
        }
    }

    /// Parse one server text frame and forward any transcript event.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` when the pipeline hung up.
    async fn handle_server_text(
        &self,
        text: &str,
        events: &mpsc::Sender<TranscriptEvent>,
        session_id: &str,
        session_epoch: DateTime<Utc>,
        utterance_seq: &mut u64,
    ) -> Result<bool> {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "malformed server event dropped");
                return Ok(true);
            }
        };

        match event.kind.as_str() {
            "partial" => {
                let Some(text) = event.text else { return Ok(true) };
                Ok(send_event(
                    events,
                    TranscriptEvent::Partial {
                        text,
                        speaker: event.speaker,
                        session_id: session_id.to_string(),
                    },
                )
                .await)
            }
            "final" => {
                let Some(text) = event.text else { return Ok(true) };
                *utterance_seq += 1;
                let at = |offset: Option<f64>| {
                    offset
                        .filter(|o| o.is_finite() && *o >= 0.0)
                        .and_then(|o| {
                            chrono::Duration::from_std(std::time::Duration::from_secs_f64(o)).ok()
                        })
                        .map_or_else(Utc::now, |d| session_epoch + d)
                };
                let utterance = FinalUtterance {
                    text,
                    speaker: event.speaker,
                    utterance_id: format!("{session_id}-{utterance_seq}"),
                    started_at: at(event.started_at),
                    ended_at: at(event.ended_at),
                    session_id: session_id.to_string(),
                };
                Ok(send_event(events, TranscriptEvent::Final(utterance)).await)
            }
            "error" => Err(classify_server_error(&event)),
            other => {
                debug!(kind = other, "ignoring unknown server event");
                Ok(true)
            }
        }
    }

    /// Draining: signal end-of-stream and collect trailing finals briefly.
    #[allow(clippy::too_many_arguments)]
    async fn drain<W, R>(
        &self,
        write: &mut W,
        read: &mut R,
        events: &mpsc::Sender<TranscriptEvent>,
        session_id: &str,
        session_epoch: DateTime<Utc>,
        utterance_seq: &mut u64,
    ) -> Result<SessionEnd>
    where
        W: SinkExt<Message> + Unpin,
        R: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let eos = serde_json::json!({"type": "eos"}).to_string();
        let _ = write.send(Message::Text(eos.into())).await;

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    match self
                        .handle_server_text(&text, events, session_id, session_epoch, utterance_seq)
                        .await
                    {
                        Ok(true) => {}
                        _ => break,
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_)) | None) | Err(_) => break,
            }
        }
        let _ = write.send(Message::Close(None)).await;
        Ok(SessionEnd::Shutdown)
    }
}

fn classify_server_error(event: &ServerEvent) -> ParoloError {
    let code = event.code.as_deref().unwrap_or("unknown");
    let message = event.message.as_deref().unwrap_or("no detail");
    match code {
        // The key itself is dead or the protocol does not line up — no
        // amount of reconnecting will help.
        "auth_rejected" | "invalid_api_key" | "unsupported_protocol" => {
            ParoloError::BackendFatal(format!(
                "recognizer rejected the session permanently: {code}: {message} (check CLOUD_API_KEY)"
            ))
        }
        _ => ParoloError::BackendTransient(format!("{code}: {message}")),
    }
}

/// Keep at most [`REPLAY_SECONDS`] of PCM in the smoothing ring.
fn push_replay(replay: &mut VecDeque<Vec<u8>>, pcm: Vec<u8>, sample_rate: u32) {
    let max_bytes = (sample_rate as f64 * REPLAY_SECONDS) as usize * 2;
    replay.push_back(pcm);
    let mut total: usize = replay.iter().map(Vec::len).sum();
    while total > max_bytes && replay.len() > 1 {
        if let Some(dropped) = replay.pop_front() {
            total -= dropped.len();
        }
    }
}

#[async_trait::async_trait]
impl RecognizerBackend for CloudBackend {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn run(
        &mut self,
        frames: FrameQueue,
        events: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut backoff = Backoff::new(BACKOFF_FLOOR, BACKOFF_CAP).with_jitter();
        let mut auth_rejections = 0u32;
        let mut replay: VecDeque<Vec<u8>> = VecDeque::new();

        loop {
            if cancel.is_cancelled() || frames.is_closed() && frames.is_empty() {
                return Ok(());
            }

            // ── TokenExchange ────────────────────────────────────────────
            let bearer = match self.exchange_token().await {
                Ok(Some(token)) => {
                    auth_rejections = 0;
                    token
                }
                Ok(None) => {
                    auth_rejections += 1;
                    if auth_rejections >= AUTH_REJECTIONS_FATAL {
                        return Err(ParoloError::BackendFatal(
                            "CLOUD_API_KEY was rejected repeatedly by the auth endpoint".into(),
                        ));
                    }
                    if sleep_backoff(&mut backoff, &cancel).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "token exchange failed");
                    if sleep_backoff(&mut backoff, &cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            match self
                .run_session(&bearer, &frames, &events, &cancel, &mut replay)
                .await?
            {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Reconnect => {
                    if sleep_backoff(&mut backoff, &cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Backoff sleep that honours cancellation. Returns `true` when cancelled.
async fn sleep_backoff(backoff: &mut Backoff, cancel: &CancellationToken) -> bool {
    let delay = backoff.next_delay();
    debug!(delay_ms = delay.as_millis() as u64, "backing off");
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: &str, code: Option<&str>) -> ServerEvent {
        ServerEvent {
            kind: kind.into(),
            text: None,
            speaker: None,
            started_at: None,
            ended_at: None,
            code: code.map(Into::into),
            message: None,
        }
    }

    #[test]
    fn auth_rejection_is_fatal_expiry_is_not() {
        assert!(classify_server_error(&event("error", Some("auth_rejected"))).is_fatal());
        assert!(!classify_server_error(&event("error", Some("auth_expired"))).is_fatal());
        assert!(!classify_server_error(&event("error", Some("overloaded"))).is_fatal());
    }

    #[test]
    fn replay_ring_is_bounded_to_one_second() {
        let mut replay = VecDeque::new();
        // 0.5 s frames at 16 kHz = 16 000 bytes each; a 1 s ring holds two.
        for _ in 0..10 {
            push_replay(&mut replay, vec![0u8; 16_000], 16_000);
        }
        let total: usize = replay.iter().map(Vec::len).sum();
        assert!(total <= 32_000, "ring grew past 1 s: {total} bytes");
        assert_eq!(replay.len(), 2);
    }

    #[test]
    fn token_url_swaps_scheme_and_path() {
        let backend = CloudBackend::new(CloudConfig {
            api_key: "k".into(),
            connection_url: "wss://stt.example.com/v2/stream?model=eo".into(),
            language: "eo".into(),
        });
        let url = backend.token_url().expect("token url");
        assert_eq!(url.as_str(), "https://stt.example.com/v1/token");
    }

    #[test]
    fn server_event_parses_camel_case_offsets() {
        let raw = r#"{"type":"final","text":"Bonan tagon.","speaker":"S1","startedAt":3.5,"endedAt":4.25}"#;
        let ev: ServerEvent = serde_json::from_str(raw).expect("parse");
        assert_eq!(ev.kind, "final");
        assert_eq!(ev.text.as_deref(), Some("Bonan tagon."));
        assert_eq!(ev.started_at, Some(3.5));
        assert_eq!(ev.ended_at, Some(4.25));
    }
}
