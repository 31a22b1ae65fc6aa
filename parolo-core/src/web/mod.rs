//! Caption board HTTP/WebSocket server.
//!
//! Serves the static board at `/`, its language config at `/config`, and a
//! WebSocket fan-out at `/ws`. Publishing never blocks the pipeline: each
//! client has a bounded drop-oldest outbox drained by its own send loop, so
//! one stuck browser tab costs itself captions, not the meeting.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{TranslationConfig, WebConfig};
use crate::error::{ParoloError, Result};
use crate::events::EnrichedFinal;
use crate::util::queue::DropOldestQueue;

/// Per-client outbox depth; overflow drops the stalest caption.
const CLIENT_QUEUE_CAPACITY: usize = 32;
/// A single send blocked this long means the client is wedged — disconnect.
const SEND_GRACE: Duration = Duration::from_secs(5);

static BOARD_HTML: &str = include_str!("assets/board.html");

/// Broadcast wire format (§ board protocol): one JSON object per event.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BoardMessage<'a> {
    Partial {
        text: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        speaker: Option<&'a str>,
    },
    Final {
        text: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        speaker: Option<&'a str>,
        translations: &'a BTreeMap<String, String>,
    },
}

#[derive(Serialize, Clone, Debug)]
struct BoardConfigPayload {
    targets: Vec<String>,
    #[serde(rename = "defaultVisibility")]
    default_visibility: BTreeMap<String, bool>,
}

#[derive(Debug)]
struct BroadcasterState {
    clients: DashMap<Uuid, DropOldestQueue<String>>,
    board: BoardConfigPayload,
}

#[derive(Debug)]
pub struct WebBroadcaster {
    state: Arc<BroadcasterState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl WebBroadcaster {
    /// Bind and serve. A port that is already taken is a hard startup error —
    /// the operator gets the exact port to free.
    pub async fn start(config: &WebConfig, translation: &TranslationConfig) -> Result<Self> {
        let state = Arc::new(BroadcasterState {
            clients: DashMap::new(),
            board: BoardConfigPayload {
                targets: translation.targets.clone(),
                default_visibility: translation.default_visibility.clone(),
            },
        });

        let app = Router::new()
            .route("/", get(board_page))
            .route("/config", get(board_config))
            .route("/ws", get(ws_upgrade))
            // Overlay tools (OBS browser sources etc.) fetch /config cross-origin.
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    ParoloError::PortInUse { port: config.port }
                } else {
                    ParoloError::Io(e)
                }
            })?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "caption board server exited with error");
            }
        });

        info!(%addr, "caption board serving");
        Ok(Self {
            state,
            addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client_count(&self) -> usize {
        self.state.clients.len()
    }

    pub fn publish_partial(&self, text: &str, speaker: Option<&str>) {
        self.broadcast(&BoardMessage::Partial { text, speaker });
    }

    pub fn publish_final(&self, enriched: &EnrichedFinal) {
        self.broadcast(&BoardMessage::Final {
            text: &enriched.utterance.text,
            speaker: enriched.utterance.speaker.as_deref(),
            translations: &enriched.translations,
        });
    }

    fn broadcast(&self, message: &BoardMessage<'_>) {
        let Ok(json) = serde_json::to_string(message) else {
            return;
        };
        for entry in self.state.clients.iter() {
            entry.value().push(json.clone());
        }
    }

    /// Close all sockets and stop the server.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for entry in self.state.clients.iter() {
            entry.value().close();
        }
        if self.handle.await.is_err() {
            warn!("caption board server task panicked");
        }
    }
}

async fn board_page() -> Html<&'static str> {
    Html(BOARD_HTML)
}

async fn board_config(State(state): State<Arc<BroadcasterState>>) -> Json<BoardConfigPayload> {
    Json(state.board.clone())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BroadcasterState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

/// RAII registration: the outbox leaves the client map when the handler
/// exits, however it exits.
struct ClientGuard {
    id: Uuid,
    state: Arc<BroadcasterState>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.state.clients.remove(&self.id);
        debug!(client = %self.id, "board client unregistered");
    }
}

async fn handle_client(socket: WebSocket, state: Arc<BroadcasterState>) {
    let id = Uuid::new_v4();
    let outbox: DropOldestQueue<String> = DropOldestQueue::new(CLIENT_QUEUE_CAPACITY);
    state.clients.insert(id, outbox.clone());
    let _guard = ClientGuard {
        id,
        state: Arc::clone(&state),
    };
    info!(client = %id, "board client connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            queued = outbox.pop() => {
                let Some(json) = queued else { break };
                let send = sender.send(Message::Text(json.into()));
                match tokio::time::timeout(SEND_GRACE, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(client = %id, error = %e, "board client send failed");
                        break;
                    }
                    Err(_) => {
                        warn!(client = %id, "board client saturated past grace — disconnecting");
                        break;
                    }
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // The board never sends application data; ignore pings and chatter.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let dropped = outbox.dropped();
    if dropped > 0 {
        debug!(client = %id, dropped, "board client had dropped captions");
    }
}

/// Best-effort browser launch for `WEB_UI_OPEN_BROWSER`.
pub fn open_browser(addr: SocketAddr) {
    let url = format!("http://127.0.0.1:{}/", addr.port());
    #[cfg(target_os = "windows")]
    let result = std::process::Command::new("cmd").args(["/C", "start", &url]).spawn();
    #[cfg(target_os = "macos")]
    let result = std::process::Command::new("open").arg(&url).spawn();
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    let result = std::process::Command::new("xdg-open").arg(&url).spawn();
    if let Err(e) = result {
        warn!(url = url.as_str(), error = %e, "could not open browser");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::StreamExt;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::events::FinalUtterance;

    fn test_configs() -> (WebConfig, TranslationConfig) {
        (
            WebConfig {
                enabled: true,
                port: 0,
                open_browser: false,
            },
            TranslationConfig {
                enabled: true,
                provider: "libretranslate".into(),
                source_language: "eo".into(),
                targets: vec!["ja".into(), "ko".into()],
                default_visibility: [("ja".to_string(), true), ("ko".to_string(), false)]
                    .into_iter()
                    .collect(),
                timeout: Duration::from_secs(8),
                api_url: None,
                api_key: None,
            },
        )
    }

    fn sample_final() -> EnrichedFinal {
        let now = chrono::Utc::now();
        let mut enriched = EnrichedFinal::without_translations(FinalUtterance {
            text: "Bonan tagon.".into(),
            speaker: Some("S1".into()),
            utterance_id: "utt-1".into(),
            started_at: now,
            ended_at: now,
            session_id: "sess".into(),
        });
        enriched
            .translations
            .insert("ja".into(), "こんにちは。".into());
        enriched
    }

    #[tokio::test]
    async fn config_endpoint_reports_targets_and_visibility() {
        let (web, translation) = test_configs();
        let broadcaster = WebBroadcaster::start(&web, &translation).await.expect("start");
        let url = format!("http://{}/config", broadcaster.local_addr());

        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["targets"], serde_json::json!(["ja", "ko"]));
        assert_eq!(body["defaultVisibility"]["ja"], true);
        assert_eq!(body["defaultVisibility"]["ko"], false);

        broadcaster.stop().await;
    }

    #[tokio::test]
    async fn client_receives_partial_then_final_in_order() {
        let (web, translation) = test_configs();
        let broadcaster = WebBroadcaster::start(&web, &translation).await.expect("start");
        let ws_url = format!("ws://{}/ws", broadcaster.local_addr());

        let (mut socket, _) = connect_async(&ws_url).await.expect("ws connect");
        // Wait for registration to land before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        broadcaster.publish_partial("Bonan", None);
        broadcaster.publish_final(&sample_final());

        let first = socket.next().await.expect("first message").expect("ws ok");
        let second = socket.next().await.expect("second message").expect("ws ok");
        let first: serde_json::Value = match first {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        let second: serde_json::Value = match second {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };

        assert_eq!(first["type"], "partial");
        assert_eq!(first["text"], "Bonan");
        assert!(first.get("speaker").is_none());
        assert_eq!(second["type"], "final");
        assert_eq!(second["speaker"], "S1");
        assert_eq!(second["translations"]["ja"], "こんにちは。");

        broadcaster.stop().await;
    }

    #[tokio::test]
    async fn occupied_port_fails_fast_with_actionable_error() {
        let blocker = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let (mut web, translation) = test_configs();
        web.port = port;
        let err = WebBroadcaster::start(&web, &translation)
            .await
            .expect_err("bind must fail");
        match err {
            ParoloError::PortInUse { port: reported } => assert_eq!(reported, port),
            other => panic!("expected PortInUse, got {other}"),
        }
    }

    #[tokio::test]
    async fn disconnected_client_is_removed_from_registry() {
        let (web, translation) = test_configs();
        let broadcaster = WebBroadcaster::start(&web, &translation).await.expect("start");
        let ws_url = format!("ws://{}/ws", broadcaster.local_addr());

        let (socket, _) = connect_async(&ws_url).await.expect("ws connect");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broadcaster.client_count(), 1);

        drop(socket);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broadcaster.client_count(), 0);

        broadcaster.stop().await;
    }
}
