//! Caption endpoint delivery (Zoom closed-caption style).
//!
//! The endpoint accepts plain-text POSTs ordered by a `seq` query parameter.
//! Contract enforced here:
//! - at most one POST in flight (single worker),
//! - at least `min_post_interval` between successful POSTs,
//! - items arriving during the interval coalesce with `\n`,
//! - `seq` starts at 1 and advances only on a 2xx response,
//! - non-2xx retries with backoff, the item is dropped after five
//!   consecutive failures and the worker moves on.

use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::CaptionConfig;
use crate::util::backoff::Backoff;
use crate::util::gate::LogGate;

const RETRY_FLOOR: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(15);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Retry pacing, swappable so tests don't sleep for real seconds.
#[derive(Clone, Copy)]
struct Tuning {
    retry_floor: Duration,
    retry_cap: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            retry_floor: RETRY_FLOOR,
            retry_cap: RETRY_CAP,
        }
    }
}

pub struct CaptionPoster {
    tx: Option<mpsc::UnboundedSender<String>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl CaptionPoster {
    /// Start the delivery worker. With no URL configured the poster is a
    /// permanent no-op.
    pub fn start(config: CaptionConfig) -> Self {
        Self::start_with_tuning(config, Tuning::default())
    }

    fn start_with_tuning(config: CaptionConfig, tuning: Tuning) -> Self {
        let url = match (&config.enabled, &config.post_url) {
            (true, Some(url)) => url.clone(),
            _ => {
                debug!("caption poster disabled");
                return Self {
                    tx: None,
                    handle: None,
                };
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker(url, config.min_post_interval, tuning, rx));
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Enqueue a final for delivery. Never blocks; no-op when disabled.
    pub fn submit(&self, text: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(text.to_string());
        }
    }

    /// Stop accepting items and give the worker `grace` to finish the
    /// in-flight delivery, then abandon it.
    pub async fn shutdown(mut self, grace: Duration) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("caption worker did not finish within grace — abandoning");
            }
        }
    }
}

async fn worker(
    url: String,
    min_interval: Duration,
    tuning: Tuning,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let client = reqwest::Client::new();
    let gate = LogGate::per_minute();
    let mut seq: u64 = 1;
    let mut last_success: Option<Instant> = None;
    let mut rx_closed = false;

    info!(url = url.as_str(), "caption poster started");

    while let Some(mut body) = rx.recv().await {
        // Honour the minimum interval, folding in anything that arrives
        // while we wait.
        loop {
            let wait = match last_success {
                Some(at) => min_interval.saturating_sub(at.elapsed()),
                None => Duration::ZERO,
            };
            if wait.is_zero() {
                break;
            }
            if rx_closed {
                tokio::time::sleep(wait).await;
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => break,
                more = rx.recv() => match more {
                    Some(text) => {
                        body.push('\n');
                        body.push_str(&text);
                    }
                    None => rx_closed = true,
                }
            }
        }

        // Deliver, advancing `seq` only on 2xx.
        let mut backoff = Backoff::new(tuning.retry_floor, tuning.retry_cap);
        let mut failures = 0u32;
        loop {
            match post_caption(&client, &url, seq, &body).await {
                Ok(()) => {
                    seq += 1;
                    last_success = Some(Instant::now());
                    break;
                }
                Err(detail) => {
                    failures += 1;
                    if let Some(suppressed) = gate.permit() {
                        warn!(
                            seq,
                            failures,
                            suppressed,
                            detail = detail.as_str(),
                            "caption POST failed"
                        );
                    }
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(seq, "caption item dropped after {MAX_CONSECUTIVE_FAILURES} failures");
                        break;
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    info!(next_seq = seq, "caption poster stopped");
}

/// One POST attempt. `Err` carries a loggable status/body detail.
async fn post_caption(
    client: &reqwest::Client,
    url: &str,
    seq: u64,
    body: &str,
) -> std::result::Result<(), String> {
    let sep = if url.contains('?') { '&' } else { '?' };
    let full_url = format!("{url}{sep}seq={seq}");
    let response = client
        .post(&full_url)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body.to_string())
        .send()
        .await
        .map_err(|e| format!("request error: {e}"))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let snippet: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(120)
        .collect();
    Err(format!("status {status}: {snippet}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::routing::post;
    use axum::Router;
    use parking_lot::Mutex;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct SeqParam {
        seq: u64,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        posts: Arc<Mutex<Vec<(u64, String)>>>,
        fail_first_attempts: Arc<AtomicU32>,
        attempts: Arc<AtomicU32>,
    }

    async fn record(
        State(rec): State<Recorder>,
        Query(SeqParam { seq }): Query<SeqParam>,
        body: String,
    ) -> (axum::http::StatusCode, &'static str) {
        let attempt = rec.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= rec.fail_first_attempts.load(Ordering::SeqCst) {
            return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom");
        }
        rec.posts.lock().push((seq, body));
        (axum::http::StatusCode::OK, "ok")
    }

    async fn spawn_caption_server(fail_first: u32) -> (String, Recorder) {
        let recorder = Recorder::default();
        recorder
            .fail_first_attempts
            .store(fail_first, Ordering::SeqCst);
        let app = Router::new()
            .route("/caption", post(record))
            .with_state(recorder.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/caption?lang=eo"), recorder)
    }

    fn caption_config(url: String, interval: Duration) -> CaptionConfig {
        CaptionConfig {
            enabled: true,
            post_url: Some(url),
            min_post_interval: interval,
        }
    }

    fn fast_tuning() -> Tuning {
        Tuning {
            retry_floor: Duration::from_millis(10),
            retry_cap: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn coalesces_items_that_arrive_inside_the_interval() {
        let (url, recorder) = spawn_caption_server(0).await;
        let poster = CaptionPoster::start_with_tuning(
            caption_config(url, Duration::from_millis(300)),
            fast_tuning(),
        );

        poster.submit("A.");
        // Give the worker time to deliver the first item, then pile on two
        // more inside the interval window.
        tokio::time::sleep(Duration::from_millis(100)).await;
        poster.submit("B.");
        poster.submit("C.");
        tokio::time::sleep(Duration::from_millis(600)).await;
        poster.shutdown(Duration::from_secs(1)).await;

        let posts = recorder.posts.lock().clone();
        assert_eq!(posts.len(), 2, "expected two POSTs, got {posts:?}");
        assert_eq!(posts[0], (1, "A.".to_string()));
        assert_eq!(posts[1], (2, "B.\nC.".to_string()));
    }

    #[tokio::test]
    async fn interval_is_respected_between_successful_posts() {
        let (url, recorder) = spawn_caption_server(0).await;
        let interval = Duration::from_millis(200);
        let poster =
            CaptionPoster::start_with_tuning(caption_config(url, interval), fast_tuning());

        let started = Instant::now();
        poster.submit("unu.");
        tokio::time::sleep(Duration::from_millis(50)).await;
        poster.submit("du.");
        tokio::time::sleep(Duration::from_millis(500)).await;
        poster.shutdown(Duration::from_secs(1)).await;

        let posts = recorder.posts.lock().clone();
        assert_eq!(posts.len(), 2);
        // The second POST cannot have landed before one full interval.
        assert!(started.elapsed() >= interval);
    }

    #[tokio::test]
    async fn seq_advances_only_on_success() {
        // First item fails its full retry budget, second succeeds.
        let (url, recorder) = spawn_caption_server(MAX_CONSECUTIVE_FAILURES).await;
        let poster = CaptionPoster::start_with_tuning(
            caption_config(url, Duration::from_millis(10)),
            fast_tuning(),
        );

        poster.submit("perdita.");
        tokio::time::sleep(Duration::from_millis(400)).await;
        poster.submit("savita.");
        tokio::time::sleep(Duration::from_millis(200)).await;
        poster.shutdown(Duration::from_secs(1)).await;

        let posts = recorder.posts.lock().clone();
        assert_eq!(posts.len(), 1, "dropped item must not appear");
        // seq did not advance past the dropped item.
        assert_eq!(posts[0], (1, "savita.".to_string()));
        assert_eq!(
            recorder.attempts.load(Ordering::SeqCst),
            MAX_CONSECUTIVE_FAILURES + 1
        );
    }

    #[tokio::test]
    async fn disabled_poster_accepts_submissions_silently() {
        let poster = CaptionPoster::start(CaptionConfig {
            enabled: false,
            post_url: None,
            min_post_interval: Duration::from_secs(1),
        });
        poster.submit("ignored");
        poster.shutdown(Duration::from_millis(50)).await;
    }
}
