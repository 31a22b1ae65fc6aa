//! Sentence-aligned Discord webhook batching.
//!
//! Finals accumulate into a batch that flushes when:
//! - the flush interval has elapsed since the first unflushed entry *and*
//!   the last entry ends in sentence punctuation, or
//! - the formatted size crosses the configured threshold, or
//! - the batcher is closed.
//!
//! An entry with no sentence terminator holds the batch one extra interval,
//! then flushes regardless — a meeting pause should not strand text forever.
//!
//! One message per flush, Esperanto block first, one labelled block per
//! target language that produced translations. Bodies over the webhook hard
//! cap split into sequential posts preserving order.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::events::EnrichedFinal;
use crate::translate::language_label;
use crate::util::backoff::Backoff;
use crate::util::gate::LogGate;

/// Discord rejects message content above 2000 characters; stay under it.
const HARD_MESSAGE_CAP: usize = 1900;
const RETRY_FLOOR: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(10);
const MAX_DELIVERY_ATTEMPTS: u32 = 5;

const SENTENCE_TERMINATORS: &[char] = &['.', '?', '!', '。', '？', '！'];

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

pub struct DiscordBatcher {
    tx: Option<mpsc::UnboundedSender<EnrichedFinal>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl DiscordBatcher {
    /// Start the batch worker. `target_order` fixes the language block order
    /// in outgoing messages (usually the configured translation targets).
    pub fn start(config: WebhookConfig, target_order: Vec<String>) -> Self {
        Self::start_with_tuning(config, target_order, Tuning::default())
    }

    fn start_with_tuning(
        config: WebhookConfig,
        target_order: Vec<String>,
        tuning: Tuning,
    ) -> Self {
        let url = match (&config.enabled, &config.url) {
            (true, Some(url)) => url.clone(),
            _ => {
                debug!("discord batcher disabled");
                return Self {
                    tx: None,
                    handle: None,
                };
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker(
            url,
            config.flush_interval,
            config.max_chars,
            target_order,
            tuning,
            rx,
        ));
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Append a final to the pending batch. Never blocks; no-op when disabled.
    pub fn add(&self, enriched: &EnrichedFinal) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(enriched.clone());
        }
    }

    /// Force-flush the pending batch and stop the worker.
    pub async fn close(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.await.is_err() {
                warn!("discord batch worker panicked during close");
            }
        }
    }
}

async fn worker(
    url: String,
    flush_interval: Duration,
    max_chars: usize,
    target_order: Vec<String>,
    tuning: Tuning,
    mut rx: mpsc::UnboundedReceiver<EnrichedFinal>,
) {
    let client = reqwest::Client::new();
    let gate = LogGate::per_minute();
    let mut batch: Vec<EnrichedFinal> = Vec::new();
    let mut first_added: Option<Instant> = None;
    // One interval passed without a terminator — next deadline flushes
    // unconditionally.
    let mut overdue = false;

    info!("discord batch worker started");

    loop {
        let deadline = first_added.map(|at| {
            if overdue {
                at + flush_interval * 2
            } else {
                at + flush_interval
            }
        });

        tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(enriched) => {
                        batch.push(enriched);
                        first_added.get_or_insert_with(Instant::now);
                        if format_message(&batch, &target_order).len() >= max_chars {
                            flush(&client, &url, &mut batch, &target_order, tuning, &gate).await;
                            first_added = None;
                            overdue = false;
                        }
                    }
                    None => {
                        flush(&client, &url, &mut batch, &target_order, tuning, &gate).await;
                        break;
                    }
                }
            }
            _ = sleep_until_opt(deadline), if deadline.is_some() => {
                let terminator = batch
                    .last()
                    .is_some_and(|f| ends_with_terminator(&f.utterance.text));
                if terminator || overdue {
                    flush(&client, &url, &mut batch, &target_order, tuning, &gate).await;
                    first_added = None;
                    overdue = false;
                } else {
                    debug!("batch held — no sentence terminator yet");
                    overdue = true;
                }
            }
        }
    }

    info!("discord batch worker stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

fn ends_with_terminator(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .is_some_and(|c| SENTENCE_TERMINATORS.contains(&c))
}

/// Render one multilingual message for the whole batch.
fn format_message(batch: &[EnrichedFinal], target_order: &[String]) -> String {
    let mut out = String::from("Esperanto:\n");
    for entry in batch {
        out.push_str(entry.utterance.text.trim());
        out.push('\n');
    }
    for lang in target_order {
        let lines: Vec<&str> = batch
            .iter()
            .filter_map(|entry| entry.translations.get(lang))
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if lines.is_empty() {
            continue;
        }
        out.push_str(language_label(lang));
        out.push_str(":\n");
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

/// Split a body into ≤ cap chunks on line boundaries, preserving order.
fn split_message(body: &str, cap: usize) -> Vec<String> {
    if body.len() <= cap {
        return vec![body.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in body.lines() {
        // A single pathological line longer than the cap goes out alone.
        if !current.is_empty() && current.len() + line.len() + 1 > cap {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

async fn flush(
    client: &reqwest::Client,
    url: &str,
    batch: &mut Vec<EnrichedFinal>,
    target_order: &[String],
    tuning: Tuning,
    gate: &LogGate,
) {
    if batch.is_empty() {
        return;
    }
    let body = format_message(batch, target_order);
    batch.clear();

    for chunk in split_message(&body, HARD_MESSAGE_CAP) {
        deliver(client, url, &chunk, tuning, gate).await;
    }
}

/// Post one message with retry/backoff; drop it after the attempt budget.
async fn deliver(client: &reqwest::Client, url: &str, content: &str, tuning: Tuning, gate: &LogGate) {
    let mut backoff = Backoff::new(tuning.retry_floor, tuning.retry_cap);
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        let result = client
            .post(url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => {
                if let Some(suppressed) = gate.permit() {
                    warn!(
                        status = %response.status(),
                        attempt,
                        suppressed,
                        "webhook POST rejected"
                    );
                }
            }
            Err(e) => {
                if let Some(suppressed) = gate.permit() {
                    warn!(error = %e, attempt, suppressed, "webhook POST failed");
                }
            }
        }
        if attempt < MAX_DELIVERY_ATTEMPTS {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
    warn!(
        chars = content.len(),
        "webhook message dropped after {MAX_DELIVERY_ATTEMPTS} attempts"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::extract::{Json, State};
    use axum::routing::post;
    use axum::Router;
    use chrono::Utc;
    use parking_lot::Mutex;

    use crate::events::FinalUtterance;

    fn enriched(text: &str, translations: &[(&str, &str)]) -> EnrichedFinal {
        let now = Utc::now();
        EnrichedFinal {
            utterance: FinalUtterance {
                text: text.into(),
                speaker: None,
                utterance_id: format!("utt-{text}"),
                started_at: now,
                ended_at: now,
                session_id: "sess".into(),
            },
            translations: translations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[derive(Clone, Default)]
    struct Hook {
        messages: Arc<Mutex<Vec<String>>>,
    }

    async fn receive(State(hook): State<Hook>, Json(body): Json<serde_json::Value>) -> &'static str {
        hook.messages
            .lock()
            .push(body["content"].as_str().unwrap_or_default().to_string());
        "ok"
    }

    async fn spawn_webhook() -> (String, Hook) {
        let hook = Hook::default();
        let app = Router::new()
            .route("/hook", post(receive))
            .with_state(hook.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), hook)
    }

    fn webhook_config(url: String, flush_interval: Duration, max_chars: usize) -> WebhookConfig {
        WebhookConfig {
            enabled: true,
            url: Some(url),
            flush_interval,
            max_chars,
        }
    }

    fn fast_tuning() -> Tuning {
        Tuning {
            retry_floor: Duration::from_millis(10),
            retry_cap: Duration::from_millis(20),
        }
    }

    #[test]
    fn sentence_terminators_cover_cjk_punctuation() {
        assert!(ends_with_terminator("Bonan tagon."));
        assert!(ends_with_terminator("ĉu vere? "));
        assert!(ends_with_terminator("こんにちは。"));
        assert!(ends_with_terminator("정말요？"));
        assert!(!ends_with_terminator("Saluton"));
    }

    #[test]
    fn message_layout_groups_by_language() {
        let batch = vec![
            enriched("Bonan tagon.", &[("ja", "こんにちは。")]),
            enriched("Ĝis revido.", &[("ja", "さようなら。"), ("ko", "안녕히 가세요.")]),
        ];
        let message = format_message(&batch, &["ja".into(), "ko".into()]);
        assert_eq!(
            message,
            "Esperanto:\nBonan tagon.\nĜis revido.\n日本語:\nこんにちは。\nさようなら。\n한국어:\n안녕히 가세요."
        );
    }

    #[test]
    fn failed_language_section_is_omitted() {
        let batch = vec![enriched("Bonan tagon.", &[("ja", "こんにちは。")])];
        let message = format_message(&batch, &["ja".into(), "ko".into()]);
        assert!(message.contains("日本語:"));
        assert!(!message.contains("한국어"));
    }

    #[test]
    fn oversized_bodies_split_in_order() {
        let body = (0..50)
            .map(|i| format!("line number {i} with some padding text"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = split_message(&body, 200);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 200));
        assert_eq!(chunks.join("\n"), body);
    }

    #[tokio::test]
    async fn flushes_after_interval_once_terminator_seen() {
        let (url, hook) = spawn_webhook().await;
        let batcher = DiscordBatcher::start_with_tuning(
            webhook_config(url, Duration::from_millis(150), 350),
            vec!["ja".into()],
            fast_tuning(),
        );

        // "Saluton" alone has no terminator; "amiko." completes the sentence.
        batcher.add(&enriched("Saluton", &[]));
        tokio::time::sleep(Duration::from_millis(80)).await;
        batcher.add(&enriched("amiko.", &[]));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let messages = hook.messages.lock().clone();
        assert_eq!(messages.len(), 1, "expected one batched message");
        assert_eq!(messages[0], "Esperanto:\nSaluton\namiko.");
        batcher.close().await;
    }

    #[tokio::test]
    async fn unterminated_entry_flushes_after_extra_interval() {
        let (url, hook) = spawn_webhook().await;
        let batcher = DiscordBatcher::start_with_tuning(
            webhook_config(url, Duration::from_millis(100), 350),
            vec![],
            fast_tuning(),
        );
        batcher.add(&enriched("Saluton", &[]));

        // After one interval: still held.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(hook.messages.lock().is_empty(), "held batch flushed early");

        // After the overdue interval: posted regardless.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let messages = hook.messages.lock().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], "Esperanto:\nSaluton");
        batcher.close().await;
    }

    #[tokio::test]
    async fn size_threshold_forces_immediate_flush() {
        let (url, hook) = spawn_webhook().await;
        let batcher = DiscordBatcher::start_with_tuning(
            webhook_config(url, Duration::from_secs(60), 80),
            vec![],
            fast_tuning(),
        );
        batcher.add(&enriched("Unua sufiĉe longa frazo por la sojlo.", &[]));
        batcher.add(&enriched("Dua sufiĉe longa frazo por la sojlo.", &[]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let messages = hook.messages.lock().clone();
        assert_eq!(messages.len(), 1, "size threshold should flush without waiting");
        batcher.close().await;
    }

    #[tokio::test]
    async fn close_flushes_pending_batch() {
        let (url, hook) = spawn_webhook().await;
        let batcher = DiscordBatcher::start_with_tuning(
            webhook_config(url, Duration::from_secs(60), 350),
            vec![],
            fast_tuning(),
        );
        batcher.add(&enriched("Ĝis.", &[]));
        batcher.close().await;
        let messages = hook.messages.lock().clone();
        assert_eq!(messages, vec!["Esperanto:\nĜis.".to_string()]);
    }
}
