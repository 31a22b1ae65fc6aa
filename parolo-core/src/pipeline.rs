//! Pipeline orchestration.
//!
//! ## Data flow
//!
//! ```text
//! AudioSource ─frames─► RecognizerBackend ─events─► Pipeline
//!                                                     │ partial → board
//!                                                     │ final   → translate, then
//!                                                     ├─► CaptionPoster
//!                                                     ├─► TranscriptLog
//!                                                     ├─► WebBroadcaster
//!                                                     └─► DiscordBatcher
//! ```
//!
//! The pipeline is the single dispatcher: every sink observes finals in the
//! same order, each behind its own queue, with no cross-sink locks.
//!
//! ## Shutdown ordering
//!
//! Cancel → stop capture (frame queue closes) → backend drains and returns →
//! flush the webhook batch → close the transcript log → stop the caption
//! worker (2 s grace) → stop the board server. The whole tail is bounded by
//! a 10 s hard deadline, after which remaining workers are abandoned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audio::AudioSource;
use crate::backend::{make_backend, RecognizerBackend, EVENT_CHANNEL_CAPACITY};
use crate::config::Config;
use crate::error::{ParoloError, Result};
use crate::events::{EnrichedFinal, TranscriptEvent};
use crate::sinks::caption::CaptionPoster;
use crate::sinks::discord::DiscordBatcher;
use crate::sinks::transcript_log::TranscriptLog;
use crate::translate::TranslationService;
use crate::web::WebBroadcaster;

/// Hard ceiling on the shutdown tail.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
/// Grace given to the caption worker to finish its in-flight POST.
const CAPTION_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub partials: AtomicU64,
    pub finals: AtomicU64,
    pub empty_finals_dropped: AtomicU64,
    pub finals_translated: AtomicU64,
}

impl PipelineDiagnostics {
    fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.partials.load(Ordering::Relaxed),
            self.finals.load(Ordering::Relaxed),
            self.empty_finals_dropped.load(Ordering::Relaxed),
            self.finals_translated.load(Ordering::Relaxed),
        )
    }
}

pub struct Pipeline {
    config: Config,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        }
    }

    pub fn diagnostics(&self) -> Arc<PipelineDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// Run with the backend named in the config.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let backend = make_backend(&self.config)?;
        self.run_with_backend(backend, cancel).await
    }

    /// Run with an explicit backend (tests inject a scripted one here).
    pub async fn run_with_backend(
        &self,
        mut backend: Box<dyn RecognizerBackend>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let config = &self.config;

        // ── Startup, sinks first so no early final is lost ───────────────
        let web = if config.web.enabled {
            let broadcaster = WebBroadcaster::start(&config.web, &config.translation).await?;
            if config.web.open_browser {
                crate::web::open_browser(broadcaster.local_addr());
            }
            Some(broadcaster)
        } else {
            None
        };
        let caption = CaptionPoster::start(config.caption.clone());
        let webhook = DiscordBatcher::start(
            config.webhook.clone(),
            config.translation.targets.clone(),
        );
        let transcript_log = TranscriptLog::start(config.transcript_log.clone()).await;
        let translator = TranslationService::new(config.translation.clone());

        // ── Backend, then capture ────────────────────────────────────────
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut source = AudioSource::new(config.audio.clone());
        let frames = source.frames();
        let backend_name = backend.name();
        let backend_cancel = cancel.child_token();
        let backend_task = tokio::spawn(async move {
            let result = backend.run(frames, event_tx, backend_cancel).await;
            if let Err(ref e) = result {
                error!(error = %e, "recognizer backend failed");
            }
            result
        });

        if let Err(e) = source.start() {
            // No capture means no transcripts, but sinks and board stay up;
            // backends fed by nothing simply wait for cancellation.
            warn!(error = %e, "audio capture unavailable");
        }
        info!(backend = backend_name, "pipeline running");

        // ── Event loop ───────────────────────────────────────────────────
        let mut stopping = false;
        loop {
            if stopping {
                // Drain whatever the backend still finalizes, bounded.
                match tokio::time::timeout(SHUTDOWN_DEADLINE, event_rx.recv()).await {
                    Ok(Some(event)) => {
                        self.dispatch(event, &translator, &caption, &transcript_log,
                                      web.as_ref(), &webhook).await;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!("backend did not drain within the shutdown deadline");
                        break;
                    }
                }
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested — stopping capture");
                    stopping = true;
                    source.stop(); // closes the frame queue; backend drains
                }
                event = event_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.dispatch(event, &translator, &caption, &transcript_log,
                                          web.as_ref(), &webhook).await;
                        }
                        None => break, // backend finished and dropped its sender
                    }
                }
            }
        }

        // ── Shutdown tail, bounded ───────────────────────────────────────
        source.stop();
        let shutdown = async {
            let backend_result = match backend_task.await {
                Ok(result) => result,
                Err(join_err) => Err(ParoloError::BackendFatal(format!(
                    "backend task panicked: {join_err}"
                ))),
            };
            webhook.close().await;
            transcript_log.close().await;
            caption.shutdown(CAPTION_STOP_GRACE).await;
            if let Some(web) = web {
                web.stop().await;
            }
            backend_result
        };
        let backend_result = match tokio::time::timeout(SHUTDOWN_DEADLINE, shutdown).await {
            Ok(result) => result,
            Err(_) => {
                warn!("shutdown deadline exceeded — abandoning remaining workers");
                Ok(())
            }
        };

        let (partials, finals, empty_dropped, translated) = self.diagnostics.snapshot();
        info!(
            partials,
            finals,
            empty_finals_dropped = empty_dropped,
            finals_translated = translated,
            "pipeline stopped — diagnostics"
        );

        match backend_result {
            Err(e) if e.is_fatal() => Err(e),
            _ => Ok(()),
        }
    }

    /// Route one transcript event. Partials touch only the board; finals are
    /// enriched and handed to every sink in a fixed order.
    async fn dispatch(
        &self,
        event: TranscriptEvent,
        translator: &TranslationService,
        caption: &CaptionPoster,
        transcript_log: &TranscriptLog,
        web: Option<&WebBroadcaster>,
        webhook: &DiscordBatcher,
    ) {
        match event {
            TranscriptEvent::Partial { text, speaker, .. } => {
                self.diagnostics.partials.fetch_add(1, Ordering::Relaxed);
                if let Some(web) = web {
                    web.publish_partial(&text, speaker.as_deref());
                }
            }
            TranscriptEvent::Final(utterance) => {
                if utterance.text.trim().is_empty() {
                    self.diagnostics
                        .empty_finals_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.diagnostics.finals.fetch_add(1, Ordering::Relaxed);
                info!("Final: {}", utterance.text);

                let translations = translator.translate(&utterance.text).await;
                if !translations.is_empty() {
                    self.diagnostics
                        .finals_translated
                        .fetch_add(1, Ordering::Relaxed);
                }
                let enriched = EnrichedFinal {
                    utterance,
                    translations,
                };

                // Fixed dispatch order; every hand-off is a non-blocking
                // queue push, so sinks cannot stall each other.
                caption.submit(&enriched.utterance.text);
                transcript_log.append(&enriched.utterance);
                if let Some(web) = web {
                    web.publish_final(&enriched);
                }
                webhook.add(&enriched);
            }
        }
    }
}
