//! Windowed local recognizer (whisper.cpp via whisper-rs).
//!
//! Whisper decodes whole windows, not streams: frames accumulate into a
//! fixed-duration buffer (6 s) and each full window is decoded synchronously
//! on a blocking worker, emitting exactly one `Final` — no partials, no
//! window overlap, hence no duplicate finals. Heavier and slower than the
//! vosk backend, markedly better Esperanto accuracy.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::audio::frame::{pcm16le_to_i16, FrameQueue};
use crate::backend::RecognizerBackend;
use crate::config::LocalConfig;
use crate::error::{ParoloError, Result};
use crate::events::{FinalUtterance, TranscriptEvent};

/// Fixed decode window.
const WINDOW_SECONDS: f64 = 6.0;
/// Leftover audio shorter than this at shutdown is discarded as noise.
const MIN_TAIL_SECONDS: f64 = 1.0;
/// Decode target language.
const LANGUAGE: &str = "eo";

/// One accumulated window handed to the decode worker.
struct Window {
    samples: Vec<f32>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

pub struct WhisperBackend {
    local: LocalConfig,
    sample_rate: u32,
}

impl WhisperBackend {
    pub fn new(local: LocalConfig, sample_rate: u32) -> Self {
        Self { local, sample_rate }
    }

    /// `LOCAL_MODEL_PATH` may be the ggml file itself or a directory holding
    /// `ggml-<LOCAL_LARGE_MODEL_SIZE>.bin`.
    fn model_file(&self) -> Result<PathBuf> {
        let base = self.local.model_path.clone().ok_or_else(|| {
            ParoloError::BackendFatal("LOCAL_MODEL_PATH is not set for the local_large backend".into())
        })?;
        let file = if base.is_dir() {
            base.join(format!("ggml-{}.bin", self.local.large_model_size))
        } else {
            base
        };
        if !file.exists() {
            return Err(ParoloError::BackendFatal(format!(
                "whisper model file not found: {}",
                file.display()
            )));
        }
        Ok(file)
    }
}

#[async_trait]
impl RecognizerBackend for WhisperBackend {
    fn name(&self) -> &'static str {
        "local_large"
    }

    async fn run(
        &mut self,
        frames: FrameQueue,
        events: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let model_file = self.model_file()?;
        let window_samples = (self.sample_rate as f64 * WINDOW_SECONDS) as usize;
        let min_tail_samples = (self.sample_rate as f64 * MIN_TAIL_SECONDS) as usize;

        let (win_tx, win_rx) = mpsc::channel::<Window>(4);
        let worker = tokio::task::spawn_blocking(move || decode_loop(model_file, win_rx, events));

        let mut pending: Vec<f32> = Vec::with_capacity(window_samples);
        let mut window_started: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.pop() => {
                    let Some(frame) = frame else { break };
                    window_started.get_or_insert_with(Utc::now);
                    let samples = pcm16le_to_i16(&frame.pcm);
                    pending.extend(samples.iter().map(|&s| s as f32 / 32768.0));

                    if pending.len() >= window_samples {
                        let window = Window {
                            samples: std::mem::take(&mut pending),
                            started_at: window_started.take().unwrap_or_else(Utc::now),
                            ended_at: Utc::now(),
                        };
                        if win_tx.send(window).await.is_err() {
                            break; // worker died — its error surfaces below
                        }
                    }
                }
            }
        }

        // Flush a meaningful tail; sub-second remnants are dropped.
        if pending.len() >= min_tail_samples {
            let window = Window {
                samples: pending,
                started_at: window_started.unwrap_or_else(Utc::now),
                ended_at: Utc::now(),
            };
            let _ = win_tx.send(window).await;
        }
        drop(win_tx);

        worker
            .await
            .map_err(|e| ParoloError::BackendFatal(format!("whisper worker panicked: {e}")))?
    }
}

fn decode_loop(
    model_file: PathBuf,
    mut win_rx: mpsc::Receiver<Window>,
    events: mpsc::Sender<TranscriptEvent>,
) -> Result<()> {
    let ctx = WhisperContext::new_with_params(
        &model_file.to_string_lossy(),
        WhisperContextParameters::default(),
    )
    .map_err(|e| {
        ParoloError::BackendFatal(format!(
            "failed to load whisper model {}: {e}",
            model_file.display()
        ))
    })?;
    let mut state = ctx
        .create_state()
        .map_err(|e| ParoloError::BackendFatal(format!("whisper state: {e}")))?;

    let session_id = Uuid::new_v4().to_string();
    let mut utterance_seq = 0u64;
    info!(session_id = session_id.as_str(), model = %model_file.display(), "whisper session started");

    while let Some(window) = win_rx.blocking_recv() {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(LANGUAGE));
        params.set_translate(false);
        params.set_no_context(true);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        if let Err(e) = state.full(params, &window.samples) {
            warn!(error = ?e, "whisper decode failed for one window");
            continue;
        }

        let segments = match state.full_n_segments() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = ?e, "whisper segment count unavailable");
                continue;
            }
        };
        let mut text = String::new();
        for i in 0..segments {
            match state.full_get_segment_text(i) {
                Ok(segment) => {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(segment.trim());
                }
                Err(e) => warn!(error = ?e, segment = i, "unreadable whisper segment"),
            }
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            debug!("window decoded to empty text");
            continue;
        }

        utterance_seq += 1;
        let event = TranscriptEvent::Final(FinalUtterance {
            text,
            speaker: None,
            utterance_id: format!("{session_id}-{utterance_seq}"),
            started_at: window.started_at,
            ended_at: window.ended_at,
            session_id: session_id.clone(),
        });
        if events.blocking_send(event).is_err() {
            return Ok(());
        }
    }

    debug!(utterances = utterance_seq, "whisper session drained");
    Ok(())
}
