//! Embedded offline recognizer (Vosk).
//!
//! The model is loaded once at startup from `LOCAL_MODEL_PATH`; a missing
//! path fails fast. Decoding runs on a blocking worker thread fed PCM16 over
//! a channel — the vosk recognizer is stateful and synchronous, so it never
//! touches the async executor.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vosk::{DecodingState, Model, Recognizer};

use crate::audio::frame::{pcm16le_to_i16, FrameQueue};
use crate::backend::RecognizerBackend;
use crate::config::LocalConfig;
use crate::error::{ParoloError, Result};
use crate::events::{FinalUtterance, TranscriptEvent};

/// PCM hand-off depth between the pump and the decode worker.
const PCM_CHANNEL_CAPACITY: usize = 64;

pub struct VoskBackend {
    local: LocalConfig,
    sample_rate: u32,
}

impl VoskBackend {
    pub fn new(local: LocalConfig, sample_rate: u32) -> Self {
        Self { local, sample_rate }
    }

    fn model_path(&self) -> Result<PathBuf> {
        let path = self.local.model_path.clone().ok_or_else(|| {
            ParoloError::BackendFatal("LOCAL_MODEL_PATH is not set for the local_offline backend".into())
        })?;
        if !path.exists() {
            return Err(ParoloError::BackendFatal(format!(
                "LOCAL_MODEL_PATH does not exist: {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl RecognizerBackend for VoskBackend {
    fn name(&self) -> &'static str {
        "local_offline"
    }

    async fn run(
        &mut self,
        frames: FrameQueue,
        events: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let model_path = self.model_path()?;
        let sample_rate = self.sample_rate;

        let (pcm_tx, pcm_rx) = mpsc::channel::<Vec<i16>>(PCM_CHANNEL_CAPACITY);
        let worker = tokio::task::spawn_blocking(move || {
            decode_loop(model_path, sample_rate, pcm_rx, events)
        });

        // Pump frames into the worker until capture closes or we are told to
        // stop; dropping the sender lets the worker flush its last utterance.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.pop() => {
                    match frame {
                        Some(frame) => {
                            let pcm = pcm16le_to_i16(&frame.pcm);
                            if pcm_tx.send(pcm).await.is_err() {
                                break; // worker died — its error surfaces below
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        drop(pcm_tx);

        worker
            .await
            .map_err(|e| ParoloError::BackendFatal(format!("vosk worker panicked: {e}")))?
    }
}

fn decode_loop(
    model_path: PathBuf,
    sample_rate: u32,
    mut pcm_rx: mpsc::Receiver<Vec<i16>>,
    events: mpsc::Sender<TranscriptEvent>,
) -> Result<()> {
    let model = Model::new(model_path.to_string_lossy().as_ref()).ok_or_else(|| {
        ParoloError::BackendFatal(format!(
            "failed to load vosk model from {}",
            model_path.display()
        ))
    })?;
    let mut recognizer = Recognizer::new(&model, sample_rate as f32).ok_or_else(|| {
        ParoloError::BackendFatal("failed to create vosk recognizer".into())
    })?;
    recognizer.set_words(false);

    let session_id = Uuid::new_v4().to_string();
    let mut utterance_seq = 0u64;
    let mut utterance_started: Option<DateTime<Utc>> = None;
    let mut last_partial = String::new();
    info!(session_id = session_id.as_str(), model = %model_path.display(), "vosk session started");

    while let Some(pcm) = pcm_rx.blocking_recv() {
        match recognizer.accept_waveform(&pcm) {
            Ok(DecodingState::Running) => {
                let partial = recognizer.partial_result().partial.trim().to_string();
                if partial.is_empty() || partial == last_partial {
                    continue;
                }
                utterance_started.get_or_insert_with(Utc::now);
                last_partial = partial.clone();
                let event = TranscriptEvent::Partial {
                    text: partial,
                    speaker: None,
                    session_id: session_id.clone(),
                };
                if events.blocking_send(event).is_err() {
                    return Ok(());
                }
            }
            Ok(DecodingState::Finalized) => {
                let text = recognizer
                    .result()
                    .single()
                    .map(|r| r.text.trim().to_string())
                    .unwrap_or_default();
                last_partial.clear();
                if text.is_empty() {
                    utterance_started = None;
                    continue;
                }
                utterance_seq += 1;
                let ended_at = Utc::now();
                let event = TranscriptEvent::Final(FinalUtterance {
                    text,
                    speaker: None,
                    utterance_id: format!("{session_id}-{utterance_seq}"),
                    started_at: utterance_started.take().unwrap_or(ended_at),
                    ended_at,
                    session_id: session_id.clone(),
                });
                if events.blocking_send(event).is_err() {
                    return Ok(());
                }
            }
            Ok(DecodingState::Failed) => {
                warn!("vosk decoding failed for one buffer");
            }
            Err(e) => {
                warn!(error = ?e, "vosk rejected a waveform buffer");
            }
        }
    }

    // Input closed — flush whatever the recognizer still holds.
    let text = recognizer
        .final_result()
        .single()
        .map(|r| r.text.trim().to_string())
        .unwrap_or_default();
    if !text.is_empty() {
        utterance_seq += 1;
        let ended_at = Utc::now();
        let _ = events.blocking_send(TranscriptEvent::Final(FinalUtterance {
            text,
            speaker: None,
            utterance_id: format!("{session_id}-{utterance_seq}"),
            started_at: utterance_started.take().unwrap_or(ended_at),
            ended_at,
            session_id: session_id.clone(),
        }));
    }
    debug!(utterances = utterance_seq, "vosk session drained");
    Ok(())
}
