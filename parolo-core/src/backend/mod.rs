//! Recognizer backend abstraction.
//!
//! The pipeline talks to exactly one seam: a backend is a two-channel actor —
//! frames in, transcript events out — driven by a single `run` call. All
//! session management (WebSocket reconnects, token refresh, model state)
//! stays behind that seam; the pipeline only ever observes the ordered event
//! stream.
//!
//! `&mut self` on `run` expresses that backends are stateful for the lifetime
//! of one pipeline run and are not restarted.

pub mod cloud;
pub mod scripted;

#[cfg(feature = "backend-vosk")]
pub mod local_offline;

#[cfg(feature = "backend-whisper")]
pub mod local_large;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::audio::frame::FrameQueue;
use crate::config::{BackendKind, Config};
use crate::error::{ParoloError, Result};
use crate::events::TranscriptEvent;

/// Transcript event channel capacity (C2 → pipeline). The recognizer is
/// authoritative, so a full channel blocks it rather than dropping events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long an event send may block before it is logged as a stall.
const STALL_WARN_AFTER: Duration = Duration::from_secs(2);

/// Contract for speech recognition backends.
#[async_trait]
pub trait RecognizerBackend: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Consume frames until the queue closes or `cancel` fires; emit
    /// transcript events in order; return once the last in-flight utterance
    /// is finalized or the session abandoned.
    ///
    /// # Errors
    /// Only unrecoverable conditions (permanently rejected credentials,
    /// missing model files) surface as `ParoloError::BackendFatal`. Transient
    /// failures are handled internally with backoff.
    async fn run(
        &mut self,
        frames: FrameQueue,
        events: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Build the configured backend.
///
/// Compiled-out backends are a config error — the operator asked for
/// something this binary cannot do.
pub fn make_backend(config: &Config) -> Result<Box<dyn RecognizerBackend>> {
    match config.backend {
        BackendKind::Cloud => {
            let cloud = config.cloud.clone().ok_or_else(|| {
                ParoloError::config("CLOUD_API_KEY", "cloud backend requires credentials")
            })?;
            Ok(Box::new(cloud::CloudBackend::new(cloud)))
        }
        BackendKind::LocalOffline => {
            #[cfg(feature = "backend-vosk")]
            {
                Ok(Box::new(local_offline::VoskBackend::new(
                    config.local.clone(),
                    config.audio.sample_rate,
                )))
            }
            #[cfg(not(feature = "backend-vosk"))]
            {
                Err(ParoloError::config(
                    "TRANSCRIPTION_BACKEND",
                    "local_offline requires a build with the backend-vosk feature",
                ))
            }
        }
        BackendKind::LocalLarge => {
            #[cfg(feature = "backend-whisper")]
            {
                Ok(Box::new(local_large::WhisperBackend::new(
                    config.local.clone(),
                    config.audio.sample_rate,
                )))
            }
            #[cfg(not(feature = "backend-whisper"))]
            {
                Err(ParoloError::config(
                    "TRANSCRIPTION_BACKEND",
                    "local_large requires a build with the backend-whisper feature",
                ))
            }
        }
    }
}

/// Send an event to the pipeline, blocking if the channel is full.
///
/// A send that stays blocked past [`STALL_WARN_AFTER`] logs a stall, then
/// keeps waiting — the event stream is lossless by contract.
pub(crate) async fn send_event(
    events: &mpsc::Sender<TranscriptEvent>,
    event: TranscriptEvent,
) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false, // pipeline gone
        Err(mpsc::error::TrySendError::Full(event)) => {
            let send = events.send(event);
            tokio::pin!(send);
            match tokio::time::timeout(STALL_WARN_AFTER, send.as_mut()).await {
                Ok(result) => result.is_ok(),
                Err(_) => {
                    warn!(
                        blocked_secs = STALL_WARN_AFTER.as_secs(),
                        "transcript event channel stalled — pipeline is not keeping up"
                    );
                    send.await.is_ok()
                }
            }
        }
    }
}
