//! `ScriptedBackend` — deterministic replay backend for tests and dry runs.
//!
//! Plays a fixed script of partial/final events, optionally gated on frames
//! actually arriving from the capture side. The same script always produces
//! the same event sequence, which is what the pipeline-level tests assert
//! against.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audio::frame::FrameQueue;
use crate::backend::{send_event, RecognizerBackend};
use crate::error::Result;
use crate::events::{FinalUtterance, TranscriptEvent};

/// One step of the script, executed in order.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Block until one frame arrives (ends the run early if capture closed).
    AwaitFrame,
    /// Emit a partial hypothesis.
    Partial(String),
    /// Emit a committed final.
    Final(String),
}

pub struct ScriptedBackend {
    script: Vec<ScriptStep>,
    session_id: String,
}

impl ScriptedBackend {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            session_id: "scripted-session".into(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

#[async_trait]
impl RecognizerBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(
        &mut self,
        frames: FrameQueue,
        events: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut utterance_seq = 0u64;

        for step in self.script.clone() {
            if cancel.is_cancelled() {
                break;
            }
            match step {
                ScriptStep::AwaitFrame => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = frames.pop() => {
                            if frame.is_none() {
                                debug!("frame stream closed — ending script early");
                                break;
                            }
                        }
                    }
                }
                ScriptStep::Partial(text) => {
                    if !send_event(
                        &events,
                        TranscriptEvent::Partial {
                            text,
                            speaker: None,
                            session_id: self.session_id.clone(),
                        },
                    )
                    .await
                    {
                        break;
                    }
                }
                ScriptStep::Final(text) => {
                    utterance_seq += 1;
                    let now = Utc::now();
                    if !send_event(
                        &events,
                        TranscriptEvent::Final(FinalUtterance {
                            text,
                            speaker: None,
                            utterance_id: format!("{}-{utterance_seq}", self.session_id),
                            started_at: now,
                            ended_at: now,
                            session_id: self.session_id.clone(),
                        }),
                    )
                    .await
                    {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::FrameQueue;

    #[tokio::test]
    async fn replays_script_in_order_with_stable_ids() {
        let mut backend = ScriptedBackend::new(vec![
            ScriptStep::Partial("Bonan".into()),
            ScriptStep::Final("Bonan tagon.".into()),
            ScriptStep::Final("Ĝis revido.".into()),
        ]);
        let frames = FrameQueue::new(4);
        let (tx, mut rx) = mpsc::channel(16);
        backend
            .run(frames, tx, CancellationToken::new())
            .await
            .expect("scripted run");

        match rx.recv().await.expect("partial") {
            TranscriptEvent::Partial { text, .. } => assert_eq!(text, "Bonan"),
            other => panic!("expected partial, got {other:?}"),
        }
        match rx.recv().await.expect("first final") {
            TranscriptEvent::Final(f) => {
                assert_eq!(f.text, "Bonan tagon.");
                assert_eq!(f.utterance_id, "scripted-session-1");
            }
            other => panic!("expected final, got {other:?}"),
        }
        match rx.recv().await.expect("second final") {
            TranscriptEvent::Final(f) => assert_eq!(f.utterance_id, "scripted-session-2"),
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn await_frame_ends_cleanly_when_capture_closes() {
        let mut backend = ScriptedBackend::new(vec![
            ScriptStep::AwaitFrame,
            ScriptStep::Final("never emitted".into()),
        ]);
        let frames = FrameQueue::new(4);
        frames.close();
        let (tx, mut rx) = mpsc::channel(16);
        backend
            .run(frames, tx, CancellationToken::new())
            .await
            .expect("scripted run");
        assert!(rx.recv().await.is_none(), "no event expected after early end");
    }
}
