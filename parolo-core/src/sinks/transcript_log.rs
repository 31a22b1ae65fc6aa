//! Append-only transcript file.
//!
//! The file handle is owned by one writer task; everything else sends lines
//! over a channel. Opened once at startup, closed at shutdown. Write errors
//! degrade to WARN lines — losing a log line must never stall a caption.

use chrono::SecondsFormat;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TranscriptLogConfig;
use crate::events::FinalUtterance;

pub struct TranscriptLog {
    tx: Option<mpsc::UnboundedSender<String>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TranscriptLog {
    /// Open the log file and start the writer. An unopenable file disables
    /// the sink with a warning rather than failing the pipeline.
    pub async fn start(config: TranscriptLogConfig) -> Self {
        let path = match (&config.enabled, &config.path) {
            (true, Some(path)) => path.clone(),
            _ => {
                debug!("transcript log disabled");
                return Self {
                    tx: None,
                    handle: None,
                };
            }
        };

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open transcript log — sink disabled");
                return Self {
                    tx: None,
                    handle: None,
                };
            }
        };

        info!(path = %path.display(), "transcript log opened");
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(writer(file, rx));
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Append one final. Format: `<ISO-8601> [<speaker|"-">] <text>`.
    pub fn append(&self, utterance: &FinalUtterance) {
        let Some(tx) = &self.tx else { return };
        let speaker = utterance.speaker.as_deref().unwrap_or("-");
        let line = format!(
            "{} [{}] {}\n",
            utterance
                .ended_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            speaker,
            utterance.text.trim(),
        );
        let _ = tx.send(line);
    }

    /// Flush pending lines and close the file.
    pub async fn close(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn writer(mut file: tokio::fs::File, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(error = %e, "transcript log write failed");
            continue;
        }
        if let Err(e) = file.flush().await {
            warn!(error = %e, "transcript log flush failed");
        }
    }
    let _ = file.sync_all().await;
    debug!("transcript log closed");
}
