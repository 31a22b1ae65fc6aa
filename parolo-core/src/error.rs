use thiserror::Error;

/// All errors produced by parolo-core.
#[derive(Debug, Error)]
pub enum ParoloError {
    #[error("config error: {key}: {reason}")]
    Config { key: &'static str, reason: String },

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no usable audio input device found")]
    NoInputDevice,

    #[error("recognizer backend error (transient): {0}")]
    BackendTransient(String),

    #[error("recognizer backend error (fatal): {0}")]
    BackendFatal(String),

    #[error("caption board port {port} is already in use — stop the other process or change WEB_UI_PORT")]
    PortInUse { port: u16 },

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParoloError {
    /// Shorthand for a config error naming the offending key.
    pub fn config(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            key,
            reason: reason.into(),
        }
    }

    /// Whether this error must terminate the pipeline (exit code 3).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendFatal(_))
    }
}

pub type Result<T> = std::result::Result<T, ParoloError>;
