//! Runtime configuration.
//!
//! Every knob is an environment variable; `PAROLO_CONFIG_FILE` may point at a
//! key=value file loaded first (real environment wins). Values are parsed
//! into typed sections once at startup — a bad value is a startup failure
//! naming the exact key, never a runtime surprise.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{ParoloError, Result};

/// Which recognizer backend drives the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Cloud,
    LocalOffline,
    LocalLarge,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cloud" => Ok(Self::Cloud),
            "local_offline" => Ok(Self::LocalOffline),
            "local_large" => Ok(Self::LocalLarge),
            other => Err(format!(
                "unknown backend '{other}' (expected cloud | local_offline | local_large)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioConfig {
    /// Fixed device index; `None` = follow the platform default device.
    pub device_index: Option<usize>,
    /// Pin a device whose name contains this substring (resolved per bind).
    pub device_name: Option<String>,
    /// Pipeline sample rate (Hz) — what the recognizers consume.
    pub sample_rate: u32,
    /// Preferred native device rate; resampled down/up to `sample_rate`.
    pub device_sample_rate: u32,
    pub channels: u16,
    /// Frame duration in seconds (each `AudioFrame` spans this much audio).
    pub chunk_duration: f64,
    /// Re-bind supervisor wake interval.
    pub device_check_interval: Duration,
}

impl AudioConfig {
    /// Samples per emitted frame at the pipeline rate.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as f64 * self.chunk_duration).round() as usize
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CloudConfig {
    pub api_key: String,
    /// WebSocket URL of the streaming recognizer.
    pub connection_url: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalConfig {
    pub model_path: Option<PathBuf>,
    /// Model size label for the windowed recognizer ("base", "small", ...).
    pub large_model_size: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptionConfig {
    pub enabled: bool,
    pub post_url: Option<String>,
    pub min_post_interval: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptLogConfig {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
    pub open_browser: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub provider: String,
    pub source_language: String,
    pub targets: Vec<String>,
    /// Board-side initial visibility per language, e.g. "ja:true,ko:false".
    pub default_visibility: BTreeMap<String, bool>,
    pub timeout: Duration,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub flush_interval: Duration,
    pub max_chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// Complete, validated runtime configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub backend: BackendKind,
    pub audio: AudioConfig,
    pub cloud: Option<CloudConfig>,
    pub local: LocalConfig,
    pub caption: CaptionConfig,
    pub transcript_log: TranscriptLogConfig,
    pub web: WebConfig,
    pub translation: TranslationConfig,
    pub webhook: WebhookConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load `PAROLO_CONFIG_FILE` (if set) into the environment, then parse.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("PAROLO_CONFIG_FILE") {
            dotenvy::from_path(&path).map_err(|e| {
                ParoloError::config("PAROLO_CONFIG_FILE", format!("cannot read '{path}': {e}"))
            })?;
        }
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Parse from an arbitrary key lookup. Exists so tests can feed maps
    /// instead of mutating process environment.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = match lookup("TRANSCRIPTION_BACKEND") {
            Some(raw) => raw
                .parse::<BackendKind>()
                .map_err(|e| ParoloError::config("TRANSCRIPTION_BACKEND", e))?,
            None => BackendKind::Cloud,
        };

        let sample_rate = parse_or(lookup, "AUDIO_SAMPLE_RATE", 16_000u32)?;
        let audio = AudioConfig {
            device_index: parse_opt(lookup, "AUDIO_DEVICE_INDEX")?,
            device_name: non_empty(lookup("AUDIO_DEVICE_NAME")),
            sample_rate,
            device_sample_rate: parse_or(lookup, "AUDIO_DEVICE_SAMPLE_RATE", sample_rate)?,
            channels: parse_or(lookup, "AUDIO_CHANNELS", 1u16)?,
            chunk_duration: parse_or(lookup, "AUDIO_CHUNK_DURATION_SECONDS", 0.5f64)?,
            device_check_interval: secs(parse_or(
                lookup,
                "AUDIO_DEVICE_CHECK_INTERVAL",
                2.0f64,
            )?),
        };
        if audio.channels != 1 {
            return Err(ParoloError::config(
                "AUDIO_CHANNELS",
                format!("must be 1 (mono), got {}", audio.channels),
            ));
        }
        if audio.chunk_duration <= 0.0 || audio.chunk_duration > 10.0 {
            return Err(ParoloError::config(
                "AUDIO_CHUNK_DURATION_SECONDS",
                format!("must be in (0, 10], got {}", audio.chunk_duration),
            ));
        }

        let cloud = match (lookup("CLOUD_API_KEY"), lookup("CLOUD_CONNECTION_URL")) {
            (Some(api_key), Some(connection_url))
                if !api_key.trim().is_empty() && !connection_url.trim().is_empty() =>
            {
                let parsed = url::Url::parse(connection_url.trim()).map_err(|e| {
                    ParoloError::config("CLOUD_CONNECTION_URL", format!("invalid URL: {e}"))
                })?;
                if !matches!(parsed.scheme(), "ws" | "wss") {
                    return Err(ParoloError::config(
                        "CLOUD_CONNECTION_URL",
                        format!("expected ws:// or wss:// URL, got scheme '{}'", parsed.scheme()),
                    ));
                }
                Some(CloudConfig {
                    api_key: api_key.trim().to_string(),
                    connection_url: connection_url.trim().to_string(),
                    language: lookup("CLOUD_LANGUAGE").unwrap_or_else(|| "eo".into()),
                })
            }
            _ => None,
        };
        if backend == BackendKind::Cloud && cloud.is_none() {
            return Err(ParoloError::config(
                "CLOUD_API_KEY",
                "cloud backend selected but CLOUD_API_KEY / CLOUD_CONNECTION_URL are not set",
            ));
        }

        let local = LocalConfig {
            model_path: non_empty(lookup("LOCAL_MODEL_PATH")).map(PathBuf::from),
            large_model_size: lookup("LOCAL_LARGE_MODEL_SIZE").unwrap_or_else(|| "base".into()),
        };
        if matches!(backend, BackendKind::LocalOffline | BackendKind::LocalLarge) {
            match &local.model_path {
                None => {
                    return Err(ParoloError::config(
                        "LOCAL_MODEL_PATH",
                        "local backend selected but no model path configured",
                    ))
                }
                Some(path) if !path.exists() => {
                    return Err(ParoloError::config(
                        "LOCAL_MODEL_PATH",
                        format!("model path does not exist: {}", path.display()),
                    ))
                }
                Some(_) => {}
            }
        }

        let caption = CaptionConfig {
            enabled: parse_or(lookup, "CAPTION_ENABLED", false)?,
            post_url: non_empty(lookup("CAPTION_POST_URL")),
            min_post_interval: secs(parse_or(
                lookup,
                "CAPTION_MIN_POST_INTERVAL_SECONDS",
                1.0f64,
            )?),
        };
        if caption.enabled {
            let url_str = caption.post_url.as_deref().ok_or_else(|| {
                ParoloError::config("CAPTION_POST_URL", "CAPTION_ENABLED=true but no URL set")
            })?;
            check_http_url("CAPTION_POST_URL", url_str)?;
        }

        let transcript_log = TranscriptLogConfig {
            enabled: parse_or(lookup, "TRANSCRIPT_LOG_ENABLED", false)?,
            path: non_empty(lookup("TRANSCRIPT_LOG_PATH")).map(PathBuf::from),
        };
        if transcript_log.enabled && transcript_log.path.is_none() {
            return Err(ParoloError::config(
                "TRANSCRIPT_LOG_PATH",
                "TRANSCRIPT_LOG_ENABLED=true but no path set",
            ));
        }

        let web = WebConfig {
            enabled: parse_or(lookup, "WEB_UI_ENABLED", true)?,
            port: parse_or(lookup, "WEB_UI_PORT", 8765u16)?,
            open_browser: parse_or(lookup, "WEB_UI_OPEN_BROWSER", false)?,
        };

        let targets = lookup("TRANSLATION_TARGETS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let translation = TranslationConfig {
            enabled: parse_or(lookup, "TRANSLATION_ENABLED", false)?,
            provider: lookup("TRANSLATION_PROVIDER").unwrap_or_else(|| "libretranslate".into()),
            source_language: lookup("TRANSLATION_SOURCE_LANGUAGE").unwrap_or_else(|| "eo".into()),
            default_visibility: parse_visibility(lookup("TRANSLATION_DEFAULT_VISIBILITY"), &targets),
            targets,
            timeout: secs(parse_or(lookup, "TRANSLATION_TIMEOUT_SECONDS", 8.0f64)?),
            api_url: non_empty(lookup("TRANSLATION_API_URL")),
            api_key: non_empty(lookup("TRANSLATION_API_KEY")),
        };
        if translation.enabled {
            if translation.targets.is_empty() {
                return Err(ParoloError::config(
                    "TRANSLATION_TARGETS",
                    "TRANSLATION_ENABLED=true but no target languages set (e.g. 'ja,ko')",
                ));
            }
            match translation.provider.as_str() {
                "libretranslate" | "deepl" => {}
                other => {
                    return Err(ParoloError::config(
                        "TRANSLATION_PROVIDER",
                        format!("unknown provider '{other}' (expected libretranslate | deepl)"),
                    ))
                }
            }
        }

        let webhook = WebhookConfig {
            enabled: parse_or(lookup, "WEBHOOK_ENABLED", false)?,
            url: non_empty(lookup("WEBHOOK_URL")),
            flush_interval: secs(parse_or(lookup, "WEBHOOK_FLUSH_INTERVAL", 2.0f64)?),
            max_chars: parse_or(lookup, "WEBHOOK_MAX_CHARS", 350usize)?,
        };
        if webhook.enabled {
            let url_str = webhook.url.as_deref().ok_or_else(|| {
                ParoloError::config("WEBHOOK_URL", "WEBHOOK_ENABLED=true but no URL set")
            })?;
            check_http_url("WEBHOOK_URL", url_str)?;
        }

        let log = LogConfig {
            level: lookup("LOG_LEVEL").unwrap_or_else(|| "INFO".into()),
            file: non_empty(lookup("LOG_FILE")).map(PathBuf::from),
        };

        Ok(Self {
            backend,
            audio,
            cloud,
            local,
            caption,
            transcript_log,
            web,
            translation,
            webhook,
            log,
        })
    }

    /// Effective config as JSON with secret values masked, for `--show-config`.
    pub fn masked_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(cloud) = value.pointer_mut("/cloud/api_key") {
            *cloud = serde_json::Value::String(mask(cloud.as_str().unwrap_or_default()));
        }
        if let Some(key) = value.pointer_mut("/translation/api_key") {
            if let Some(raw) = key.as_str() {
                *key = serde_json::Value::String(mask(raw));
            }
        }
        if let Some(hook) = value.pointer_mut("/webhook/url") {
            if let Some(raw) = hook.as_str() {
                *hook = serde_json::Value::String(mask(raw));
            }
        }
        value
    }
}

fn mask(secret: &str) -> String {
    if secret.len() <= 8 {
        "****".into()
    } else {
        format!("{}****{}", &secret[..4], &secret[secret.len() - 2..])
    }
}

fn secs(v: f64) -> Duration {
    Duration::from_secs_f64(v)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_http_url(key: &'static str, raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ParoloError::config(key, format!("invalid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ParoloError::config(
            key,
            format!("expected http:// or https:// URL, got scheme '{}'", parsed.scheme()),
        ));
    }
    Ok(())
}

fn parse_or<T>(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T>
where
    T: FromStr + ParseableFromEnv,
    <T as FromStr>::Err: std::fmt::Display,
{
    match non_empty(lookup(key)) {
        None => Ok(default),
        Some(raw) => T::parse_env(&raw)
            .ok_or_else(|| ParoloError::config(key, format!("cannot parse '{raw}'"))),
    }
}

fn parse_opt<T>(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>>
where
    T: FromStr + ParseableFromEnv,
    <T as FromStr>::Err: std::fmt::Display,
{
    match non_empty(lookup(key)) {
        None => Ok(None),
        Some(raw) => T::parse_env(&raw)
            .map(Some)
            .ok_or_else(|| ParoloError::config(key, format!("cannot parse '{raw}'"))),
    }
}

/// Env-flavoured parsing: numbers via `FromStr`, bools accepting
/// true/false/1/0/yes/no in any case.
trait ParseableFromEnv: Sized {
    fn parse_env(raw: &str) -> Option<Self>;
}

macro_rules! parse_via_fromstr {
    ($($ty:ty),*) => {
        $(impl ParseableFromEnv for $ty {
            fn parse_env(raw: &str) -> Option<Self> {
                raw.trim().parse().ok()
            }
        })*
    };
}

parse_via_fromstr!(u16, u32, u64, usize, f64);

impl ParseableFromEnv for bool {
    fn parse_env(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

fn parse_visibility(raw: Option<String>, targets: &[String]) -> BTreeMap<String, bool> {
    let mut map: BTreeMap<String, bool> = targets.iter().map(|t| (t.clone(), true)).collect();
    if let Some(raw) = raw {
        for pair in raw.split(',') {
            if let Some((lang, flag)) = pair.split_once(':') {
                if let Some(flag) = bool::parse_env(flag) {
                    map.insert(lang.trim().to_ascii_lowercase(), flag);
                }
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    fn minimal_cloud() -> Vec<(&'static str, &'static str)> {
        vec![
            ("CLOUD_API_KEY", "sk-meeting-key-123456"),
            ("CLOUD_CONNECTION_URL", "wss://stt.example.com/v1/stream"),
        ]
    }

    #[test]
    fn defaults_match_documented_table() {
        let pairs = minimal_cloud();
        let cfg = Config::from_lookup(&lookup_from(&pairs)).expect("config");
        assert_eq!(cfg.backend, BackendKind::Cloud);
        assert_eq!(cfg.audio.sample_rate, 16_000);
        assert_eq!(cfg.audio.device_sample_rate, 16_000);
        assert_eq!(cfg.audio.chunk_duration, 0.5);
        assert_eq!(cfg.audio.samples_per_frame(), 8_000);
        assert_eq!(cfg.audio.device_check_interval, Duration::from_secs(2));
        assert!(!cfg.caption.enabled);
        assert_eq!(cfg.caption.min_post_interval, Duration::from_secs(1));
        assert!(cfg.web.enabled);
        assert_eq!(cfg.web.port, 8765);
        assert!(!cfg.translation.enabled);
        assert_eq!(cfg.translation.timeout, Duration::from_secs(8));
        assert!(!cfg.webhook.enabled);
        assert_eq!(cfg.webhook.flush_interval, Duration::from_secs(2));
        assert_eq!(cfg.webhook.max_chars, 350);
        assert_eq!(cfg.log.level, "INFO");
    }

    #[test]
    fn cloud_backend_without_credentials_is_config_error() {
        let err = Config::from_lookup(&lookup_from(&[])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("CLOUD_API_KEY"), "got: {msg}");
    }

    #[test]
    fn rejects_multichannel_audio() {
        let mut pairs = minimal_cloud();
        pairs.push(("AUDIO_CHANNELS", "2"));
        let err = Config::from_lookup(&lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("AUDIO_CHANNELS"));
    }

    #[test]
    fn rejects_non_websocket_cloud_url() {
        let pairs = vec![
            ("CLOUD_API_KEY", "k"),
            ("CLOUD_CONNECTION_URL", "https://stt.example.com"),
        ];
        let err = Config::from_lookup(&lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("CLOUD_CONNECTION_URL"));
    }

    #[test]
    fn local_backend_requires_existing_model_path() {
        let pairs = vec![
            ("TRANSCRIPTION_BACKEND", "local_offline"),
            ("LOCAL_MODEL_PATH", "/nonexistent/model-dir"),
        ];
        let err = Config::from_lookup(&lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("LOCAL_MODEL_PATH"));
    }

    #[test]
    fn translation_targets_parse_and_default_visible() {
        let mut pairs = minimal_cloud();
        pairs.push(("TRANSLATION_ENABLED", "true"));
        pairs.push(("TRANSLATION_TARGETS", "ja, KO"));
        pairs.push(("TRANSLATION_DEFAULT_VISIBILITY", "ko:false"));
        let cfg = Config::from_lookup(&lookup_from(&pairs)).expect("config");
        assert_eq!(cfg.translation.targets, vec!["ja", "ko"]);
        assert_eq!(cfg.translation.default_visibility["ja"], true);
        assert_eq!(cfg.translation.default_visibility["ko"], false);
    }

    #[test]
    fn caption_enabled_without_url_is_config_error() {
        let mut pairs = minimal_cloud();
        pairs.push(("CAPTION_ENABLED", "true"));
        let err = Config::from_lookup(&lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("CAPTION_POST_URL"));
    }

    #[test]
    fn masked_json_hides_secrets() {
        let pairs = minimal_cloud();
        let cfg = Config::from_lookup(&lookup_from(&pairs)).expect("config");
        let json = cfg.masked_json();
        let masked = json["cloud"]["api_key"].as_str().expect("masked key");
        assert!(masked.contains("****"));
        assert!(!masked.contains("meeting-key"));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert_eq!(bool::parse_env("TRUE"), Some(true));
        assert_eq!(bool::parse_env("0"), Some(false));
        assert_eq!(bool::parse_env("yes"), Some(true));
        assert_eq!(bool::parse_env("maybe"), None);
    }
}
