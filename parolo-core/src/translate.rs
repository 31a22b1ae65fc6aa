//! Per-language translation enrichment.
//!
//! One outbound HTTP call per target language, all in flight concurrently,
//! each bounded by the configured timeout. A language that fails or times
//! out is logged and simply absent from the result — translation is
//! best-effort garnish, never a reason to hold up a caption.

use std::collections::BTreeMap;

use futures_util::future::join_all;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::TranslationConfig;
use crate::error::{ParoloError, Result};

const LIBRETRANSLATE_DEFAULT_URL: &str = "https://libretranslate.com/translate";
const DEEPL_DEFAULT_URL: &str = "https://api-free.deepl.com/v2/translate";

pub struct TranslationService {
    config: TranslationConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct LibreResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

#[derive(Deserialize)]
struct DeeplResponse {
    translations: Vec<DeeplTranslation>,
}

#[derive(Deserialize)]
struct DeeplTranslation {
    text: String,
}

impl TranslationService {
    pub fn new(config: TranslationConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.targets.is_empty()
    }

    pub fn targets(&self) -> &[String] {
        &self.config.targets
    }

    /// Translate `text` into every configured target concurrently.
    ///
    /// Returns within `max(per-call timeout)` plus scheduling overhead.
    pub async fn translate(&self, text: &str) -> BTreeMap<String, String> {
        if !self.is_enabled() || text.trim().is_empty() {
            return BTreeMap::new();
        }

        let calls = self.config.targets.iter().map(|lang| async move {
            let result = tokio::time::timeout(self.config.timeout, self.translate_one(text, lang))
                .await
                .map_err(|_| {
                    ParoloError::BackendTransient(format!(
                        "translation to '{lang}' timed out after {:?}",
                        self.config.timeout
                    ))
                })
                .and_then(|r| r);
            (lang.clone(), result)
        });

        let mut out = BTreeMap::new();
        for (lang, result) in join_all(calls).await {
            match result {
                Ok(translated) if !translated.trim().is_empty() => {
                    out.insert(lang, translated);
                }
                Ok(_) => debug!(lang = lang.as_str(), "empty translation discarded"),
                Err(e) => warn!(lang = lang.as_str(), error = %e, "translation failed"),
            }
        }
        out
    }

    async fn translate_one(&self, text: &str, target: &str) -> Result<String> {
        match self.config.provider.as_str() {
            "deepl" => self.translate_deepl(text, target).await,
            _ => self.translate_libre(text, target).await,
        }
    }

    async fn translate_libre(&self, text: &str, target: &str) -> Result<String> {
        let url = self
            .config
            .api_url
            .as_deref()
            .unwrap_or(LIBRETRANSLATE_DEFAULT_URL);
        let mut body = serde_json::json!({
            "q": text,
            "source": self.config.source_language,
            "target": target,
            "format": "text",
        });
        if let Some(key) = &self.config.api_key {
            body["api_key"] = serde_json::Value::String(key.clone());
        }
        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ParoloError::BackendTransient(format!(
                "libretranslate returned {status}"
            )));
        }
        let parsed: LibreResponse = response.json().await?;
        Ok(parsed.translated_text)
    }

    async fn translate_deepl(&self, text: &str, target: &str) -> Result<String> {
        let url = self.config.api_url.as_deref().unwrap_or(DEEPL_DEFAULT_URL);
        let key = self.config.api_key.as_deref().unwrap_or_default();
        let form = [
            ("text", text.to_string()),
            ("source_lang", self.config.source_language.to_uppercase()),
            ("target_lang", target.to_uppercase()),
        ];
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("DeepL-Auth-Key {key}"))
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ParoloError::BackendTransient(format!(
                "deepl returned {status}"
            )));
        }
        let parsed: DeeplResponse = response.json().await?;
        parsed
            .translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| ParoloError::BackendTransient("deepl returned no translations".into()))
    }
}

/// Human-readable label for a language code, used by the Discord formatter
/// and the caption board.
pub fn language_label(code: &str) -> &str {
    match code {
        "eo" => "Esperanto",
        "ja" => "日本語",
        "ko" => "한국어",
        "en" => "English",
        "zh" => "中文",
        "fr" => "Français",
        "de" => "Deutsch",
        "es" => "Español",
        "ru" => "Русский",
        other => other,
    }
}
