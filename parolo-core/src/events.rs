//! Transcript events flowing from a recognizer backend into the pipeline.
//!
//! A backend emits an ordered stream of `Partial` hypotheses and committed
//! `Final` utterances for one session (one recognizer connection). Partials
//! only ever reach the caption board; finals fan out to every sink.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committed utterance. Text arrives already punctuated and cased.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalUtterance {
    pub text: String,
    /// Speaker label passed through from the recognizer, if it supplies one.
    pub speaker: Option<String>,
    /// Stable ID, unique within a session.
    pub utterance_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Recognizer connection this utterance belongs to.
    pub session_id: String,
}

/// Event stream contract between a backend and the pipeline.
///
/// Within one session events are emitted in start-time order and a `Final`
/// is never followed by a `Partial` for the same utterance.
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    /// Hypothesis — supersedes any prior partial of the same session.
    Partial {
        text: String,
        speaker: Option<String>,
        session_id: String,
    },
    /// Committed utterance. Delivered to each sink at most once.
    Final(FinalUtterance),
}

impl TranscriptEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Partial { session_id, .. } => session_id,
            Self::Final(f) => &f.session_id,
        }
    }
}

/// A final plus whatever translations came back in time.
///
/// Languages that failed or timed out are simply absent — never present as
/// empty strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedFinal {
    #[serde(flatten)]
    pub utterance: FinalUtterance,
    pub translations: BTreeMap<String, String>,
}

impl EnrichedFinal {
    pub fn without_translations(utterance: FinalUtterance) -> Self {
        Self {
            utterance,
            translations: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_final() -> FinalUtterance {
        FinalUtterance {
            text: "Bonan tagon.".into(),
            speaker: Some("S1".into()),
            utterance_id: "utt-3".into(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            session_id: "sess-a".into(),
        }
    }

    #[test]
    fn enriched_final_flattens_utterance_fields() {
        let mut enriched = EnrichedFinal::without_translations(sample_final());
        enriched
            .translations
            .insert("ja".into(), "こんにちは。".into());

        let json = serde_json::to_value(&enriched).expect("serialize enriched final");
        assert_eq!(json["text"], "Bonan tagon.");
        assert_eq!(json["utteranceId"], "utt-3");
        assert_eq!(json["translations"]["ja"], "こんにちは。");
    }

    #[test]
    fn missing_translations_serialize_as_empty_map_not_nulls() {
        let enriched = EnrichedFinal::without_translations(sample_final());
        let json = serde_json::to_value(&enriched).expect("serialize enriched final");
        assert!(json["translations"].as_object().expect("map").is_empty());
    }

    #[test]
    fn session_id_accessor_covers_both_variants() {
        let partial = TranscriptEvent::Partial {
            text: "Bonan".into(),
            speaker: None,
            session_id: "sess-a".into(),
        };
        assert_eq!(partial.session_id(), "sess-a");
        assert_eq!(TranscriptEvent::Final(sample_final()).session_id(), "sess-a");
    }
}
