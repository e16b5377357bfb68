//! Replies handed over by the chat collaborator.
//!
//! Input is untrusted: missing or malformed fields fall back to empty text,
//! no emotion and no timing, and never fail the reply as a whole.

use crate::sentiment;
use crate::timing::TimedUnit;
use crate::viseme::visemes_from_phonemes;
use serde_json::Value;
use tracing::warn;

/// Text to speak, with optional emotion and timing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub text: String,
    pub emotion: Option<String>,
    pub units: Vec<TimedUnit>,
}

impl Reply {
    /// A plain reply with no emotion or timing.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }

    #[must_use]
    pub fn with_units(mut self, units: Vec<TimedUnit>) -> Self {
        self.units = units;
        self
    }

    /// Parse a reply object leniently.
    ///
    /// Accepts `{"text", "emotion", "units"}` where each unit has `text` (or
    /// `sourceText`), `start_offset` (or `startOffset`) and either `visemes`
    /// or ARPABET `phonemes`. If any unit is unusable the whole unit list is
    /// dropped, leaving boundary-only timing.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        let text = value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let emotion = value
            .get("emotion")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_owned);

        let units = match value.get("units") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                let parsed: Option<Vec<TimedUnit>> = items.iter().map(parse_unit).collect();
                parsed.unwrap_or_else(|| {
                    warn!(count = items.len(), "dropping malformed timing units");
                    Vec::new()
                })
            }
            Some(other) => {
                warn!(kind = json_kind(other), "timing units are not a list");
                Vec::new()
            }
        };

        Self {
            text,
            emotion,
            units,
        }
    }

    /// Resolve the emotion and strip any inline tag from the text.
    ///
    /// An explicit `emotion` field wins over an `[emotion:x]` tag, which
    /// wins over keyword inference (only when `infer_emotion` is set).
    #[must_use]
    pub fn normalized(mut self, infer_emotion: bool) -> Self {
        if let Some((tagged, rest)) = sentiment::strip_emotion_tag(&self.text) {
            self.text = rest;
            self.emotion.get_or_insert(tagged);
        }
        if self.emotion.is_none() && infer_emotion {
            self.emotion = sentiment::infer(&self.text);
        }
        self
    }
}

fn parse_unit(value: &Value) -> Option<TimedUnit> {
    let text = value
        .get("text")
        .or_else(|| value.get("sourceText"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let offset = value
        .get("start_offset")
        .or_else(|| value.get("startOffset"))
        .and_then(Value::as_u64)
        .and_then(|o| usize::try_from(o).ok())?;

    let labels = |key: &str| -> Option<Vec<&str>> {
        value
            .get(key)?
            .as_array()?
            .iter()
            .map(Value::as_str)
            .collect()
    };
    let visemes = match labels("visemes") {
        Some(visemes) => visemes.into_iter().map(str::to_owned).collect(),
        None => visemes_from_phonemes(labels("phonemes")?),
    };
    if visemes.is_empty() {
        return None;
    }
    Some(TimedUnit::new(text, offset, visemes))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    #[test]
    fn full_reply_parses() {
        let reply = Reply::from_json(&json!({
            "text": "hi there",
            "emotion": "happy",
            "units": [
                {"sourceText": "hi", "startOffset": 0, "visemes": ["ih"]},
                {"text": " there", "start_offset": 2, "visemes": ["ee", "aa"]}
            ]
        }));
        assert_eq!(reply.text, "hi there");
        assert_eq!(reply.emotion.as_deref(), Some("happy"));
        assert_eq!(
            reply.units,
            vec![
                TimedUnit::new("hi", 0, ["ih"]),
                TimedUnit::new(" there", 2, ["ee", "aa"]),
            ]
        );
    }

    #[test]
    fn phonemes_map_to_visemes() {
        let reply = Reply::from_json(&json!({
            "text": "hello",
            "units": [{"text": "hello", "startOffset": 0, "phonemes": ["HH", "AH0", "L", "OW1"]}]
        }));
        assert_eq!(reply.units.len(), 1);
        assert!(!reply.units[0].visemes.is_empty());
        assert_eq!(reply.units[0].visemes.last().map(String::as_str), Some("oh"));
    }

    #[test]
    fn missing_fields_default() {
        let reply = Reply::from_json(&json!({}));
        assert_eq!(reply, Reply::default());

        let reply = Reply::from_json(&json!({"text": 5, "emotion": ["x"], "units": "no"}));
        assert_eq!(reply, Reply::default());
    }

    #[test]
    fn one_bad_unit_drops_all_units() {
        let reply = Reply::from_json(&json!({
            "text": "hi there",
            "units": [
                {"text": "hi", "startOffset": 0, "visemes": ["ih"]},
                {"text": " there", "startOffset": -2, "visemes": ["aa"]}
            ]
        }));
        assert_eq!(reply.text, "hi there");
        assert!(reply.units.is_empty());

        let reply = Reply::from_json(&json!({
            "text": "hi",
            "units": [{"text": "hi", "startOffset": 0, "visemes": []}]
        }));
        assert!(reply.units.is_empty());
    }

    #[test]
    fn tag_is_stripped_and_sets_emotion() {
        let reply = Reply::new("[emotion:sad] I'll miss you").normalized(false);
        assert_eq!(reply.text, "I'll miss you");
        assert_eq!(reply.emotion.as_deref(), Some("sad"));
    }

    #[test]
    fn explicit_emotion_beats_tag() {
        let reply = Reply::new("[emotion:sad] hi")
            .with_emotion("happy")
            .normalized(true);
        assert_eq!(reply.text, "hi");
        assert_eq!(reply.emotion.as_deref(), Some("happy"));
    }

    #[test]
    fn inference_only_when_enabled() {
        let text = "That's wonderful news, I'm so glad";
        assert!(Reply::new(text).normalized(false).emotion.is_none());
        assert_eq!(
            Reply::new(text).normalized(true).emotion.as_deref(),
            Some("happy")
        );
    }
}
