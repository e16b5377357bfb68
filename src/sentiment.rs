//! Emotion labels from reply text.
//!
//! Two layers, checked in order:
//!
//! 1. **Explicit tag**: a reply may open with `[emotion:happy]`. The tag is
//!    removed before the text is spoken.
//! 2. **Keyword heuristic**: a quick scan over the text, used only when the
//!    reply carries no emotion of its own and inference is enabled.

/// Result of emotion classification.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionGuess {
    /// Expression label, `neutral` when nothing was found.
    pub emotion: String,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f32,
}

/// Minimum confidence required before a guessed emotion is shown.
pub const CONFIDENCE_THRESHOLD: f32 = 0.3;

const TAG_PREFIX: &str = "[emotion:";

/// (emotion, keywords)
const EMOTION_TABLE: &[(&str, &[&str])] = &[
    (
        "happy",
        &[
            "great",
            "wonderful",
            "glad",
            "love",
            "fantastic",
            "awesome",
            "happy",
            "yay",
            "嬉しい",
            "楽しい",
        ],
    ),
    (
        "sad",
        &[
            "sorry",
            "unfortunately",
            "sad",
            "miss you",
            "lonely",
            "regret",
            "disappointed",
            "悲しい",
            "残念",
        ],
    ),
    (
        "angry",
        &[
            "angry",
            "furious",
            "annoying",
            "unacceptable",
            "how dare",
            "stop it",
            "怒",
        ],
    ),
    (
        "surprised",
        &[
            "wow",
            "really?",
            "no way",
            "unbelievable",
            "surprising",
            "whoa",
            "びっくり",
            "えっ",
        ],
    ),
    (
        "relaxed",
        &[
            "relax",
            "take your time",
            "no rush",
            "calm",
            "peaceful",
            "gently",
            "breathe",
            "ゆっくり",
        ],
    ),
];

/// Split a leading `[emotion:X]` tag from `text`.
///
/// Returns the label and the remaining text, or `None` when the text does
/// not open with a well-formed tag. Labels are single words of letters,
/// digits, `_` or `-`; whether the model can show them is decided later.
#[must_use]
pub fn strip_emotion_tag(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim_start();
    let body = trimmed.strip_prefix(TAG_PREFIX)?;
    let end = body.find(']')?;
    let label = body[..end].trim();
    let valid = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return None;
    }
    let rest = body[end + 1..].trim_start().to_owned();
    Some((label.to_lowercase(), rest))
}

/// Guess an emotion for `text`.
///
/// An explicit tag wins with confidence 1.0. Otherwise confidence grows
/// with the number of keyword hits for the best-scoring emotion:
/// 1 hit gives 0.35, 2 give 0.55, 3 give 0.70, capped at 0.90.
#[must_use]
pub fn classify(text: &str) -> EmotionGuess {
    if let Some((emotion, _)) = strip_emotion_tag(text) {
        return EmotionGuess {
            emotion,
            confidence: 1.0,
        };
    }

    let lower = text.to_lowercase();
    let mut best = ("neutral", 0usize);
    for &(emotion, keywords) in EMOTION_TABLE {
        let score = keywords.iter().filter(|kw| lower.contains(*kw)).count();
        if score > best.1 {
            best = (emotion, score);
        }
    }

    let confidence = match best.1 {
        0 => 0.0,
        1 => 0.35,
        2 => 0.55,
        3 => 0.70,
        n => (0.70 + 0.05 * (n as f32 - 3.0)).min(0.90),
    };
    EmotionGuess {
        emotion: best.0.to_owned(),
        confidence,
    }
}

/// The guessed emotion if it clears [`CONFIDENCE_THRESHOLD`].
#[must_use]
pub fn infer(text: &str) -> Option<String> {
    let guess = classify(text);
    (guess.confidence >= CONFIDENCE_THRESHOLD).then_some(guess.emotion)
}
