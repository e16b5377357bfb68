//! Language identification for backend selection.
//!
//! Pure and deterministic: the same text always classifies the same way.
//! Scripts used by a single language (kana, Hangul) decide directly, which
//! keeps very short CJK replies stable. Han text counts as Japanese when any
//! kana appears in it. Everything else goes through `whatlang`'s trigram
//! detector.

use whatlang::{Lang, Script};

/// Detected language, or undetermined when the text gives nothing to go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language(Option<Lang>);

impl Language {
    pub const UNDETERMINED: Self = Self(None);

    /// The detected language.
    #[must_use]
    pub fn lang(self) -> Option<Lang> {
        self.0
    }

    /// ISO 639-3 code (`und` when undetermined).
    #[must_use]
    pub fn code(self) -> &'static str {
        self.0.map_or("und", |lang| lang.code())
    }
}

impl From<Lang> for Language {
    fn from(lang: Lang) -> Self {
        Self(Some(lang))
    }
}

fn is_kana(ch: char) -> bool {
    matches!(ch,
        '\u{3040}'..='\u{309F}'
        | '\u{30A0}'..='\u{30FF}'
        | '\u{31F0}'..='\u{31FF}'
        | '\u{FF66}'..='\u{FF9F}')
}

fn is_han(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}')
}

/// Whether `ch` belongs to a script written without spaces between words
/// (kana, Han, and CJK punctuation).
#[must_use]
pub fn is_cjk(ch: char) -> bool {
    is_kana(ch) || is_han(ch) || matches!(ch, '\u{3001}'..='\u{303F}')
}

/// Identify the language of `text`.
#[must_use]
pub fn classify_language(text: &str) -> Language {
    match whatlang::detect_script(text) {
        None => Language::UNDETERMINED,
        Some(Script::Hiragana | Script::Katakana) => Lang::Jpn.into(),
        Some(Script::Hangul) => Lang::Kor.into(),
        Some(Script::Mandarin) if text.chars().any(is_kana) => Lang::Jpn.into(),
        Some(Script::Mandarin) => Lang::Cmn.into(),
        Some(_) => Language(whatlang::detect(text).map(|info| info.lang())),
    }
}
