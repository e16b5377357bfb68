//! Viseme resolution for lip-sync animation.
//!
//! A viseme is a visual mouth shape that corresponds to a speech sound.
//! [`resolve`] finds the viseme active at a character offset within a unit
//! sequence. [`from_arpabet`] maps ARPABET phonemes to the five vowel mouth
//! shapes most avatar rigs expose (`aa`, `ih`, `ou`, `ee`, `oh`).

use crate::timing::TimedUnit;

/// The viseme active at a given offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedViseme<'a> {
    /// Index of the containing unit.
    pub unit_index: usize,
    /// The containing unit.
    pub unit: &'a TimedUnit,
    /// Index into `unit.visemes`.
    pub viseme_index: usize,
    /// Fractional progress through the unit in `0.0..=1.0`.
    pub progress: f32,
}

impl<'a> ResolvedViseme<'a> {
    /// Label of the selected viseme.
    #[must_use]
    pub fn label(&self) -> &'a str {
        // viseme_index is always clamped to the unit's viseme count.
        self.unit
            .visemes
            .get(self.viseme_index)
            .map_or("", String::as_str)
    }
}

/// Find the viseme active at `offset`.
///
/// The active unit is the last unit whose start offset has been reached.
/// Its span runs to the next unit's start, or covers its own text when it
/// is the final unit. Progress through that span picks the viseme.
///
/// Returns `None` when `units` is empty, when `offset` precedes the first
/// unit, or when the selected unit has no visemes.
#[must_use]
pub fn resolve(units: &[TimedUnit], offset: usize) -> Option<ResolvedViseme<'_>> {
    let reached = units.partition_point(|u| u.start_offset <= offset);
    let unit_index = reached.checked_sub(1)?;
    let unit = &units[unit_index];
    let count = unit.visemes.len();
    if count == 0 {
        return None;
    }

    let span = match units.get(unit_index + 1) {
        Some(next) => next.start_offset.saturating_sub(unit.start_offset),
        None => unit.char_len(),
    };
    let progress = if span == 0 {
        1.0
    } else {
        ((offset - unit.start_offset) as f32 / span as f32).clamp(0.0, 1.0)
    };
    let viseme_index = ((progress * count as f32).floor() as usize).min(count - 1);

    Some(ResolvedViseme {
        unit_index,
        unit,
        viseme_index,
        progress,
    })
}

/// Map an ARPABET phoneme to a vowel mouth shape.
///
/// Stress markers (`0`, `1`, `2`) are ignored. Silence markers return
/// `None`; consonants map to the closest open shape.
#[must_use]
pub fn from_arpabet(phoneme: &str) -> Option<&'static str> {
    let p = phoneme.trim_end_matches(['0', '1', '2']);

    let label = match p.to_ascii_uppercase().as_str() {
        "" | "SIL" | "SP" => return None,

        // Open vowels
        "AA" | "AO" | "AW" | "AE" | "AH" => "aa",

        // Spread vowels and glide
        "AY" | "EY" | "IH" | "IY" | "Y" => "ih",
        "EH" | "ER" => "ee",

        // Rounded vowels
        "OW" | "OY" => "oh",
        "UH" | "UW" | "W" => "ou",

        // Lips pressed or rounded consonants
        "B" | "P" | "M" | "EM" | "F" | "V" => "ou",

        // Sibilants show teeth
        "S" | "Z" | "CH" | "JH" | "SH" | "ZH" | "TH" | "DH" => "ih",

        // Default to slight open for everything else
        _ => "aa",
    };
    Some(label)
}

/// Convert a phoneme sequence to viseme labels.
///
/// Silence is skipped and consecutive duplicates collapse into one viseme,
/// which smooths the animation.
pub fn visemes_from_phonemes<'a>(phonemes: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for label in phonemes.into_iter().filter_map(from_arpabet) {
        if result.last().is_some_and(|last| last == label) {
            continue;
        }
        result.push(label.to_owned());
    }
    result
}
