/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use lingua::{Language, LanguageDetector, LanguageDetectorBuilder};

/// Language classification can be CPU intensive; the detector is built once
/// with preloaded models and shared.
pub fn build_detector() -> LanguageDetector {
    LanguageDetectorBuilder::from_languages(&[
        Language::Chinese,
        Language::Japanese,
        Language::Korean,
        Language::English,
    ])
    .with_preloaded_language_models()
    .build()
}

/// Whether a claimed BCP-47 tag matches any wanted primary subtag
/// ("zh-Hant" matches "zh").
pub fn claimed_lang_matches(tag: &str, wanted: &[String]) -> bool {
    let primary = tag.split('-').next().unwrap_or("").trim();
    if primary.is_empty() {
        return false;
    }
    wanted.iter().any(|w| w.eq_ignore_ascii_case(primary))
}

const CHINESE_JAPANESE_RATIO: f64 = 1.5;

/// Statistical detectors routinely report Chinese text as Japanese because
/// of the shared ideograph ranges. When that happens we fall back to
/// counting code points: clearly more Chinese-only than Japanese-only
/// characters means the text is Chinese after all.
pub fn looks_chinese(text: &str) -> bool {
    let mut zh = 0usize;
    let mut ja = 0usize;
    for c in text.chars() {
        if is_japanese_char(c) {
            ja += 1;
        }
        if is_chinese_char(c) {
            zh += 1;
        }
    }
    (zh as f64 / ja as f64) > CHINESE_JAPANESE_RATIO
}

fn is_chinese_char(c: char) -> bool {
    matches!(c,
        '\u{3400}'..='\u{4db5}'   // CJK Unified Ideographs Extension A
        | '\u{4e00}'..='\u{9fed}' // CJK Unified Ideographs
        | '\u{f900}'..='\u{faff}' // CJK Compatibility Ideographs
    )
}

fn is_japanese_char(c: char) -> bool {
    matches!(c,
        '\u{3021}'..='\u{3029}'   // Hangzhou numerals
        | '\u{3040}'..='\u{309f}' // Hiragana
        | '\u{30a0}'..='\u{30ff}' // Katakana
        | '\u{31f0}'..='\u{31ff}' // Katakana phonetic extension
        | '\u{f900}'..='\u{faff}' // CJK Compatibility Ideographs
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_lang_primary_subtag_matching() {
        let wanted = vec!["zh".to_string(), "en".to_string()];
        assert!(claimed_lang_matches("zh", &wanted));
        assert!(claimed_lang_matches("zh-Hant", &wanted));
        assert!(claimed_lang_matches("EN-us", &wanted));
        assert!(!claimed_lang_matches("ja", &wanted));
        assert!(!claimed_lang_matches("", &wanted));
    }

    #[test]
    fn chinese_text_beats_the_ratio() {
        assert!(looks_chinese("今天天气很好"));
    }

    #[test]
    fn kana_heavy_text_does_not() {
        assert!(!looks_chinese("こんにちは、世界のみなさん"));
    }

    #[test]
    fn latin_text_has_no_ratio() {
        // 0 / 0 is NaN, which never exceeds the threshold.
        assert!(!looks_chinese("Konnichiwa minna"));
    }
}
