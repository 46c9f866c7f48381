//! Input normalisation and the canonical short-confirmation sets.

/// English short confirmations.
const CONFIRMATIONS_EN: &[&str] = &[
    "ok", "yes", "yeah", "sure", "right", "correct", "good", "fine", "alright", "okay",
];

/// Chinese short confirmations.
const CONFIRMATIONS_ZH: &[&str] = &[
    "好", "好的", "嗯", "行", "可以", "没问题", "确认", "对", "是的", "同意", "确定",
];

/// Trailing terminal punctuation stripped during normalisation.
const TRAILING_PUNCTUATION: &[char] = &['。', '！', '？', '.', '!', '?'];

/// Normalise an utterance for confirmation matching: trim, lowercase,
/// strip trailing terminal punctuation. Idempotent.
pub fn normalize(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .trim_end_matches(TRAILING_PUNCTUATION)
        .trim()
        .to_string()
}

/// Whether the (raw) utterance is a canonical short confirmation.
pub fn is_short_confirmation(input: &str) -> bool {
    let normalized = normalize(input);
    if normalized.is_empty() {
        return false;
    }
    CONFIRMATIONS_EN.contains(&normalized.as_str()) || CONFIRMATIONS_ZH.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalisation_is_idempotent() {
        for raw in ["  OK!! ", "好的。", "Sure...", "嗯？", "plain text", "" , "！？。"] {
            let once = normalize(raw);
            let twice = normalize(&once);
            assert_eq!(once, twice, "normalize(normalize({raw:?})) differs");
        }
    }

    #[test]
    fn strips_trailing_punctuation_and_case() {
        assert_eq!(normalize("  OK!  "), "ok");
        assert_eq!(normalize("好的。"), "好的");
        assert_eq!(normalize("Yes?!"), "yes");
    }

    #[test]
    fn recognises_confirmations_in_both_languages() {
        for s in ["ok", "OK", "yeah", "Alright.", "okay!"] {
            assert!(is_short_confirmation(s), "{s:?} should confirm");
        }
        for s in ["好的", "嗯", "没问题。", "确定！"] {
            assert!(is_short_confirmation(s), "{s:?} should confirm");
        }
    }

    #[test]
    fn rejects_non_confirmations() {
        for s in ["okay let's do something else instead", "不行", "maybe", ""] {
            assert!(!is_short_confirmation(s), "{s:?} should not confirm");
        }
    }

    #[test]
    fn interior_punctuation_is_preserved() {
        assert_eq!(normalize("what?! really?"), "what?! really");
    }
}
