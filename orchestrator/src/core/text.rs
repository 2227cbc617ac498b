//! Text truncation for logs and diagnostics.

/// Character budget for subprocess output quoted in errors and progress logs.
pub const DIAGNOSTIC_SNIPPET_CHARS: usize = 1200;

/// Truncate `text` to at most `max_chars` characters, noting dropped length.
///
/// Truncation is by character, never mid code point.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n[truncated {} chars]", total - max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(snippet("hello", 10), "hello");
        assert_eq!(snippet("", 10), "");
    }

    #[test]
    fn long_text_is_truncated_with_notice() {
        let out = snippet("abcdef", 4);
        assert_eq!(out, "abcd\n[truncated 2 chars]");
    }

    #[test]
    fn truncation_is_character_safe() {
        let out = snippet("日本語テキスト", 3);
        assert!(out.starts_with("日本語"));
        assert!(out.contains("[truncated 4 chars]"));
    }
}
