//! Small text helpers shared by the generation stages.

/// Characters of the previous accepted chapter carried into the next drafting call.
pub const PREVIOUS_EXCERPT_CHARS: usize = 800;

/// Returns the last `max_chars` characters of `text`, never splitting a code point.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Pulls the JSON payload out of a model reply that may wrap it in a
/// Markdown fence or surround it with prose.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let body = &text[start + 3..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }

    let open = text.find(|c: char| c == '{' || c == '[');
    let close = text.rfind(|c: char| c == '}' || c == ']');
    match (open, close) {
        (Some(open), Some(close)) if close > open => &text[open..=close],
        _ => text,
    }
}

/// Removes fence markers the way every stage cleans raw model output.
pub fn strip_fences(text: &str) -> String {
    text.replace("```", "").trim().to_string()
}

/// Case-insensitive whole-word search. `needle` may span several words.
pub fn contains_word(haystack: &str, needle: &str) -> bool {
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }
    let haystack = haystack.to_lowercase();

    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&needle) {
        let start = from + pos;
        let end = start + needle.len();
        let left_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let right_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if left_ok && right_ok {
            return true;
        }
        from = start
            + haystack[start..]
                .chars()
                .next()
                .map_or(1, |c| c.len_utf8());
    }
    false
}

/// Lowercases, drops punctuation and collapses whitespace.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_characters() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 5), "ab");
        assert_eq!(tail_chars("héllo", 4), "éllo");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[test]
    fn extracts_fenced_and_embedded_json() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```\n[1,2]\n```"), "[1,2]");
        assert_eq!(
            extract_json("Here is the bible: {\"a\":1} hope it helps"),
            "{\"a\":1}"
        );
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn word_matching_respects_boundaries() {
        assert!(contains_word("Inspector Lecoq entered.", "lecoq"));
        assert!(contains_word("Madame Roux, the concierge", "Madame Roux"));
        assert!(!contains_word("Annabelle smiled", "Anna"));
        assert!(!contains_word("anything", ""));
    }

    #[test]
    fn normalize_strips_punctuation() {
        assert_eq!(normalize("  Dark-Brown, eyes! "), "dark brown eyes");
    }
}
