//! Text truncation primitives.

/// Cut `value` to at most `max_chars` characters, never splitting a UTF-8
/// sequence. Appends `suffix` only when something was cut.
pub fn truncate_chars(value: &str, max_chars: usize, suffix: &str) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{}", &value[..byte_idx], suffix),
        None => value.to_string(),
    }
}

/// First seven characters of a commit hash.
pub fn short_sha(sha: &str) -> String {
    truncate_chars(sha, 7, "")
}
