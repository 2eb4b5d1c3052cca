//! Bounded capture of printed output.

use std::borrow::Cow;

/// Default byte budget for captured output.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 20_000;

/// Truncates `text` to roughly `max_bytes`, keeping its head and tail around
/// an explicit marker.
///
/// Text within budget is returned unchanged.
#[must_use]
pub fn truncate_output(text: &str, max_bytes: usize) -> Cow<'_, str> {
    if text.len() <= max_bytes {
        return Cow::Borrowed(text);
    }

    let head_end = floor_boundary(text, max_bytes / 2);
    let tail_start = ceil_boundary(text, text.len() - max_bytes / 2);
    let dropped = tail_start - head_end;
    Cow::Owned(format!(
        "{}\n..._This content has been truncated to stay below {max_bytes} bytes ({dropped} bytes omitted)_...\n{}",
        &text[..head_end],
        &text[tail_start..],
    ))
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_is_untouched() {
        assert!(matches!(truncate_output("hello", 10), Cow::Borrowed("hello")));
    }

    #[test]
    fn long_output_keeps_head_and_tail() {
        let text = format!("{}{}", "a".repeat(50), "z".repeat(50));
        let truncated = truncate_output(&text, 20);
        assert!(truncated.starts_with("aaaaaaaaaa\n"));
        assert!(truncated.ends_with("\nzzzzzzzzzz"));
        assert!(truncated.contains("truncated to stay below 20 bytes (80 bytes omitted)"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(40);
        let truncated = truncate_output(&text, 11);
        assert!(truncated.contains("truncated"));
    }
}
