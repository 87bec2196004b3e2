//! Shared utility functions used across the codebase.

/// Find the largest valid UTF-8 char boundary at or before `pos`.
///
/// Polyfill for `str::floor_char_boundary` (nightly-only). Use when
/// truncating strings by byte position to avoid panicking on multi-byte
/// characters.
pub fn floor_char_boundary(s: &str, pos: usize) -> usize {
    if pos >= s.len() {
        return s.len();
    }
    let mut i = pos;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Keep the last `max_bytes` of `s`, marking the cut.
///
/// Container logs are most useful at the tail, where the failure is.
pub fn truncate_log_tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {start} bytes truncated ...]\n{}", &s[start..])
}

/// Truncate to at most `max_bytes`, on a char boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    &s[..floor_char_boundary(s, max_bytes)]
}

#[cfg(test)]
mod tests {
    use crate::util::*;

    #[test]
    fn floor_char_boundary_at_valid_boundary() {
        assert_eq!(floor_char_boundary("hello", 3), 3);
    }

    #[test]
    fn floor_char_boundary_mid_multibyte_char() {
        // 'é' is 2 bytes; byte 2 is in the middle of it.
        let s = "héllo";
        assert_eq!(floor_char_boundary(s, 2), 1);
    }

    #[test]
    fn floor_char_boundary_past_end() {
        assert_eq!(floor_char_boundary("abc", 10), 3);
        assert_eq!(floor_char_boundary("", 0), 0);
    }

    #[test]
    fn tail_truncation_keeps_the_end() {
        let log = "line one\nline two\nboom: stack overflow";
        let tail = truncate_log_tail(log, 20);
        assert!(tail.ends_with("boom: stack overflow"));
        assert!(tail.starts_with("[... "));
        assert_eq!(truncate_log_tail("short", 20), "short");
    }

    #[test]
    fn tail_truncation_respects_multibyte() {
        let s = "ééééé";
        let tail = truncate_log_tail(s, 3);
        assert!(tail.ends_with('é'));
    }

    #[test]
    fn truncate_utf8_never_splits_chars() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }
}
