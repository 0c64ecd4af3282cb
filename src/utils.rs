//! Small helpers shared across the daemon.

/// Truncates a string to at most `max_chars` characters, adding "..." when
/// truncated. UTF-8 safe: respects character boundaries so multi-byte input
/// never panics.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.len() <= max_chars {
        // Byte length <= max_chars implies char count <= max_chars.
        return s.to_string();
    }
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }
    if max_chars <= 3 {
        return "...".chars().take(max_chars).collect();
    }
    let truncated: String = s.chars().take(max_chars - 3).collect();
    format!("{truncated}...")
}

/// Caps captured process output at `max_bytes`, appending an explicit
/// truncation marker so downstream consumers (the Verifier prompt, the
/// conversation log) can tell the output is partial.
///
/// The cut respects UTF-8 char boundaries.
pub fn cap_output(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n[... truncated at {} chars ...]", &s[..end], max_bytes)
}

/// Validates a URL-safe project name: non-empty, `[A-Za-z0-9._-]` only, and
/// not a dotfile (so project dirs never collide with `.tumbler` internals).
pub fn is_valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
