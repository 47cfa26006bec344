pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// One-line rendering of an error and its causes, for logs and chat replies.
/// Causes that repeat their parent's text (common with `.context`) are dropped.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut line = String::new();
    let mut previous: Option<String> = None;
    for text in err.chain().map(|cause| cause.to_string()) {
        if text.is_empty() || previous.as_deref() == Some(text.as_str()) {
            continue;
        }
        if !line.is_empty() {
            line.push_str(": ");
        }
        line.push_str(&text);
        previous = Some(text);
    }
    if line.is_empty() {
        line.push_str("unknown error");
    }
    line
}

/// Cuts `s` to at most `max_bytes`, respecting char boundaries.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}
