//! Topic template rewriting
//!
//! A target template may contain one `+`, which is replaced by the level the
//! source pattern's single `+` captured. `grp/+/in` -> `grp/+/out` routes
//! `grp/42/in` to `grp/42/out`.

/// Outbound topic (or HTTP path) for a message.
///
/// A non-empty `path` replaces `template`. Templates without `+` are static.
/// When `pattern` does not hold exactly one `+`, nothing can be captured and
/// the template is returned as is.
pub fn rewrite(pattern: &str, topic: &str, template: &str, path: &str) -> String {
    let template = if path.is_empty() { template } else { path };

    if !template.contains('+') {
        return template.to_string();
    }

    let mut parts = pattern.split('+');
    let (prefix, suffix) = match (parts.next(), parts.next(), parts.next()) {
        (Some(prefix), Some(suffix), None) => (prefix, suffix),
        _ => return template.to_string(),
    };

    let captured = topic.strip_prefix(prefix).unwrap_or(topic);
    let captured = captured.strip_suffix(suffix).unwrap_or(captured);

    template.replacen('+', captured, 1)
}
