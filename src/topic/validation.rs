//! Topic name and pattern validation
//!
//! Rule sources are MQTT topic filters; rule targets are plain topics or
//! templates. These checks run once while the rule table is built so the
//! matcher never sees a malformed pattern.
//!
//! Key rules:
//! - Multi-level wildcard (#) must occupy the last level on its own
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are not matched by patterns starting with a wildcard

/// Maximum length of a topic or pattern in bytes (MQTT string limit)
const MAX_TOPIC_LEN: usize = 65535;

/// Validate a concrete topic (no wildcards allowed)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_common(topic)?;

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a subscription pattern used as a rule source
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_common(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

fn check_common(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("topic cannot be empty");
    }

    if value.len() > MAX_TOPIC_LEN {
        return Err("topic exceeds maximum length");
    }

    if value.contains('\0') {
        return Err("topic cannot contain null character");
    }

    Ok(())
}

/// Whether a pattern contains any wildcard level
pub fn has_wildcard(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}

/// Check if a pattern matches a concrete topic.
///
/// Linear reference implementation of the matcher semantics, used where a
/// single comparison is needed without building a trie.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }

        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("group1/topic1").is_ok());
        assert!(validate_topic_name("/leading/slash").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("group/+/in").is_err());
        assert!(validate_topic_name("group/#").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("group1/topic1").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("group/+/in").is_ok());
        assert!(validate_topic_filter("group/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("group+").is_err());
        assert!(validate_topic_filter("group/#/in").is_err());
        assert!(validate_topic_filter("group/in#").is_err());
        assert!(validate_topic_filter("a\0b").is_err());
    }

    #[test]
    fn test_has_wildcard() {
        assert!(has_wildcard("group/+/in"));
        assert!(has_wildcard("#"));
        assert!(!has_wildcard("group/1/in"));
        assert!(!has_wildcard("group/a+b"));
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(!topic_matches_filter("a/b/b/c", "a/+/c"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b", "a/#"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("a/b", "a"));

        assert!(!topic_matches_filter("$SYS/test", "+/test"));
        assert!(!topic_matches_filter("$SYS/test", "#"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/#"));
    }
}
