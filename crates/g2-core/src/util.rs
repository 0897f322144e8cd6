use chrono::Utc;

/// RFC3339 timestamp in UTC, lexicographically ordered the same as temporal order.
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_len).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_text_adds_ellipsis_only_when_over_limit() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text(&"a".repeat(20), 10), format!("{}...", "a".repeat(10)));
    }
}
