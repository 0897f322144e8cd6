//! Pure, stateless transforms between stored messages and agent-facing text.
//!
//! `format_messages` builds the `<messages>` transcript block fed to an agent as its
//! prompt; `format_outbound` strips internal reasoning markup from an agent's reply
//! before it goes back out to a chat.

/// One row worth of transcript content, already filtered (no bot messages, no
/// messages before the relevant cursor).
#[derive(Clone, Debug)]
pub struct TranscriptMessage<'a> {
    pub sender: &'a str,
    pub timestamp: &'a str,
    pub content: &'a str,
}

/// Escape the characters XML requires escaping in both attribute and text content.
pub fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Reverse of [`escape_xml`]. Order of replacement matters: `&amp;` must be undone
/// last, or `&amp;lt;` would decode to `<` instead of `&lt;`.
pub fn unescape_xml(text: &str) -> String {
    text.replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

/// Render a batch of messages as the `<messages>` transcript block.
///
/// ```text
/// <messages>
/// <message sender="X" time="T">CONTENT</message>
/// </messages>
/// ```
pub fn format_messages(messages: &[TranscriptMessage<'_>]) -> String {
    let mut out = String::from("<messages>\n");
    for m in messages {
        out.push_str(&format!(
            "<message sender=\"{}\" time=\"{}\">{}</message>\n",
            escape_xml(m.sender),
            escape_xml(m.timestamp),
            escape_xml(m.content)
        ));
    }
    out.push_str("</messages>");
    out
}

/// Strip every `<internal>...</internal>` block (non-greedy, may span lines) from an
/// agent's raw reply and trim the remainder. Returns an empty string when nothing is
/// left, which signals the caller to suppress the outbound send.
///
/// Idempotent: `format_outbound(format_outbound(x)) == format_outbound(x)`, since a
/// second pass finds no more `<internal>` tags to remove.
pub fn format_outbound(raw: &str) -> String {
    let stripped = strip_tag_blocks(raw, "internal");
    stripped.trim().to_string()
}

/// Remove every `<tag>...</tag>` block from `input`, scanning left to right the way
/// `extract_code_blocks` scans for fences: find the next open tag, find its matching
/// close tag, drop everything between (and the tags themselves), continue from there.
fn strip_tag_blocks(input: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let mut out = String::new();
    let mut i = 0usize;

    while let Some(rel) = input[i..].find(&open) {
        let start = i + rel;
        out.push_str(&input[i..start]);

        let content_start = start + open.len();
        let Some(end_rel) = input[content_start..].find(&close) else {
            // Unclosed tag: drop the rest rather than leaking a half-open block.
            return out;
        };
        let end = content_start + end_rel;
        i = end + close.len();
    }

    out.push_str(&input[i..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_unescape_round_trip() {
        let original = "<script>alert('x & y')</script> \"quoted\"";
        let escaped = escape_xml(original);
        assert_eq!(unescape_xml(&escaped), original);
    }

    #[test]
    fn format_messages_escapes_attributes_and_content() {
        let msgs = [TranscriptMessage {
            sender: "A & B",
            timestamp: "2024-01-01T00:00:00Z",
            content: "<hi> \"there\"",
        }];
        let rendered = format_messages(&msgs);
        assert!(rendered.contains("sender=\"A &amp; B\""));
        assert!(rendered.contains("&lt;hi&gt; &quot;there&quot;"));
    }

    #[test]
    fn format_outbound_strips_internal_blocks() {
        let raw = "before <internal>reasoning\nmore reasoning</internal> after";
        assert_eq!(format_outbound(raw), "before  after".trim());
    }

    #[test]
    fn format_outbound_strips_multiple_blocks() {
        let raw = "<internal>a</internal>keep this<internal>b</internal>";
        assert_eq!(format_outbound(raw), "keep this");
    }

    #[test]
    fn format_outbound_empty_when_only_internal() {
        let raw = "<internal>only reasoning here</internal>";
        assert_eq!(format_outbound(raw), "");
    }

    #[test]
    fn format_outbound_is_idempotent() {
        let raw = "<internal>a</internal>visible<internal>b</internal>";
        let once = format_outbound(raw);
        let twice = format_outbound(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn format_outbound_drops_unclosed_internal_tag() {
        let raw = "visible text <internal>never closed";
        assert_eq!(format_outbound(raw), "visible text");
    }
}
