//! Line-oriented tagged segments.
//!
//! A segment is a start tag line, content lines and an end tag line. Content
//! lines that could be mistaken for tags (anything starting with `#`) and lines
//! starting with the escape character are prefixed with `\` when written, so
//! arbitrary text round-trips and tag lines stay unambiguous.

const ESCAPE: char = '\\';

pub fn escape_line(line: &str) -> String {
    if line.starts_with('#') || line.starts_with(ESCAPE) {
        format!("{ESCAPE}{line}")
    } else {
        line.to_string()
    }
}

pub fn unescape_line(line: &str) -> &str {
    line.strip_prefix(ESCAPE).unwrap_or(line)
}

/// Appends `start`, the escaped `content` and `end`, each on its own line.
pub fn push_segment(buf: &mut String, start: &str, end: &str, content: &str) {
    buf.push_str(start);
    buf.push('\n');
    if !content.is_empty() {
        for line in content.split('\n') {
            buf.push_str(&escape_line(line));
            buf.push('\n');
        }
    }
    buf.push_str(end);
    buf.push('\n');
}

/// Joins escaped content lines back into the original text.
pub fn join_content(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|line| unescape_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Returns the trimmed bodies of every complete `start`..`end` block in `text`.
/// Markers may appear anywhere in a line; an unterminated block is ignored.
pub fn extract_blocks(text: &str, start: &str, end: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(start) {
        let after_open = &rest[open + start.len()..];
        let Some(close) = after_open.find(end) else {
            break;
        };
        let body = after_open[..close].trim();
        if !body.is_empty() {
            blocks.push(body.to_string());
        }
        rest = &after_open[close + end.len()..];
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaped_content_never_looks_like_a_tag() {
        let mut buf = String::new();
        push_segment(&mut buf, "#A#", "#/A#", "#/A#\n\\x\nplain");
        let lines: Vec<&str> = buf.lines().collect();
        assert_eq!(lines, vec!["#A#", "\\#/A#", "\\\\x", "plain", "#/A#"]);
        assert_eq!(join_content(&lines[1..4]), "#/A#\n\\x\nplain");
    }

    #[test]
    fn extract_blocks_skips_unterminated_and_empty_blocks() {
        let text = "x ###S### one ###E### y ###S###   ###E### ###S### two\n###E### ###S### dangling";
        assert_eq!(extract_blocks(text, "###S###", "###E###"), vec!["one", "two"]);
    }
}
