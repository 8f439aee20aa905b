//! Deterministic cleanup of transcribed page text.
//!
//! Backends disagree on trivia: some wrap the answer in a fenced block
//! despite being told not to, some emit CRLF, some pad with zero-width
//! characters. [`clean_text`] irons those out without touching content, so
//! pages from different backends in the same document look alike.

use once_cell::sync::Lazy;
use regex::Regex;

/// Languages a model tags its wrapping fence with when it wraps the whole page.
static RE_WRAPPING_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\A```[ \t]*(?:markdown|md|text|plaintext)?[ \t]*\n(.*?)\n?```[ \t]*\z").unwrap()
});

/// Clean one page.
///
/// In order: unwrap a whole-page fence, normalise line endings, strip
/// invisible characters, trim trailing whitespace per line, drop leading
/// blank lines, collapse runs of blank lines to one, end with exactly one
/// newline. An all-blank page becomes the empty string.
///
/// Lines inside backtick or tilde fenced blocks are kept verbatim. Outside them a
/// Markdown hard break (two or more trailing spaces before another text
/// line) survives as exactly two spaces.
pub fn clean_text(input: &str) -> String {
    let text = normalise_line_endings(input);
    let text = unwrap_fence(&text);
    let text = remove_invisible_chars(&text);

    let raw: Vec<&str> = text.lines().collect();
    let mut lines: Vec<String> = Vec::with_capacity(raw.len());
    let mut open_fence: Option<&str> = None;
    let mut pending_blank = false;

    for (i, line) in raw.iter().enumerate() {
        if let Some(marker) = open_fence {
            lines.push(line.to_string());
            if line.trim_start().starts_with(marker) {
                open_fence = None;
            }
            continue;
        }

        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            pending_blank = !lines.is_empty();
            continue;
        }
        if pending_blank {
            lines.push(String::new());
            pending_blank = false;
        }

        open_fence = fence_marker(trimmed);
        let hard_break = open_fence.is_none()
            && line.ends_with("  ")
            && raw.get(i + 1).is_some_and(|next| !next.trim().is_empty());
        if hard_break {
            lines.push(format!("{trimmed}  "));
        } else {
            lines.push(trimmed.to_string());
        }
    }

    // An unclosed fence may leave blank lines at the end.
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let line = line.trim_start();
    if line.starts_with("```") {
        Some("```")
    } else if line.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn unwrap_fence(input: &str) -> String {
    match RE_WRAPPING_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_markdown_fence() {
        assert_eq!(clean_text("```markdown\n# Title\n\nBody\n```"), "# Title\n\nBody\n");
        assert_eq!(clean_text("```\nplain\n```\n"), "plain\n");
    }

    #[test]
    fn keeps_inner_code_blocks() {
        let page = "Intro\n\n```rust\nfn main() {}\n```\n\nOutro";
        assert_eq!(clean_text(page), format!("{page}\n"));
    }

    #[test]
    fn keeps_page_that_is_a_single_code_block() {
        let page = "```python\nprint(1)\n```";
        assert_eq!(clean_text(page), format!("{page}\n"));
    }

    #[test]
    fn normalises_whitespace() {
        let raw = "\r\n\r\nLine one  \r\n\r\n\r\n\r\nLine two\t\n\n\n";
        assert_eq!(clean_text(raw), "Line one\n\nLine two\n");
    }

    #[test]
    fn keeps_hard_line_breaks() {
        assert_eq!(
            clean_text("Jane Doe  \n12 Main St   \nSpringfield  \n\nNext"),
            "Jane Doe  \n12 Main St  \nSpringfield\n\nNext\n"
        );
    }

    #[test]
    fn fenced_blocks_are_verbatim() {
        let page = "Intro\n\n```text\ncol a  \n\n\n\ncol b\n```\n\n\n\nOutro";
        assert_eq!(
            clean_text(page),
            "Intro\n\n```text\ncol a  \n\n\n\ncol b\n```\n\nOutro\n"
        );

        let tilde = "~~~\nx\t\n\n\ny\n~~~";
        assert_eq!(clean_text(tilde), format!("{tilde}\n"));
    }

    #[test]
    fn unclosed_fence_drops_trailing_blank_lines() {
        assert_eq!(clean_text("Text\n```\ncode\n\n\n"), "Text\n```\ncode\n");
    }

    #[test]
    fn strips_invisible_characters() {
        assert_eq!(clean_text("\u{FEFF}Hel\u{200B}lo"), "Hello\n");
    }

    #[test]
    fn blank_page_is_empty() {
        assert_eq!(clean_text(" \n\n\t\n"), "");
        assert_eq!(clean_text(""), "");
    }
}
