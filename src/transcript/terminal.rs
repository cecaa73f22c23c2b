//! Plain-text rendering for terminals
//!
//! Walks the markdown event stream and lays each message out as a bubble:
//! user messages flush right, assistant messages flush left.

use super::{label, markdown_options, show_typing, TYPING_INDICATOR};
use crate::store::{Message, Sender};
use chrono::Local;
use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};

/// Bubbles take at most this share of the width, in percent
const BUBBLE_WIDTH_PCT: usize = 80;
const MIN_BUBBLE_WIDTH: usize = 20;

/// Render the transcript as lines no wider than `width` columns. While
/// `loading`, an empty trailing reply shows the typing indicator.
pub fn render_terminal(messages: &[Message], width: usize, loading: bool) -> Vec<String> {
    let width = width.max(MIN_BUBBLE_WIDTH);
    let bubble = (width * BUBBLE_WIDTH_PCT / 100).max(MIN_BUBBLE_WIDTH);
    let typing = show_typing(messages, loading);

    let mut out = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        if i > 0 {
            out.push(String::new());
        }

        let time = message.timestamp.with_timezone(&Local).format("%H:%M");
        let header = format!("{} · {time}", label(message.sender));

        let body = if typing && i + 1 == messages.len() {
            vec![TYPING_INDICATOR.to_string()]
        } else {
            markdown_lines(&message.text, bubble)
        };

        for line in std::iter::once(header).chain(body) {
            out.push(match message.sender {
                Sender::User => right_align(&line, width),
                Sender::Bot => line,
            });
        }
    }
    out
}

fn right_align(line: &str, width: usize) -> String {
    let len = line.chars().count();
    if len >= width {
        line.to_string()
    } else {
        format!("{}{line}", " ".repeat(width - len))
    }
}

/// Markdown text as wrapped plain lines
pub(crate) fn markdown_lines(text: &str, width: usize) -> Vec<String> {
    let mut writer = LineWriter::new(width);
    for event in Parser::new_ext(text, markdown_options()) {
        writer.event(event);
    }
    writer.finish()
}

#[derive(Default)]
struct LineWriter {
    width: usize,
    lines: Vec<String>,
    current: String,
    /// Continuation indent for wrapped lines of the current block
    hang: usize,
    /// Next number per open list; `None` for bullets
    lists: Vec<Option<u64>>,
    quote_depth: usize,
    code_block: bool,
    links: Vec<String>,
    /// Cells of the table row being built, if inside a table
    row: Option<Vec<String>>,
}

impl LineWriter {
    fn new(width: usize) -> Self {
        Self {
            width,
            ..Self::default()
        }
    }

    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) if self.code_block => {
                for line in text.lines() {
                    self.lines.push(format!("{}    {line}", self.quote_prefix()));
                }
            }
            Event::Text(text) | Event::Html(text) | Event::InlineHtml(text) => {
                self.push_text(&text);
            }
            Event::Code(code) => {
                self.push_text("`");
                self.push_text(&code);
                self.push_text("`");
            }
            Event::SoftBreak => self.push_text(" "),
            Event::HardBreak => self.flush(),
            Event::Rule => {
                self.flush();
                self.lines.push("─".repeat(self.width.min(40)));
                self.blank();
            }
            Event::TaskListMarker(done) => {
                self.push_text(if done { "[x] " } else { "[ ] " });
            }
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Heading { level, .. } => {
                self.flush();
                let marks = "#".repeat(level as usize);
                self.push_text(&format!("{marks} "));
            }
            Tag::List(start) => {
                self.flush();
                self.lists.push(start);
            }
            Tag::Item => {
                self.flush();
                let depth = self.lists.len().saturating_sub(1);
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let marker = format!("{n}. ");
                        *n += 1;
                        marker
                    }
                    _ => "• ".to_string(),
                };
                let indent = "  ".repeat(depth);
                self.hang = indent.chars().count() + marker.chars().count();
                self.current = format!("{indent}{marker}");
            }
            Tag::CodeBlock(kind) => {
                self.flush();
                let lang = match kind {
                    CodeBlockKind::Fenced(lang) => lang.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                if !lang.is_empty() {
                    self.lines.push(format!("{}  [{lang}]", self.quote_prefix()));
                }
                self.code_block = true;
            }
            Tag::BlockQuote(_) => {
                self.flush();
                self.quote_depth += 1;
            }
            Tag::Table(_) => self.flush(),
            Tag::TableHead | Tag::TableRow => self.row = Some(Vec::new()),
            Tag::TableCell => {
                if let Some(row) = self.row.as_mut() {
                    row.push(String::new());
                }
            }
            Tag::Link { dest_url, .. } => self.links.push(dest_url.to_string()),
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph | TagEnd::Heading(_) => {
                self.flush();
                if self.lists.is_empty() {
                    self.blank();
                }
            }
            TagEnd::Item => self.flush(),
            TagEnd::List(_) => {
                self.flush();
                self.lists.pop();
                if self.lists.is_empty() {
                    self.blank();
                }
            }
            TagEnd::CodeBlock => {
                self.code_block = false;
                self.blank();
            }
            TagEnd::BlockQuote(_) => {
                self.flush();
                self.quote_depth = self.quote_depth.saturating_sub(1);
                self.blank();
            }
            TagEnd::TableHead => {
                if let Some(cells) = self.row.take() {
                    let header = cells.join(" | ");
                    let rule = cells
                        .iter()
                        .map(|c| "-".repeat(c.chars().count().max(3)))
                        .collect::<Vec<_>>()
                        .join("-|-");
                    self.lines.push(header);
                    self.lines.push(rule);
                }
            }
            TagEnd::TableRow => {
                if let Some(cells) = self.row.take() {
                    self.lines.push(cells.join(" | "));
                }
            }
            TagEnd::Table => self.blank(),
            TagEnd::Link => {
                if let Some(url) = self.links.pop() {
                    self.push_text(&format!(" <{url}>"));
                }
            }
            _ => {}
        }
    }

    fn push_text(&mut self, text: &str) {
        match self.row.as_mut().and_then(|row| row.last_mut()) {
            Some(cell) => cell.push_str(text),
            None => self.current.push_str(text),
        }
    }

    fn quote_prefix(&self) -> String {
        "> ".repeat(self.quote_depth)
    }

    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.current);
        let prefix = self.quote_prefix();
        let width = self.width.saturating_sub(prefix.chars().count()).max(1);
        for wrapped in wrap(&line, width, self.hang) {
            self.lines.push(format!("{prefix}{wrapped}"));
        }
        self.hang = 0;
    }

    fn blank(&mut self) {
        if self.lines.last().is_some_and(|l| !l.is_empty()) {
            self.lines.push(String::new());
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        while self.lines.last().is_some_and(String::is_empty) {
            self.lines.pop();
        }
        self.lines
    }
}

/// Greedy word wrap; continuation lines are indented by `hang` columns
fn wrap(line: &str, width: usize, hang: usize) -> Vec<String> {
    if line.chars().count() <= width {
        return vec![line.to_string()];
    }

    let lead: String = line.chars().take_while(|c| *c == ' ').collect();
    let mut out = Vec::new();
    let mut current = lead;
    let mut current_len = current.chars().count();
    let has_words = |len: usize, indent: usize| len > indent;
    let mut indent = current_len;

    for word in line.split(' ').filter(|w| !w.is_empty()) {
        let word_len = word.chars().count();
        if has_words(current_len, indent) && current_len + 1 + word_len > width {
            out.push(std::mem::take(&mut current));
            current = " ".repeat(hang);
            current_len = hang;
            indent = hang;
        }
        if has_words(current_len, indent) {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paragraphs_and_headings() {
        let lines = markdown_lines("# Title\n\nSome *text* here.\n\nSecond.", 80);
        assert_eq!(lines, vec!["# Title", "", "Some text here.", "", "Second."]);
    }

    #[test]
    fn test_lists() {
        let lines = markdown_lines("- a\n- b\n\n1. x\n2. y\n", 80);
        assert_eq!(lines, vec!["• a", "• b", "", "1. x", "2. y"]);
    }

    #[test]
    fn test_nested_list() {
        let lines = markdown_lines("- a\n  - inner\n- b\n", 80);
        assert_eq!(lines, vec!["• a", "  • inner", "• b"]);
    }

    #[test]
    fn test_code_block_with_language() {
        let lines = markdown_lines("```rust\nfn main() {}\n```\n", 80);
        assert_eq!(lines, vec!["  [rust]", "    fn main() {}"]);
    }

    #[test]
    fn test_table_rows() {
        let lines = markdown_lines("| a | b |\n|---|---|\n| 1 | 2 |\n", 80);
        assert_eq!(lines, vec!["a | b", "----|----", "1 | 2"]);
    }

    #[test]
    fn test_task_list() {
        let lines = markdown_lines("- [x] done\n- [ ] todo\n", 80);
        assert_eq!(lines, vec!["• [x] done", "• [ ] todo"]);
    }

    #[test]
    fn test_wrap_with_hanging_indent() {
        let lines = markdown_lines("- alpha beta gamma delta", 12);
        assert_eq!(lines, vec!["• alpha beta", "  gamma", "  delta"]);
    }

    #[test]
    fn test_stop_marker_renders() {
        let lines = markdown_lines("partial\n\n⛔ **Stopped by user**", 80);
        assert_eq!(lines, vec!["partial", "", "⛔ Stopped by user"]);
    }

    #[test]
    fn test_bubbles_align_by_sender() {
        let messages = vec![
            Message::user("Hi"),
            Message::new(Sender::Bot, "Hello!"),
            Message::bot_placeholder(),
        ];
        let lines = render_terminal(&messages, 40, true);

        // User header and body flush right
        assert_eq!(lines[0].chars().count(), 40);
        assert!(lines[0].trim_start().starts_with("You · "));
        assert_eq!(lines[1], format!("{}Hi", " ".repeat(38)));
        assert_eq!(lines[2], "");
        assert!(lines[3].starts_with("Assistant · "));
        assert_eq!(lines[4], "Hello!");
        assert_eq!(lines[5], "");
        assert!(lines[6].starts_with("Assistant · "));
        assert_eq!(lines[7], TYPING_INDICATOR);
    }

    #[test]
    fn test_no_typing_indicator_when_idle() {
        let messages = vec![Message::user("Hi"), Message::bot_placeholder()];
        let lines = render_terminal(&messages, 40, false);

        assert!(lines.last().unwrap().starts_with("Assistant · "));
        assert!(!lines.iter().any(|l| l.contains(TYPING_INDICATOR)));
    }
}
