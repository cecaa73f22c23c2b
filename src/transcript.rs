//! Maps a conversation's messages to display blocks
//!
//! Pure functions: callers re-render whenever the store reports a change and
//! scroll to [`Transcript::scroll_to`].

mod terminal;

pub use terminal::render_terminal;

use crate::store::{Message, Sender};
use chrono::Local;
use pulldown_cmark::{html, Options, Parser};
use serde::Serialize;

/// Shown when no conversation is active
pub const EMPTY_STATE: &str = "Start a new conversation";
pub const EMPTY_STATE_HINT: &str = "Ask anything to begin. Your chat history will appear here.";

/// Shown while the response has not produced any text yet
pub const TYPING_INDICATOR: &str = "● ● ●";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    Left,
    Right,
}

/// One rendered message bubble
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    pub id: String,
    pub sender: Sender,
    pub label: &'static str,
    pub align: Align,
    /// Local wall-clock time, `HH:MM`
    pub time: String,
    pub html: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transcript {
    pub blocks: Vec<Block>,
    /// Newest block; the view keeps it in sight
    pub scroll_to: Option<String>,
}

pub fn label(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "You",
        Sender::Bot => "Assistant",
    }
}

pub fn align(sender: Sender) -> Align {
    match sender {
        Sender::User => Align::Right,
        Sender::Bot => Align::Left,
    }
}

pub fn render_transcript(messages: &[Message]) -> Transcript {
    let blocks: Vec<Block> = messages.iter().map(render_block).collect();
    let scroll_to = blocks.last().map(|b| b.id.clone());
    Transcript { blocks, scroll_to }
}

fn render_block(message: &Message) -> Block {
    Block {
        id: message.id.clone(),
        sender: message.sender,
        label: label(message.sender),
        align: align(message.sender),
        time: message
            .timestamp
            .with_timezone(&Local)
            .format("%H:%M")
            .to_string(),
        html: render_markdown(&message.text),
    }
}

/// GitHub-flavoured extensions used by message bodies
pub(crate) fn markdown_options() -> Options {
    Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS
}

/// Markdown to HTML. Fenced code keeps its `language-*` class for highlighting.
pub fn render_markdown(text: &str) -> String {
    let parser = Parser::new_ext(text, markdown_options());
    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

/// Whether to show the typing indicator: a turn is loading and the reply has
/// no text yet
pub fn show_typing(messages: &[Message], loading: bool) -> bool {
    loading
        && messages
            .last()
            .is_some_and(|m| m.sender == Sender::Bot && m.text.is_empty())
}
