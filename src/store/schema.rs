//! Conversation store types and persisted layout

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Key holding the JSON array of conversations
pub const CHATS_KEY: &str = "chatbot_chats";

/// Key holding the active conversation id
pub const ACTIVE_CHAT_KEY: &str = "chatbot_current_chat_id";

/// Sidebar previews are cut to this many characters
pub const PREVIEW_CHARS: usize = 30;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    /// Role name used on the wire to the relay
    pub fn role(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "assistant",
        }
    }
}

/// One turn's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            sender,
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text)
    }

    /// Empty bot message that streamed text is patched into
    pub fn bot_placeholder() -> Self {
        Self::new(Sender::Bot, String::new())
    }
}

/// A titled, ordered sequence of messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: default_title(now),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Last message's text, truncated for list display
    pub fn preview(&self) -> Option<String> {
        self.last_message().map(|m| truncate_preview(&m.text))
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Message in the generic role/content shape sent to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for HistoryMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.sender.role().to_string(),
            content: msg.text.clone(),
        }
    }
}

/// Sidebar row for one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub preview: Option<String>,
    pub is_active: bool,
}

impl ConversationSummary {
    /// "1 message" / "3 messages"
    pub fn count_label(&self) -> String {
        if self.message_count == 1 {
            "1 message".to_string()
        } else {
            format!("{} messages", self.message_count)
        }
    }
}

/// Change notifications for redraws
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created { id: String },
    Selected { id: String },
    Deleted { id: String },
    Renamed { id: String },
    Cleared,
    MessageAppended { conversation_id: String },
    MessagePatched { conversation_id: String },
}

fn default_title(now: DateTime<Utc>) -> String {
    format!("Chat {}", now.with_timezone(&Local).format("%Y-%m-%d"))
}

fn truncate_preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_serializes_lowercase() {
        let msg = Message::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["sender"], "user");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_conversation_uses_camel_case_dates() {
        let conv = Conversation::new();
        let json = serde_json::to_value(&conv).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
        assert!(conv.title.starts_with("Chat "));
    }

    #[test]
    fn test_preview_truncates_long_text() {
        let mut conv = Conversation::new();
        assert_eq!(conv.preview(), None);

        conv.messages.push(Message::user("short"));
        assert_eq!(conv.preview().as_deref(), Some("short"));

        conv.messages.push(Message::user("é".repeat(40)));
        let preview = conv.preview().unwrap();
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_history_roles() {
        let user = HistoryMessage::from(&Message::user("q"));
        let bot = HistoryMessage::from(&Message::bot_placeholder());
        assert_eq!(user.role, "user");
        assert_eq!(bot.role, "assistant");
    }

    #[test]
    fn test_count_label() {
        let mut summary = ConversationSummary {
            id: "c".to_string(),
            title: "t".to_string(),
            message_count: 1,
            preview: None,
            is_active: false,
        };
        assert_eq!(summary.count_label(), "1 message");
        summary.message_count = 0;
        assert_eq!(summary.count_label(), "0 messages");
    }
}
