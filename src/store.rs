//! Conversation store
//!
//! Owns the registry of conversations and the active-conversation pointer.
//! Every mutation writes the full registry and active id through the
//! key-value store before it returns, so a reader on the same handle always
//! sees its own writes. There is no cross-process coordination: two clients
//! sharing one storage file overwrite each other wholesale.

mod schema;

#[cfg(test)]
mod proptests;

pub use schema::*;

use crate::kv::{KeyValueStore, KvError};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to persist conversations: {0}")]
    Persist(#[from] KvError),
    #[error("Failed to serialize conversations: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Conversation store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Where a turn's streamed text goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSlot {
    pub conversation_id: String,
    pub user_message_id: String,
    pub placeholder_id: String,
    /// Conversation up to and including the new user message
    pub history: Vec<HistoryMessage>,
}

#[derive(Debug, Default)]
struct Registry {
    conversations: Vec<Conversation>,
    active_id: Option<String>,
}

impl Registry {
    fn position(&self, id: &str) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn active(&self) -> Option<&Conversation> {
        let id = self.active_id.as_deref()?;
        self.conversations.iter().find(|c| c.id == id)
    }

    fn create(&mut self) -> String {
        let conversation = Conversation::new();
        let id = conversation.id.clone();
        // Newest first, matching the sidebar order
        self.conversations.insert(0, conversation);
        self.active_id = Some(id.clone());
        id
    }

    /// Replace the text of the last message in `conversation_id` when it is a
    /// bot message (and, if given, the expected one).
    fn patch_last(&mut self, conversation_id: &str, expected_id: Option<&str>, text: &str) -> bool {
        let Some(conversation) = self.get_mut(conversation_id) else {
            return false;
        };
        let Some(last) = conversation.messages.last_mut() else {
            return false;
        };
        if last.sender != Sender::Bot {
            return false;
        }
        if expected_id.is_some_and(|id| id != last.id) {
            return false;
        }
        last.text.clear();
        last.text.push_str(text);
        conversation.touch();
        true
    }
}

/// Shared handle to the conversation registry
#[derive(Clone)]
pub struct ConversationStore {
    registry: Arc<Mutex<Registry>>,
    kv: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConversationStore {
    /// Load the persisted snapshot. Missing or unreadable state starts empty.
    pub fn load(kv: Arc<dyn KeyValueStore>) -> Self {
        let registry = Self::read_snapshot(kv.as_ref());
        tracing::debug!(
            conversations = registry.conversations.len(),
            active = ?registry.active_id,
            "Loaded conversation store"
        );
        let (events, _) = broadcast::channel(256);
        Self {
            registry: Arc::new(Mutex::new(registry)),
            kv,
            events,
        }
    }

    fn read_snapshot(kv: &dyn KeyValueStore) -> Registry {
        let raw = match kv.get(CHATS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Registry::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read saved conversations, starting fresh");
                return Registry::default();
            }
        };

        let conversations: Vec<Conversation> = match serde_json::from_str(&raw) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse saved conversations, starting fresh");
                return Registry::default();
            }
        };

        let saved_active = kv.get(ACTIVE_CHAT_KEY).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read active conversation id");
            None
        });

        // A dangling or missing pointer falls back to the first conversation
        let active_id = saved_active
            .filter(|id| conversations.iter().any(|c| &c.id == id))
            .or_else(|| conversations.first().map(|c| c.id.clone()));

        Registry {
            conversations,
            active_id,
        }
    }

    /// Receive a notification after every successful mutation
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| StoreError::Poisoned)
    }

    fn persist(&self, registry: &Registry) -> StoreResult<()> {
        if registry.conversations.is_empty() {
            self.kv.remove(CHATS_KEY)?;
        } else {
            let json = serde_json::to_string(&registry.conversations)?;
            self.kv.set(CHATS_KEY, &json)?;
        }
        match &registry.active_id {
            Some(id) => self.kv.set(ACTIVE_CHAT_KEY, id)?,
            None => self.kv.remove(ACTIVE_CHAT_KEY)?,
        }
        Ok(())
    }

    /// Apply `f` under the lock. When it reports a change, the snapshot is
    /// written and the events are broadcast.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Registry) -> (T, Vec<StoreEvent>),
    ) -> StoreResult<T> {
        let mut registry = self.lock()?;
        let (value, events) = f(&mut registry);
        if !events.is_empty() {
            self.persist(&registry)?;
            drop(registry);
            for event in events {
                // No subscribers is fine
                let _ = self.events.send(event);
            }
        }
        Ok(value)
    }

    // ==================== Conversation Operations ====================

    /// Create an empty conversation, make it active and return its id
    pub fn create_conversation(&self) -> StoreResult<String> {
        self.mutate(|r| {
            let id = r.create();
            tracing::info!(conv_id = %id, "Created conversation");
            (id.clone(), vec![StoreEvent::Created { id }])
        })
    }

    /// Active conversation id, creating a conversation if there is none
    pub fn ensure_active(&self) -> StoreResult<String> {
        self.mutate(|r| match r.active().map(|c| c.id.clone()) {
            Some(id) => (id, vec![]),
            None => {
                let id = r.create();
                (id.clone(), vec![StoreEvent::Created { id }])
            }
        })
    }

    /// Point at `id`. Unknown ids are ignored; returns whether it was selected.
    pub fn select_conversation(&self, id: &str) -> StoreResult<bool> {
        self.mutate(|r| {
            if r.position(id).is_none() {
                tracing::debug!(conv_id = %id, "Ignoring selection of unknown conversation");
                return (false, vec![]);
            }
            r.active_id = Some(id.to_string());
            (true, vec![StoreEvent::Selected { id: id.to_string() }])
        })
    }

    /// Remove a conversation. Deleting the active one moves the pointer to the
    /// first remaining conversation, or clears it.
    pub fn delete_conversation(&self, id: &str) -> StoreResult<bool> {
        self.mutate(|r| {
            let Some(pos) = r.position(id) else {
                return (false, vec![]);
            };
            r.conversations.remove(pos);
            if r.active_id.as_deref() == Some(id) {
                r.active_id = r.conversations.first().map(|c| c.id.clone());
            }
            tracing::info!(conv_id = %id, "Deleted conversation");
            (true, vec![StoreEvent::Deleted { id: id.to_string() }])
        })
    }

    /// Replace a conversation's title. The store does not validate the title.
    pub fn rename_conversation(&self, id: &str, title: &str) -> StoreResult<bool> {
        self.mutate(|r| {
            let Some(conversation) = r.get_mut(id) else {
                return (false, vec![]);
            };
            conversation.title = title.to_string();
            conversation.touch();
            (true, vec![StoreEvent::Renamed { id: id.to_string() }])
        })
    }

    /// Drop every conversation and remove the persisted keys
    pub fn clear_all(&self) -> StoreResult<()> {
        let mut registry = self.lock()?;
        registry.conversations.clear();
        registry.active_id = None;
        self.kv.remove(CHATS_KEY)?;
        self.kv.remove(ACTIVE_CHAT_KEY)?;
        drop(registry);
        tracing::info!("Cleared all conversations");
        let _ = self.events.send(StoreEvent::Cleared);
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append to the active conversation. No-op without one.
    pub fn append_message(&self, message: Message) -> StoreResult<bool> {
        self.mutate(|r| {
            let Some(id) = r.active_id.clone() else {
                return (false, vec![]);
            };
            let Some(conversation) = r.get_mut(&id) else {
                return (false, vec![]);
            };
            conversation.messages.push(message);
            conversation.touch();
            (
                true,
                vec![StoreEvent::MessageAppended {
                    conversation_id: id,
                }],
            )
        })
    }

    /// Replace the text of the active conversation's last message, only when
    /// that message was sent by the bot.
    pub fn patch_last_bot_message(&self, text: &str) -> StoreResult<bool> {
        self.mutate(|r| {
            let Some(id) = r.active_id.clone() else {
                return (false, vec![]);
            };
            if r.patch_last(&id, None, text) {
                (
                    true,
                    vec![StoreEvent::MessagePatched {
                        conversation_id: id,
                    }],
                )
            } else {
                (false, vec![])
            }
        })
    }

    /// Ensure an active conversation and append the user message plus an
    /// empty bot placeholder in one step.
    pub fn begin_turn(&self, text: &str) -> StoreResult<TurnSlot> {
        self.mutate(|r| {
            let mut events = Vec::new();
            let conversation_id = match r.active().map(|c| c.id.clone()) {
                Some(id) => id,
                None => {
                    let id = r.create();
                    events.push(StoreEvent::Created { id: id.clone() });
                    id
                }
            };

            let user = Message::user(text);
            let placeholder = Message::bot_placeholder();
            let mut slot = TurnSlot {
                conversation_id: conversation_id.clone(),
                user_message_id: user.id.clone(),
                placeholder_id: placeholder.id.clone(),
                history: Vec::new(),
            };

            if let Some(conversation) = r.get_mut(&conversation_id) {
                conversation.messages.push(user);
                slot.history = conversation.messages.iter().map(HistoryMessage::from).collect();
                conversation.messages.push(placeholder);
                conversation.touch();
            }
            events.push(StoreEvent::MessageAppended { conversation_id });
            (slot, events)
        })
    }

    /// Patch a turn's placeholder. Applies only while the placeholder is still
    /// the last message of its conversation, regardless of which conversation
    /// is active now.
    pub fn patch_turn(&self, slot: &TurnSlot, text: &str) -> StoreResult<bool> {
        self.mutate(|r| {
            if r.patch_last(&slot.conversation_id, Some(&slot.placeholder_id), text) {
                (
                    true,
                    vec![StoreEvent::MessagePatched {
                        conversation_id: slot.conversation_id.clone(),
                    }],
                )
            } else {
                (false, vec![])
            }
        })
    }

    // ==================== Reads ====================

    /// Snapshot of every conversation in registry order
    pub fn conversations(&self) -> StoreResult<Vec<Conversation>> {
        Ok(self.lock()?.conversations.clone())
    }

    pub fn conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        Ok(self.lock()?.conversations.iter().find(|c| c.id == id).cloned())
    }

    pub fn active_id(&self) -> StoreResult<Option<String>> {
        Ok(self.lock()?.active_id.clone())
    }

    pub fn active_conversation(&self) -> StoreResult<Option<Conversation>> {
        Ok(self.lock()?.active().cloned())
    }

    /// Sidebar rows in registry order
    pub fn summaries(&self) -> StoreResult<Vec<ConversationSummary>> {
        let registry = self.lock()?;
        Ok(registry
            .conversations
            .iter()
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                title: c.title.clone(),
                message_count: c.messages.len(),
                preview: c.preview(),
                is_active: registry.active_id.as_deref() == Some(c.id.as_str()),
            })
            .collect())
    }

    /// A conversation's messages in the role/content shape, in order
    pub fn history(&self, conversation_id: &str) -> StoreResult<Vec<HistoryMessage>> {
        let registry = self.lock()?;
        Ok(registry
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map(|c| c.messages.iter().map(HistoryMessage::from).collect())
            .unwrap_or_default())
    }

    /// History of the active conversation; empty without one
    pub fn history_for_request(&self) -> StoreResult<Vec<HistoryMessage>> {
        let registry = self.lock()?;
        Ok(registry
            .active()
            .map(|c| c.messages.iter().map(HistoryMessage::from).collect())
            .unwrap_or_default())
    }
}
