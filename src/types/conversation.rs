//! Conversation type
//!
//! A titled transcript plus the model and sampling settings it runs with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ChatMessage, GenerationParams};

/// Title given to new conversations until the first user message renames it
pub const DEFAULT_TITLE: &str = "New Chat";

/// Characters of the first user message used as the derived title
const TITLE_LEN: usize = 20;

/// A conversation transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Model identifier (file name or path) last used in this conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub generation_params: GenerationParams,
}

impl Default for Conversation {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            model: None,
            generation_params: GenerationParams::default(),
        }
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump `updated_at`, never moving it backwards
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Rename from the first user message while the title is still the default
    pub fn derive_title(&mut self) {
        if self.title != DEFAULT_TITLE {
            return;
        }
        let Some(first) = self.messages.iter().find(|m| m.is_user) else {
            return;
        };
        let title: String = first.content.chars().take(TITLE_LEN).collect();
        let title = title.trim();
        if !title.is_empty() {
            self.title = title.to_string();
        }
    }

    pub fn message_mut(&mut self, id: Uuid) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Remove a message by id, returning whether it existed
    pub fn remove_message(&mut self, id: Uuid) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        self.messages.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_from_first_user_message() {
        let mut conv = Conversation::new();
        conv.messages.push(ChatMessage::assistant("welcome"));
        conv.messages
            .push(ChatMessage::user("  Explain borrow checking in detail please"));
        conv.derive_title();
        assert_eq!(conv.title, "Explain borrow che");

        conv.messages.insert(0, ChatMessage::user("other"));
        conv.derive_title();
        assert_eq!(conv.title, "Explain borrow che");
    }

    #[test]
    fn test_custom_title_is_kept() {
        let mut conv = Conversation::new();
        conv.title = "Mine".to_string();
        conv.messages.push(ChatMessage::user("hello"));
        conv.derive_title();
        assert_eq!(conv.title, "Mine");
    }

    #[test]
    fn test_whitespace_message_keeps_default_title() {
        let mut conv = Conversation::new();
        conv.messages.push(ChatMessage::user("    "));
        conv.derive_title();
        assert_eq!(conv.title, DEFAULT_TITLE);
    }

    #[test]
    fn test_remove_message() {
        let mut conv = Conversation::new();
        let msg = ChatMessage::assistant("partial");
        let id = msg.id;
        conv.messages.push(msg);
        assert!(conv.remove_message(id));
        assert!(!conv.remove_message(id));
        assert!(conv.messages.is_empty());
    }
}
