//! Chat session
//!
//! Owns the conversation list and the current selection. The list is kept
//! ordered by `updated_at`, newest first, after every mutation, and always
//! holds at least one conversation.

use uuid::Uuid;

use crate::types::{ChatMessage, Conversation, GenerationParams};

#[derive(Debug, Clone)]
pub struct ChatSession {
    conversations: Vec<Conversation>,
    selected: Uuid,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::from_snapshot(Vec::new())
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from persisted conversations, selecting the most recent one
    pub fn from_snapshot(mut conversations: Vec<Conversation>) -> Self {
        if conversations.is_empty() {
            conversations.push(Conversation::new());
        }
        let mut session = Self {
            selected: conversations[0].id,
            conversations,
        };
        session.sort();
        session.selected = session.conversations[0].id;
        session
    }

    pub fn snapshot(&self) -> Vec<Conversation> {
        self.conversations.clone()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: Uuid) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    pub fn selected_id(&self) -> Uuid {
        self.selected
    }

    pub fn selected(&self) -> &Conversation {
        // selected always names a conversation in the list
        self.get(self.selected).unwrap_or(&self.conversations[0])
    }

    /// Create a conversation and select it
    pub fn new_conversation(&mut self) -> Uuid {
        let conversation = Conversation::new();
        let id = conversation.id;
        self.conversations.insert(0, conversation);
        self.selected = id;
        self.sort();
        id
    }

    pub fn select(&mut self, id: Uuid) -> bool {
        if self.get(id).is_some() {
            self.selected = id;
            true
        } else {
            false
        }
    }

    /// Rename the selected conversation; blank titles are ignored
    pub fn rename_selected(&mut self, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }
        let id = self.selected;
        let Some(conversation) = self.get_mut(id) else {
            return false;
        };
        conversation.title = title.to_string();
        conversation.touch();
        self.sort();
        true
    }

    /// Delete a conversation, creating a fresh one if the list would be empty
    pub fn delete(&mut self, id: Uuid) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != id);
        if self.conversations.len() == before {
            return false;
        }
        if self.conversations.is_empty() {
            self.conversations.push(Conversation::new());
        }
        if self.selected == id {
            self.selected = self.conversations[0].id;
        }
        true
    }

    /// Append a user message to the selected conversation
    ///
    /// Returns `(conversation id, message id)`.
    pub fn append_user_message(&mut self, content: &str, model: Option<String>) -> (Uuid, Uuid) {
        let id = self.selected;
        let message = ChatMessage::user(content);
        let message_id = message.id;
        if let Some(conversation) = self.get_mut(id) {
            conversation.messages.push(message);
            if model.is_some() {
                conversation.model = model;
            }
            conversation.derive_title();
            conversation.touch();
        }
        self.sort();
        (id, message_id)
    }

    /// Record the sampling parameters last used in a conversation
    pub fn set_generation_params(
        &mut self,
        conversation_id: Uuid,
        params: GenerationParams,
    ) -> bool {
        match self.get_mut(conversation_id) {
            Some(conversation) => {
                conversation.generation_params = params;
                true
            }
            None => false,
        }
    }

    /// Extend the assistant message `message`, or start one when `None`
    ///
    /// Returns the assistant message id, or `None` if the conversation is gone.
    pub fn append_token(
        &mut self,
        conversation_id: Uuid,
        message: Option<Uuid>,
        token: &str,
    ) -> Option<Uuid> {
        let conversation = self.get_mut(conversation_id)?;
        let id = match message.and_then(|id| conversation.message_mut(id)) {
            Some(existing) => {
                existing.content.push_str(token);
                existing.id
            }
            None => {
                let created = ChatMessage::assistant(token);
                let id = created.id;
                conversation.messages.push(created);
                id
            }
        };
        conversation.touch();
        self.sort();
        Some(id)
    }

    pub fn remove_message(&mut self, conversation_id: Uuid, message_id: Uuid) -> bool {
        self.get_mut(conversation_id)
            .is_some_and(|c| c.remove_message(message_id))
    }

    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }
}
