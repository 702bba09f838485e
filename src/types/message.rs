//! Message types
//!
//! Defines the chat message stored in a conversation transcript.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Stable identifier
    pub id: Uuid,
    /// The content of the message
    pub content: String,
    /// True when authored by the user, false for assistant output
    pub is_user: bool,
    /// When the message was created
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a user-authored message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(content, true)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(content, false)
    }

    fn new(content: impl Into<String>, is_user: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            is_user,
            timestamp: Utc::now(),
        }
    }
}
