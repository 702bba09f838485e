//! Conversation storage
//!
//! Conversations are persisted wholesale as one pretty-printed JSON array.
//! Writes go to a sibling `.tmp` file which is then renamed over the target.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::storage::{get_data_dir, StorageError};
use crate::types::Conversation;

/// Backing store for the conversation list
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn save(&self, conversations: &[Conversation]) -> Result<(), StorageError>;

    /// Missing or unreadable data yields an empty list
    async fn load(&self) -> Vec<Conversation>;
}

#[derive(Debug, Clone)]
pub struct JsonConversationStore {
    path: PathBuf,
}

impl JsonConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<data dir>/conversations.json`
    pub fn in_data_dir() -> Result<Self, StorageError> {
        Ok(Self::new(get_data_dir()?.join("conversations.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ConversationRepository for JsonConversationStore {
    async fn save(&self, conversations: &[Conversation]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(conversations)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        tracing::debug!(
            "Saved {} conversations to {}",
            conversations.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Vec<Conversation> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No saved conversations at {}", self.path.display());
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!("Failed to read conversations: {}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str(&json) {
            Ok(conversations) => conversations,
            Err(e) => {
                tracing::warn!(
                    "Corrupt conversation file {}, starting empty: {}",
                    self.path.display(),
                    e
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, GenerationParams};

    fn sample() -> Vec<Conversation> {
        let mut first = Conversation::new();
        first.messages.push(ChatMessage::user("How do lifetimes work?"));
        first.messages.push(ChatMessage::assistant("They name regions of code."));
        first.derive_title();
        first.model = Some("llama-2-7b.Q4_K_M.gguf".to_string());
        first.generation_params = GenerationParams {
            seed: Some(42),
            stop: Some(vec!["</s>".to_string()]),
            ..GenerationParams::default()
        };

        vec![first, Conversation::new()]
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConversationStore::new(dir.path().join("conversations.json"));
        let conversations = sample();

        store.save(&conversations).await.unwrap();
        assert_eq!(store.load().await, conversations);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConversationStore::new(dir.path().join("nested").join("c.json"));

        store.save(&sample()).await.unwrap();
        store.save(&[]).await.unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConversationStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.json");
        std::fs::write(&path, "[{\"id\": 12").unwrap();
        assert!(JsonConversationStore::new(path).load().await.is_empty());
    }

    #[test]
    fn test_timestamps_are_rfc3339() {
        let json = serde_json::to_string(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let created = value[0]["created_at"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(created).is_ok());
    }
}
