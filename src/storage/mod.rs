//! Persistent storage
//!
//! This module handles all data persistence for conversations, settings, and model metadata.

pub mod conversations;
pub mod downloads;
pub mod models;
pub mod settings;

use std::path::PathBuf;

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not determine data directory")]
    NoDataDir,
}

/// Get the application data directory, creating it if needed
///
/// - Linux: ~/.local/share/localchat
/// - macOS: ~/Library/Application Support/com.LocalChat.LocalChat
/// - Windows: %APPDATA%/LocalChat/LocalChat/data
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    let dirs = directories::ProjectDirs::from("com", "LocalChat", "LocalChat")
        .ok_or(StorageError::NoDataDir)?;
    let dir = dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
