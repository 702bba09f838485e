//! Shared type definitions
//!
//! Conversation, message, model and generation-parameter types shared by the
//! engine layer, the chat session and storage.

pub mod conversation;
pub mod message;
pub mod model;
pub mod params;

pub use conversation::Conversation;
pub use message::ChatMessage;
pub use model::InstalledModel;
pub use params::GenerationParams;
