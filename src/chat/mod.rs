//! Chat orchestration
//!
//! Conversation state, the generation coordinator and the side channels it
//! feeds: debounced persistence and user notifications.

pub mod coordinator;
pub mod notifications;
pub mod persistence;
pub mod session;
pub mod status;

pub use coordinator::{CoordinatorConfig, GenerationCoordinator, GenerationTask};
pub use notifications::{Notification, NotificationCenter};
pub use persistence::SaveScheduler;
pub use session::ChatSession;
pub use status::{EngineStatus, GenerationOutcome, GenerationState};
