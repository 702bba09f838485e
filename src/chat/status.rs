//! Engine and generation state

use std::fmt;

use crate::inference::ErrorKind;

/// Represents the current state of the engine's model
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub enum EngineStatus {
    #[default]
    Idle,
    Loading(String),
    Loaded(String),
    Failed(String),
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStatus::Idle => write!(f, "idle"),
            EngineStatus::Loading(model) => write!(f, "loading {}", model),
            EngineStatus::Loaded(model) => write!(f, "loaded {}", model),
            EngineStatus::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

/// Per-task state machine
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum GenerationState {
    #[default]
    Idle,
    EngineLoading,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GenerationState::Completed | GenerationState::Failed | GenerationState::Cancelled
        )
    }
}

/// How a generation task ended
#[derive(Clone, PartialEq, Debug)]
pub enum GenerationOutcome {
    Completed { text: String },
    /// Partial text is kept in the transcript
    Cancelled { partial: String },
    /// Partial text was removed from the transcript
    Failed { kind: ErrorKind, message: String },
}

impl GenerationOutcome {
    pub fn state(&self) -> GenerationState {
        match self {
            GenerationOutcome::Completed { .. } => GenerationState::Completed,
            GenerationOutcome::Cancelled { .. } => GenerationState::Cancelled,
            GenerationOutcome::Failed { .. } => GenerationState::Failed,
        }
    }
}
