//! Engine errors
//!
//! Failure taxonomy shared by every engine variant.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::inference::resolver::ResolveReport;

/// Coarse classification used for notifications and retry guidance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Executable, model or server missing
    NotFound,
    /// External process exited with a failure status
    ProcessFailure,
    /// Readiness or load deadline elapsed
    Timeout,
    /// Malformed or unexpected response
    Protocol,
    /// Local resource (port, library) unavailable
    Resource,
    /// Cancelled by the caller, never shown to the user
    Cancelled,
}

impl ErrorKind {
    /// Stable key segment
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::ProcessFailure => "process_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Resource => "resource",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Short headline for a notification
    pub fn title(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "Inference runtime not found",
            ErrorKind::ProcessFailure => "Inference process failed",
            ErrorKind::Timeout => "Inference engine timed out",
            ErrorKind::Protocol => "Unexpected engine response",
            ErrorKind::Resource => "Local resource unavailable",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// What the user can do about it
    pub fn remediation(self) -> &'static str {
        match self {
            ErrorKind::NotFound => {
                "Install llama.cpp (e.g. `brew install llama.cpp`) or set LLAMACPP_CLI / LLAMACPP_SERVER, and check the model file exists."
            }
            ErrorKind::ProcessFailure => "Check the process output above; the model may be incompatible with this llama.cpp build.",
            ErrorKind::Timeout => "The engine is slow to start. Try again, or pick a smaller model.",
            ErrorKind::Protocol => "The engine answered in an unexpected format. Updating llama.cpp usually fixes this.",
            ErrorKind::Resource => "Try again in a moment.",
            ErrorKind::Cancelled => "",
        }
    }
}

/// Errors raised by inference engines
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Model not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Invalid model file {}: {reason}", path.display())]
    InvalidModel { path: PathBuf, reason: String },

    #[error("Executable not found\n{0}")]
    ExecutableNotFound(ResolveReport),

    #[error("Failed to spawn {}: {source}", program.display())]
    ProcessSpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Process exited with {}: {output}", exit_label(.code))]
    ProcessExitedNonZero { code: Option<i32>, output: String },

    #[error("Server not ready after {timeout:?}")]
    ServerNotReady { timeout: Duration },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Model load timed out after {0:?}")]
    LoadTimeout(Duration),

    #[error("Native inference library is not available in this build")]
    LibraryUnavailable,

    #[error("Native library error: {0}")]
    Library(String),

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("No free local port available")]
    PortUnavailable,

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ModelNotFound(_)
            | EngineError::ExecutableNotFound(_)
            | EngineError::NoModelLoaded => ErrorKind::NotFound,
            EngineError::InvalidModel { .. }
            | EngineError::ProcessSpawnFailed { .. }
            | EngineError::ProcessExitedNonZero { .. }
            | EngineError::Library(_) => ErrorKind::ProcessFailure,
            EngineError::ServerNotReady { .. } | EngineError::LoadTimeout(_) => ErrorKind::Timeout,
            EngineError::Http { .. }
            | EngineError::Request(_)
            | EngineError::Socket(_)
            | EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::LibraryUnavailable
            | EngineError::PortUnavailable
            | EngineError::Io(_) => ErrorKind::Resource,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
