//! LLM inference engines
//!
//! A closed set of engine variants behind one streaming contract: load a
//! model, then generate text while reporting incremental tokens and honouring
//! cancellation at every suspension point.

pub mod cli;
pub mod error;
pub mod filter;
pub mod library;
#[cfg(feature = "llama")]
pub mod llama;
pub mod mock;
pub mod port;
pub mod process;
pub mod provision;
pub mod resolver;
pub mod selection;
pub mod server;
#[cfg(unix)]
pub mod socket;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use error::{EngineError, ErrorKind};
pub use selection::{build_engine, select_engine, EngineConfig, EnvironmentFacts};

use crate::types::GenerationParams;

/// Receives incremental text, in generation order
pub type TokenCallback<'a> = dyn FnMut(&str) + Send + 'a;

/// Where the helper process listens by default
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/intperint.sock";

/// One generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            params,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// System prompt and prompt joined by a newline (prompt alone when no system prompt)
    pub fn combined_prompt(&self) -> String {
        match self.system_prompt.as_deref().map(str::trim) {
            Some(system) if !system.is_empty() => format!("{}\n{}", system, self.prompt),
            _ => self.prompt.clone(),
        }
    }
}

/// Engine variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Mock,
    Library,
    Cli,
    Server,
    Socket,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::Mock => "mock",
            EngineKind::Library => "library",
            EngineKind::Cli => "cli",
            EngineKind::Server => "server",
            EngineKind::Socket => "socket",
        };
        f.write_str(name)
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(EngineKind::Mock),
            "library" | "lib" => Ok(EngineKind::Library),
            "cli" => Ok(EngineKind::Cli),
            "server" => Ok(EngineKind::Server),
            "socket" | "uds" => Ok(EngineKind::Socket),
            other => Err(format!("unknown engine: {}", other)),
        }
    }
}

/// Streaming inference contract shared by every variant
///
/// `generate` treats cancellation as normal completion and returns the text
/// produced so far. `load` returns [`EngineError::Cancelled`] when cancelled.
#[async_trait]
pub trait Engine: Send {
    fn kind(&self) -> EngineKind;

    async fn load(&mut self, model_path: &Path, cancel: &CancellationToken)
        -> Result<(), EngineError>;

    async fn generate(
        &mut self,
        request: &GenerationRequest,
        on_token: &mut TokenCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError>;

    /// Release the model and any external process
    async fn unload(&mut self) {}
}

/// The closed set of engine variants
pub enum InferenceEngine {
    Mock(mock::MockEngine),
    Library(library::LibraryEngine),
    Cli(cli::CliEngine),
    Server(server::ServerEngine),
    #[cfg(unix)]
    Socket(socket::SocketEngine),
}

impl InferenceEngine {
    fn inner(&mut self) -> &mut dyn Engine {
        match self {
            InferenceEngine::Mock(e) => e,
            InferenceEngine::Library(e) => e,
            InferenceEngine::Cli(e) => e,
            InferenceEngine::Server(e) => e,
            #[cfg(unix)]
            InferenceEngine::Socket(e) => e,
        }
    }
}

impl fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InferenceEngine({})", self.kind())
    }
}

#[async_trait]
impl Engine for InferenceEngine {
    fn kind(&self) -> EngineKind {
        match self {
            InferenceEngine::Mock(_) => EngineKind::Mock,
            InferenceEngine::Library(_) => EngineKind::Library,
            InferenceEngine::Cli(_) => EngineKind::Cli,
            InferenceEngine::Server(_) => EngineKind::Server,
            #[cfg(unix)]
            InferenceEngine::Socket(_) => EngineKind::Socket,
        }
    }

    async fn load(
        &mut self,
        model_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.inner().load(model_path, cancel).await
    }

    async fn generate(
        &mut self,
        request: &GenerationRequest,
        on_token: &mut TokenCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        self.inner().generate(request, on_token, cancel).await
    }

    async fn unload(&mut self) {
        self.inner().unload().await
    }
}

/// Check the model file exists and starts with the GGUF magic
pub fn validate_model_file(path: &Path) -> Result<(), EngineError> {
    use std::io::Read;

    if !path.is_file() {
        return Err(EngineError::ModelNotFound(path.to_path_buf()));
    }
    let mut magic = [0u8; 4];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| EngineError::InvalidModel {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if &magic != b"GGUF" {
        return Err(EngineError::InvalidModel {
            path: path.to_path_buf(),
            reason: "missing GGUF magic".to_string(),
        });
    }
    Ok(())
}
