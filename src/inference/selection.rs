//! Engine selection
//!
//! Decides which engine variant to run from facts probed once at startup,
//! then builds it from the user's settings.

use std::path::PathBuf;
use std::time::Duration;

use crate::inference::cli::{CliConfig, CliEngine};
use crate::inference::library::{library_compiled, LibraryEngine};
use crate::inference::mock::{MockEngine, DEFAULT_TOKEN_DELAY};
use crate::inference::resolver::{ExecutableKind, ExecutableResolver, ResolverEnv};
use crate::inference::server::{ServerConfig, ServerEngine};
use crate::inference::{EngineKind, InferenceEngine};
use crate::storage::settings::AppSettings;

/// Everything needed to construct any engine variant
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cli: CliConfig,
    pub server: ServerConfig,
    pub socket_path: PathBuf,
    pub load_timeout: Duration,
    pub mock_token_delay: Duration,
}

impl EngineConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            cli: CliConfig {
                executable_override: settings.cli_path.clone(),
                gpu_layers: settings.gpu_layers,
                ctx_size: settings.ctx_size,
                preload: settings.preload_model,
                load_timeout: settings.load_timeout(),
            },
            server: ServerConfig {
                executable_override: settings.server_path.clone(),
                port: None,
                gpu_layers: settings.gpu_layers,
                ctx_size: settings.ctx_size,
                readiness_timeout: settings.readiness_timeout(),
            },
            socket_path: settings.socket_path.clone(),
            load_timeout: settings.load_timeout(),
            mock_token_delay: DEFAULT_TOKEN_DELAY,
        }
    }
}

/// Probed environment that drives [`select_engine`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvironmentFacts {
    pub test_mode: bool,
    pub preferred: Option<EngineKind>,
    pub socket_present: bool,
    pub server_available: bool,
    pub library_available: bool,
}

impl EnvironmentFacts {
    /// Inspect the machine: socket file, server binary, compiled-in library
    pub async fn probe(settings: &AppSettings) -> Self {
        let socket_present = cfg!(unix) && settings.socket_path.exists();
        let env = ResolverEnv::from_process(ExecutableKind::Server, settings.server_path.clone());
        let server_available = match ExecutableResolver::new(ExecutableKind::Server, env)
            .resolve()
            .await
        {
            Ok(path) => {
                tracing::debug!("llama-server available at {}", path.display());
                true
            }
            Err(e) => {
                tracing::debug!("llama-server not available: {}", e);
                false
            }
        };

        let facts = Self {
            test_mode: settings.test_mode,
            preferred: settings.preferred_engine(),
            socket_present,
            server_available,
            library_available: library_compiled(),
        };
        tracing::debug!("Environment facts: {:?}", facts);
        facts
    }

    /// Whether `kind` has what it needs to run here
    pub fn supports(&self, kind: EngineKind) -> bool {
        match kind {
            EngineKind::Mock | EngineKind::Cli => true,
            EngineKind::Library => self.library_available,
            EngineKind::Server => self.server_available,
            EngineKind::Socket => self.socket_present,
        }
    }
}

/// Pick the engine variant for these facts
///
/// An explicit preference wins when its prerequisite is present. Otherwise:
/// test mode, then helper socket, then server binary, then the CLI.
pub fn select_engine(facts: &EnvironmentFacts) -> EngineKind {
    if let Some(preferred) = facts.preferred {
        if facts.supports(preferred) {
            return preferred;
        }
        tracing::warn!(
            "Preferred engine '{}' is unavailable, selecting automatically",
            preferred
        );
    }

    if facts.test_mode {
        EngineKind::Mock
    } else if facts.socket_present {
        EngineKind::Socket
    } else if facts.server_available {
        EngineKind::Server
    } else {
        EngineKind::Cli
    }
}

/// Construct the engine for `kind`
pub fn build_engine(kind: EngineKind, config: &EngineConfig) -> InferenceEngine {
    tracing::info!("Using {} engine", kind);
    match kind {
        EngineKind::Mock => InferenceEngine::Mock(MockEngine::new(config.mock_token_delay)),
        EngineKind::Library => {
            InferenceEngine::Library(LibraryEngine::with_default_library(config.load_timeout))
        }
        EngineKind::Cli => InferenceEngine::Cli(CliEngine::new(config.cli.clone())),
        EngineKind::Server => InferenceEngine::Server(ServerEngine::new(config.server.clone())),
        #[cfg(unix)]
        EngineKind::Socket => InferenceEngine::Socket(crate::inference::socket::SocketEngine::new(
            config.socket_path.clone(),
        )),
        #[cfg(not(unix))]
        EngineKind::Socket => {
            tracing::warn!("Socket engine needs Unix domain sockets, using the CLI");
            InferenceEngine::Cli(CliEngine::new(config.cli.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::Engine;

    fn facts() -> EnvironmentFacts {
        EnvironmentFacts::default()
    }

    #[test]
    fn test_automatic_order() {
        assert_eq!(select_engine(&facts()), EngineKind::Cli);

        let with_server = EnvironmentFacts {
            server_available: true,
            ..facts()
        };
        assert_eq!(select_engine(&with_server), EngineKind::Server);

        let with_socket = EnvironmentFacts {
            socket_present: true,
            ..with_server
        };
        assert_eq!(select_engine(&with_socket), EngineKind::Socket);

        let test_mode = EnvironmentFacts {
            test_mode: true,
            ..with_socket
        };
        assert_eq!(select_engine(&test_mode), EngineKind::Mock);
    }

    #[test]
    fn test_library_only_when_preferred() {
        let available = EnvironmentFacts {
            library_available: true,
            ..facts()
        };
        assert_eq!(select_engine(&available), EngineKind::Cli);

        let preferred = EnvironmentFacts {
            preferred: Some(EngineKind::Library),
            ..available
        };
        assert_eq!(select_engine(&preferred), EngineKind::Library);
    }

    #[test]
    fn test_unavailable_preference_falls_back() {
        let facts = EnvironmentFacts {
            preferred: Some(EngineKind::Server),
            socket_present: true,
            ..facts()
        };
        assert_eq!(select_engine(&facts), EngineKind::Socket);

        let facts = EnvironmentFacts {
            preferred: Some(EngineKind::Cli),
            test_mode: true,
            ..facts
        };
        assert_eq!(select_engine(&facts), EngineKind::Cli);
    }

    #[test]
    fn test_build_engine_kind() {
        let config = EngineConfig::from_settings(&AppSettings::default());
        for kind in [EngineKind::Mock, EngineKind::Cli, EngineKind::Server] {
            assert_eq!(build_engine(kind, &config).kind(), kind);
        }
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = AppSettings::default();
        settings.cli_path = Some("/opt/llama/llama-cli".to_string());
        settings.gpu_layers = Some(12);
        settings.preload_model = false;
        settings.server_readiness_timeout_secs = 30;

        let config = EngineConfig::from_settings(&settings);
        assert_eq!(config.cli.executable_override.as_deref(), Some("/opt/llama/llama-cli"));
        assert_eq!(config.cli.gpu_layers, Some(12));
        assert!(!config.cli.preload);
        assert_eq!(config.server.gpu_layers, Some(12));
        assert_eq!(config.server.readiness_timeout, Duration::from_secs(30));
    }
}
