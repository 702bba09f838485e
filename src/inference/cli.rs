//! llama.cpp CLI engine
//!
//! Runs one CLI process per generation. The prompt is followed by a sentinel
//! so the prompt echo and start-up noise can be filtered out of the stream.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::inference::filter::{
    clean_output, StreamingOutputFilter, Utf8Accumulator, OUTPUT_SENTINEL,
};
use crate::inference::process::{run_with_timeout, ProcessSupervisor};
use crate::inference::resolver::{ExecutableKind, ExecutableResolver, ResolverEnv};
use crate::inference::{
    validate_model_file, Engine, EngineError, EngineKind, GenerationRequest, TokenCallback,
};
use crate::system::gpu::{detect_acceleration, AccelerationInfo, HardwareProfile};

/// Quiet flags passed when the binary advertises them
///
/// `--no-display-prompt` is never passed: the prompt echo carries the
/// sentinel that marks where model output starts.
const QUIET_FLAGS: &[&str] = &["--simple-io", "--log-disable", "--log-verbosity"];

/// Deadline for the `--help` probe
const HELP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Path override from settings
    pub executable_override: Option<String>,
    pub gpu_layers: Option<u32>,
    pub ctx_size: Option<u32>,
    /// Run a one-token generation during load to surface model errors early
    pub preload: bool,
    pub load_timeout: Duration,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            executable_override: None,
            gpu_layers: None,
            ctx_size: None,
            preload: true,
            load_timeout: Duration::from_secs(60),
        }
    }
}

/// Flag spellings supported by a particular build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliFlags {
    pub token_flag: String,
    pub quiet_flags: Vec<String>,
}

impl CliFlags {
    /// Pick flags from `--help` output
    pub fn from_help(help: &str) -> Self {
        let token_flag = if help.contains("--n-predict") {
            "--n-predict"
        } else if help.contains("--max-tokens") {
            "--max-tokens"
        } else {
            "-n"
        };
        Self {
            token_flag: token_flag.to_string(),
            quiet_flags: QUIET_FLAGS
                .iter()
                .filter(|flag| help.contains(*flag))
                .map(|flag| flag.to_string())
                .collect(),
        }
    }

    /// Command-line arguments for the supported quiet flags
    pub fn quiet_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.quiet_flags.len() + 1);
        for flag in &self.quiet_flags {
            args.push(flag.clone());
            if flag == "--log-verbosity" {
                args.push("0".to_string());
            }
        }
        args
    }
}

#[derive(Debug, Clone)]
struct LoadedCli {
    executable: PathBuf,
    model: PathBuf,
    flags: CliFlags,
    acceleration: AccelerationInfo,
}

pub struct CliEngine {
    config: CliConfig,
    /// Fixed executable, bypassing resolution
    executable: Option<PathBuf>,
    flag_cache: HashMap<PathBuf, CliFlags>,
    supervisor: ProcessSupervisor,
    loaded: Option<LoadedCli>,
}

impl CliEngine {
    pub fn new(config: CliConfig) -> Self {
        Self {
            config,
            executable: None,
            flag_cache: HashMap::new(),
            supervisor: ProcessSupervisor::default(),
            loaded: None,
        }
    }

    /// Use `executable` instead of searching for one
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    async fn resolve_executable(&self) -> Result<PathBuf, EngineError> {
        if let Some(exe) = &self.executable {
            return Ok(exe.clone());
        }
        let env = ResolverEnv::from_process(
            ExecutableKind::Cli,
            self.config.executable_override.clone(),
        );
        Ok(ExecutableResolver::new(ExecutableKind::Cli, env)
            .resolve()
            .await?)
    }

    async fn probe_flags(&mut self, executable: &Path) -> CliFlags {
        if let Some(flags) = self.flag_cache.get(executable) {
            return flags.clone();
        }
        let mut help = String::new();
        for flag in ["--help", "-h"] {
            match run_with_timeout(executable, &[flag.to_string()], &[], HELP_PROBE_TIMEOUT).await {
                Ok(out) => help = out.combined(),
                Err(e) => tracing::debug!("{} {} failed: {}", executable.display(), flag, e),
            }
            if !help.trim().is_empty() {
                break;
            }
        }
        let flags = CliFlags::from_help(&help);
        tracing::debug!("CLI flags for {}: {:?}", executable.display(), flags);
        self.flag_cache
            .insert(executable.to_path_buf(), flags.clone());
        flags
    }

    fn profile(&self, acceleration: &AccelerationInfo) -> HardwareProfile {
        acceleration
            .profile()
            .with_overrides(self.config.gpu_layers, self.config.ctx_size)
    }

    async fn preload(&self, state: &LoadedCli) -> Result<(), EngineError> {
        let mut args = vec![
            "-m".to_string(),
            state.model.display().to_string(),
            "-p".to_string(),
            "test".to_string(),
            state.flags.token_flag.clone(),
            "1".to_string(),
        ];
        args.extend(state.flags.quiet_args());
        args.extend(self.profile(&state.acceleration).args());

        let out = run_with_timeout(
            &state.executable,
            &args,
            &state.acceleration.env(),
            self.config.load_timeout,
        )
        .await?;
        if !out.success() {
            return Err(EngineError::ProcessExitedNonZero {
                code: out.code,
                output: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn load_inner(&mut self, model_path: &Path) -> Result<LoadedCli, EngineError> {
        let executable = self.resolve_executable().await?;
        validate_model_file(model_path)?;
        let flags = self.probe_flags(&executable).await;
        let acceleration = detect_acceleration(&executable);
        tracing::info!(
            "CLI engine using {} (GPU acceleration {})",
            executable.display(),
            if acceleration.is_available() { "enabled" } else { "disabled" }
        );

        let state = LoadedCli {
            executable,
            model: model_path.to_path_buf(),
            flags,
            acceleration,
        };
        if self.config.preload {
            self.preload(&state).await?;
        }
        Ok(state)
    }
}

/// Arguments for one generation
pub fn generation_args(
    model: &Path,
    flags: &CliFlags,
    profile: &HardwareProfile,
    request: &GenerationRequest,
) -> Vec<String> {
    let params = request.params.validated();
    let prompt = format!("{}\n\n{}\n", request.combined_prompt(), OUTPUT_SENTINEL);

    let mut args = vec![
        "-m".to_string(),
        model.display().to_string(),
        "-p".to_string(),
        prompt,
        flags.token_flag.clone(),
        params.max_tokens.to_string(),
        "--temp".to_string(),
        params.temperature.to_string(),
        "--top-p".to_string(),
        params.top_p.to_string(),
    ];
    args.extend(flags.quiet_args());
    args.extend(profile.args());
    if let Some(seed) = params.seed {
        args.push("--seed".to_string());
        args.push(seed.to_string());
    }
    for stop in params.stop_sequences() {
        args.push("--stop".to_string());
        args.push(stop.to_string());
    }
    args
}

#[async_trait]
impl Engine for CliEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Cli
    }

    async fn load(
        &mut self,
        model_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.loaded = None;
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            res = self.load_inner(model_path) => res?,
        };
        tracing::info!("CLI engine ready for {}", state.model.display());
        self.loaded = Some(state);
        Ok(())
    }

    async fn generate(
        &mut self,
        request: &GenerationRequest,
        on_token: &mut TokenCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let state = self.loaded.clone().ok_or(EngineError::NoModelLoaded)?;
        let args = generation_args(
            &state.model,
            &state.flags,
            &self.profile(&state.acceleration),
            request,
        );

        let mut process = self
            .supervisor
            .spawn(&state.executable, &args, &state.acceleration.env())?;
        let Some(mut stdout) = process.take_stdout() else {
            process.terminate().await;
            return Err(EngineError::Protocol("CLI stdout unavailable".to_string()));
        };

        let mut filter = StreamingOutputFilter::default();
        let mut utf8 = Utf8Accumulator::new();
        let mut raw = String::new();
        let mut emitted = String::new();
        let mut buf = [0u8; 4096];
        let mut cancelled = false;

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                read = stdout.read(&mut buf) => read,
            };
            let (text, done) = match read {
                Ok(0) => (utf8.finish(), true),
                Ok(n) => (utf8.push(&buf[..n]), false),
                Err(e) => {
                    tracing::warn!("Error reading CLI output: {}", e);
                    (utf8.finish(), true)
                }
            };
            raw.push_str(&text);
            if let Some(out) = filter.process(&text) {
                on_token(&out);
                emitted.push_str(&out);
            }
            if done {
                break;
            }
        }

        if cancelled {
            process.terminate().await;
            tracing::debug!("CLI generation cancelled");
            return Ok(clean_output(&emitted, OUTPUT_SENTINEL));
        }

        let code = process.wait_exit_code().await?;
        if code != Some(0) {
            let mut output = process.stderr_text().trim().to_string();
            if !filter.is_open() && !raw.trim().is_empty() {
                output = format!("{}\n{}", output, raw.trim());
            }
            tracing::error!("CLI exited with {:?}: {}", code, output);
            return Err(EngineError::ProcessExitedNonZero { code, output });
        }

        if !filter.is_open() {
            tracing::error!("CLI output never reached the sentinel: {}", raw.trim());
            return Err(EngineError::Protocol(format!(
                "sentinel {} not found in CLI output",
                OUTPUT_SENTINEL
            )));
        }

        Ok(clean_output(&emitted, OUTPUT_SENTINEL))
    }

    async fn unload(&mut self) {
        self.loaded = None;
    }
}
