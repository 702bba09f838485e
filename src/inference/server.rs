//! llama.cpp server engine
//!
//! Keeps one `llama-server` process per loaded model on a local port and
//! talks to its `/completion` endpoint. Completions are requested
//! non-streaming, so the token callback fires once with the full text.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::inference::port::pick_free_port;
use crate::inference::process::{ProcessHandle, ProcessSupervisor};
use crate::inference::resolver::{ExecutableKind, ExecutableResolver, ResolverEnv};
use crate::inference::{
    validate_model_file, Engine, EngineError, EngineKind, GenerationRequest, TokenCallback,
};
use crate::system::gpu::detect_acceleration;

/// Default deadline for the server to answer health checks
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(12);

const HEALTH_PATHS: &[&str] = &["/health", "/healthz"];
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path override from settings
    pub executable_override: Option<String>,
    /// Fixed port instead of an ephemeral one
    pub port: Option<u16>,
    pub gpu_layers: Option<u32>,
    pub ctx_size: Option<u32>,
    pub readiness_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable_override: None,
            port: None,
            gpu_layers: None,
            ctx_size: None,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }
}

// ============================================================================
// HTTP client
// ============================================================================

/// Body of `POST /completion`
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<&'a str>,
}

/// Client for a llama-server instance
#[derive(Debug, Clone)]
pub struct LlamaServerClient {
    client: reqwest::Client,
    base_url: String,
}

impl LlamaServerClient {
    pub fn with_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn with_port(port: u16) -> Self {
        Self::with_url(format!("http://127.0.0.1:{}", port))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// True when any health endpoint answers with a success status
    pub async fn check_health(&self) -> bool {
        for path in HEALTH_PATHS {
            let url = format!("{}{}", self.base_url, path);
            match self
                .client
                .get(&url)
                .timeout(HEALTH_REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => tracing::debug!("{} -> {}", url, resp.status()),
                Err(e) => tracing::trace!("{} -> {}", url, e),
            }
        }
        false
    }

    /// One-token completion, used when health endpoints are missing
    pub async fn probe_completion(&self, timeout: Duration) -> bool {
        let url = format!("{}/completion", self.base_url);
        let body = serde_json::json!({"prompt": "hi", "n_predict": 1});
        matches!(
            self.client.post(&url).json(&body).timeout(timeout).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    /// Run a non-streaming completion and extract its text
    pub async fn complete(&self, request: &GenerationRequest) -> Result<String, EngineError> {
        let params = request.params.validated();
        let prompt = request.combined_prompt();
        let body = CompletionRequest {
            prompt: &prompt,
            n_predict: params.max_tokens.max(1),
            temperature: params.temperature,
            top_p: params.top_p,
            seed: params.seed,
            stop: params.stop_sequences().collect(),
        };

        let url = format!("{}/completion", self.base_url);
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if status.as_u16() != 200 {
            return Err(EngineError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(parse_completion(&text))
    }
}

/// Extract generated text from a completion response body.
///
/// Accepts `{"content"}`, `{"choices":[{"text"}]}` and `{"data":[{"text"}]}`
/// shapes; anything else is returned verbatim.
pub fn parse_completion(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    if let Some(content) = value.get("content").and_then(Value::as_str) {
        return content.to_string();
    }
    if let Some(text) = value
        .pointer("/choices/0/text")
        .and_then(Value::as_str)
    {
        return text.to_string();
    }
    if let Some(items) = value.get("data").and_then(Value::as_array) {
        let texts: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.concat();
        }
    }
    body.to_string()
}

// ============================================================================
// Engine
// ============================================================================

struct RunningServer {
    process: ProcessHandle,
    client: LlamaServerClient,
    model: PathBuf,
}

pub struct ServerEngine {
    config: ServerConfig,
    executable: Option<PathBuf>,
    supervisor: ProcessSupervisor,
    running: Option<RunningServer>,
}

impl ServerEngine {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            executable: None,
            supervisor: ProcessSupervisor::default(),
            running: None,
        }
    }

    /// Use `executable` instead of searching for one
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    /// Base URL of the running server
    pub fn base_url(&self) -> Option<&str> {
        self.running.as_ref().map(|r| r.client.base_url())
    }

    async fn resolve_executable(&self) -> Result<PathBuf, EngineError> {
        if let Some(exe) = &self.executable {
            return Ok(exe.clone());
        }
        let env = ResolverEnv::from_process(
            ExecutableKind::Server,
            self.config.executable_override.clone(),
        );
        Ok(ExecutableResolver::new(ExecutableKind::Server, env)
            .resolve()
            .await?)
    }

    async fn stop_running(&mut self) {
        if let Some(mut running) = self.running.take() {
            tracing::info!("Stopping server for {}", running.model.display());
            running.process.terminate().await;
        }
    }

    async fn start(
        &self,
        model_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunningServer, EngineError> {
        let executable = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            res = self.resolve_executable() => res?,
        };
        validate_model_file(model_path)?;

        let port = match self.config.port {
            Some(port) => port,
            None => pick_free_port().ok_or(EngineError::PortUnavailable)?,
        };
        let acceleration = detect_acceleration(&executable);
        let profile = acceleration
            .profile()
            .with_overrides(self.config.gpu_layers, self.config.ctx_size);

        let mut args = vec![
            "-m".to_string(),
            model_path.display().to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        args.extend(profile.args());

        let mut process = self
            .supervisor
            .spawn(&executable, &args, &acceleration.env())?;
        let client = LlamaServerClient::with_port(port);

        match wait_ready(&mut process, &client, self.config.readiness_timeout, cancel).await {
            Ok(()) => {
                tracing::info!("llama-server ready on {}", client.base_url());
                Ok(RunningServer {
                    process,
                    client,
                    model: model_path.to_path_buf(),
                })
            }
            Err(e) => {
                process.terminate().await;
                Err(e)
            }
        }
    }
}

/// Poll health endpoints until the server answers, it dies, or `timeout` elapses
async fn wait_ready(
    process: &mut ProcessHandle,
    client: &LlamaServerClient,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let deadline = Instant::now() + timeout;
    tracing::info!("Waiting for llama-server to become ready...");

    loop {
        if !process.is_running() {
            let code = process.wait_exit_code().await?;
            return Err(EngineError::ProcessExitedNonZero {
                code,
                output: process.stderr_text().trim().to_string(),
            });
        }

        let healthy = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            ok = client.check_health() => ok,
        };
        if healthy {
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
        }
    }

    tracing::warn!("Health checks failed, trying a minimal completion");
    let probed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        ok = client.probe_completion(timeout / 2) => ok,
    };
    if probed && process.is_running() {
        return Ok(());
    }
    Err(EngineError::ServerNotReady { timeout })
}

#[async_trait]
impl Engine for ServerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Server
    }

    async fn load(
        &mut self,
        model_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.stop_running().await;
        let running = self.start(model_path, cancel).await?;
        self.running = Some(running);
        Ok(())
    }

    async fn generate(
        &mut self,
        request: &GenerationRequest,
        on_token: &mut TokenCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let running = self.running.as_mut().ok_or(EngineError::NoModelLoaded)?;
        if !running.process.is_running() {
            let code = running.process.wait_exit_code().await?;
            let output = running.process.stderr_text().trim().to_string();
            self.running = None;
            return Err(EngineError::ProcessExitedNonZero { code, output });
        }

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Server generation cancelled");
                return Ok(String::new());
            }
            res = running.client.complete(request) => res?,
        };
        if !text.is_empty() {
            on_token(&text);
        }
        Ok(text)
    }

    async fn unload(&mut self) {
        self.stop_running().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GenerationParams;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 responder: health endpoints answer `health_status`,
    /// `/completion` answers `completion` and records request bodies.
    struct FakeServer {
        port: u16,
        bodies: Arc<Mutex<Vec<String>>>,
    }

    async fn fake_server(health_status: u16, completion_status: u16, completion: &str) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&bodies);
        let completion = completion.to_string();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let recorded = Arc::clone(&recorded);
                let completion = completion.clone();
                tokio::spawn(async move {
                    let mut data = Vec::new();
                    let mut buf = [0u8; 4096];
                    let (head_end, content_length) = loop {
                        let n = stream.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        data.extend_from_slice(&buf[..n]);
                        let text = String::from_utf8_lossy(&data).to_string();
                        if let Some(idx) = text.find("\r\n\r\n") {
                            let length = text[..idx]
                                .lines()
                                .find_map(|l| {
                                    let lower = l.to_ascii_lowercase();
                                    lower
                                        .strip_prefix("content-length:")
                                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                                })
                                .unwrap_or(0);
                            break (idx + 4, length);
                        }
                    };
                    while data.len() < head_end + content_length {
                        let n = stream.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        data.extend_from_slice(&buf[..n]);
                    }

                    let text = String::from_utf8_lossy(&data).to_string();
                    let path = text.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = if path.starts_with("/health") {
                        (health_status, "{\"status\":\"ok\"}".to_string())
                    } else if path == "/completion" {
                        recorded.lock().unwrap().push(text[head_end..].to_string());
                        (completion_status, completion)
                    } else {
                        (404, "not found".to_string())
                    };
                    let response = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        FakeServer { port, bodies }
    }

    #[test]
    fn test_parse_completion_shapes() {
        assert_eq!(parse_completion(r#"{"content":"Hello"}"#), "Hello");
        assert_eq!(
            parse_completion(r#"{"choices":[{"text":"From choices"}]}"#),
            "From choices"
        );
        assert_eq!(
            parse_completion(r#"{"data":[{"text":"a"},{"text":"b"}]}"#),
            "ab"
        );
        assert_eq!(parse_completion("plain text"), "plain text");
        assert_eq!(parse_completion(r#"{"other":1}"#), r#"{"other":1}"#);
    }

    #[tokio::test]
    async fn test_client_complete_sends_params() {
        let server = fake_server(200, 200, r#"{"content":"Hi there"}"#).await;
        let client = LlamaServerClient::with_port(server.port);
        assert!(client.check_health().await);

        let request = GenerationRequest::new(
            "Hello",
            GenerationParams {
                max_tokens: 0,
                seed: Some(3),
                stop: Some(vec!["\n\n".to_string()]),
                ..GenerationParams::default()
            },
        );
        assert_eq!(client.complete(&request).await.unwrap(), "Hi there");

        let bodies = server.bodies.lock().unwrap().clone();
        let body: Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(body["prompt"], "Hello");
        assert_eq!(body["n_predict"], 1);
        assert_eq!(body["seed"], 3);
        assert_eq!(body["stop"][0], "\n\n");
    }

    #[tokio::test]
    async fn test_client_http_error() {
        let server = fake_server(200, 500, "model crashed").await;
        let client = LlamaServerClient::with_port(server.port);
        let err = client
            .complete(&GenerationRequest::new("x", GenerationParams::default()))
            .await
            .unwrap_err();
        match err {
            EngineError::Http { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "model crashed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("llama-server");
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn model(dir: &tempfile::TempDir) -> PathBuf {
            let path = dir.path().join("model.gguf");
            std::fs::write(&path, b"GGUF\x03\x00\x00\x00").unwrap();
            path
        }

        #[tokio::test]
        async fn test_load_and_generate_against_ready_server() {
            let dir = tempfile::tempdir().unwrap();
            let server = fake_server(200, 200, r#"{"content":"Streaming is one shot"}"#).await;
            let mut engine = ServerEngine::new(ServerConfig {
                port: Some(server.port),
                ..ServerConfig::default()
            })
            .with_executable(script(&dir, "#!/bin/sh\nexec sleep 30\n"));

            let cancel = CancellationToken::new();
            engine.load(&model(&dir), &cancel).await.unwrap();
            assert!(engine.base_url().is_some());

            let mut calls = Vec::new();
            let out = engine
                .generate(
                    &GenerationRequest::new("q", GenerationParams::default()),
                    &mut |t: &str| calls.push(t.to_string()),
                    &cancel,
                )
                .await
                .unwrap();
            assert_eq!(out, "Streaming is one shot");
            assert_eq!(calls, vec!["Streaming is one shot"]);

            engine.unload().await;
            assert!(engine.base_url().is_none());
        }

        #[tokio::test]
        async fn test_server_exiting_early_fails_fast() {
            let dir = tempfile::tempdir().unwrap();
            let mut engine = ServerEngine::new(ServerConfig::default()).with_executable(script(
                &dir,
                "#!/bin/sh\necho 'error: unknown model architecture' 1>&2\nexit 1\n",
            ));
            let started = Instant::now();
            let err = engine
                .load(&model(&dir), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(started.elapsed() < DEFAULT_READINESS_TIMEOUT);
            match err {
                EngineError::ProcessExitedNonZero { code, output } => {
                    assert_eq!(code, Some(1));
                    assert!(output.contains("unknown model architecture"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_readiness_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let mut engine = ServerEngine::new(ServerConfig {
                readiness_timeout: Duration::from_millis(600),
                ..ServerConfig::default()
            })
            .with_executable(script(&dir, "#!/bin/sh\nexec sleep 30\n"));
            let err = engine
                .load(&model(&dir), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::ServerNotReady { .. }));
            assert!(engine.base_url().is_none());
        }

        #[tokio::test]
        async fn test_cancelled_load() {
            let dir = tempfile::tempdir().unwrap();
            let mut engine = ServerEngine::new(ServerConfig::default())
                .with_executable(script(&dir, "#!/bin/sh\nexec sleep 30\n"));
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                trigger.cancel();
            });
            let started = Instant::now();
            let err = engine.load(&model(&dir), &cancel).await.unwrap_err();
            assert!(err.is_cancelled());
            assert!(started.elapsed() < Duration::from_secs(5));
        }
    }
}
