//! Helper socket engine
//!
//! Delegates generation to a long-running helper process over a Unix domain
//! socket. One connection per generation; requests and events are
//! newline-delimited JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::inference::{
    Engine, EngineError, EngineKind, GenerationRequest, TokenCallback, DEFAULT_SOCKET_PATH,
};

/// How long a cancel waits for `chat_started` when no job id is known yet
const JOBID_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum HelperRequest<'a> {
    StartChat {
        prompt: &'a str,
        tokens: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seed: Option<i64>,
    },
    Cancel {
        jobid: &'a str,
    },
}

/// One line from the helper, loosely typed
#[derive(Debug, Default, Deserialize)]
struct HelperLine {
    #[serde(default)]
    op: String,
    #[serde(default)]
    jobid: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, PartialEq)]
enum HelperEvent {
    Started(String),
    Token(String),
    Done,
    Error(String),
    Ignored,
}

impl HelperEvent {
    fn parse(line: &str) -> Self {
        let parsed = serde_json::from_str::<HelperLine>(line).unwrap_or_else(|_| scan_fields(line));
        match parsed.op.as_str() {
            "chat_started" => match parsed.jobid {
                Some(jobid) => HelperEvent::Started(jobid),
                None => HelperEvent::Ignored,
            },
            "token" => HelperEvent::Token(parsed.data.unwrap_or_default()),
            "done" => HelperEvent::Done,
            "error" => HelperEvent::Error(
                parsed
                    .error
                    .or(parsed.message)
                    .unwrap_or_else(|| line.to_string()),
            ),
            _ => HelperEvent::Ignored,
        }
    }
}

/// Pull `"key":"value"` pairs out of a line that isn't valid JSON
fn scan_fields(line: &str) -> HelperLine {
    HelperLine {
        op: scan_string(line, "op").unwrap_or_default(),
        jobid: scan_string(line, "jobid"),
        data: scan_string(line, "data"),
        error: scan_string(line, "error"),
        message: scan_string(line, "message"),
    }
}

fn scan_string(line: &str, key: &str) -> Option<String> {
    let marker = format!("\"{}\":\"", key);
    let start = line.find(&marker)? + marker.len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[derive(Debug)]
pub struct SocketEngine {
    socket_path: PathBuf,
    model_path: Option<PathBuf>,
}

impl Default for SocketEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}

impl SocketEngine {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            model_path: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn write_line(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    request: &HelperRequest<'_>,
) -> Result<(), EngineError> {
    let mut line = serde_json::to_string(request).map_err(|e| EngineError::Socket(e.to_string()))?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| EngineError::Socket(format!("write failed: {}", e)))
}

#[async_trait]
impl Engine for SocketEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Socket
    }

    async fn load(
        &mut self,
        model_path: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        // The helper loads the model itself on each request
        if !model_path.is_file() {
            return Err(EngineError::ModelNotFound(model_path.to_path_buf()));
        }
        self.model_path = Some(model_path.to_path_buf());
        Ok(())
    }

    async fn generate(
        &mut self,
        request: &GenerationRequest,
        on_token: &mut TokenCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(String::new()),
            res = UnixStream::connect(&self.socket_path) => res.map_err(|e| {
                let path = self.socket_path.display();
                EngineError::Socket(format!("connect to {} failed: {}", path, e))
            })?,
        };
        let (reader, mut writer) = stream.into_split();

        let params = request.params.validated();
        let prompt = request.combined_prompt();
        write_line(
            &mut writer,
            &HelperRequest::StartChat {
                prompt: &prompt,
                tokens: params.max_tokens,
                model_path: self.model_path.as_ref().map(|p| p.display().to_string()),
                seed: params.seed,
            },
        )
        .await?;

        let mut lines = BufReader::new(reader).lines();
        let mut jobid: Option<String> = None;
        let mut output = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                line = lines.next_line() => Some(line),
            };
            let Some(line) = next else {
                let id = match jobid {
                    Some(id) => Some(id),
                    None => wait_for_jobid(&mut lines, JOBID_WAIT).await,
                };
                match id {
                    Some(id) => {
                        tracing::debug!("Cancelling helper job {}", id);
                        let cancel_job = HelperRequest::Cancel { jobid: &id };
                        if let Err(e) = write_line(&mut writer, &cancel_job).await {
                            tracing::warn!("Failed to send cancel: {}", e);
                        }
                    }
                    None => tracing::warn!("Helper never reported a job id; cannot cancel"),
                }
                return Ok(output);
            };
            let Some(line) =
                line.map_err(|e| EngineError::Socket(format!("read failed: {}", e)))?
            else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            match HelperEvent::parse(&line) {
                HelperEvent::Started(id) => {
                    tracing::debug!("Helper job started: {}", id);
                    jobid = Some(id);
                }
                HelperEvent::Token(data) => {
                    if !data.is_empty() {
                        on_token(&data);
                        output.push_str(&data);
                    }
                }
                HelperEvent::Done => break,
                HelperEvent::Error(message) => {
                    tracing::error!("Helper error: {}", message);
                    return Err(EngineError::Socket(message));
                }
                HelperEvent::Ignored => tracing::trace!("Ignoring helper line: {}", line),
            }
        }

        Ok(output)
    }

    async fn unload(&mut self) {
        self.model_path = None;
    }
}

/// Read events until the helper reports a job id, for at most `limit`
async fn wait_for_jobid<R>(lines: &mut Lines<R>, limit: Duration) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let wait = async {
        while let Ok(Some(line)) = lines.next_line().await {
            match HelperEvent::parse(&line) {
                HelperEvent::Started(id) => return Some(id),
                HelperEvent::Done | HelperEvent::Error(_) => return None,
                HelperEvent::Token(_) | HelperEvent::Ignored => {}
            }
        }
        None
    };
    tokio::time::timeout(limit, wait).await.ok().flatten()
}
