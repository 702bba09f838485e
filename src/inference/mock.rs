//! Mock engine
//!
//! Echoes the prompt back word by word with a fixed delay. Used in test mode
//! and by the coordinator tests; never touches the disk or a subprocess.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::inference::{Engine, EngineError, EngineKind, GenerationRequest, TokenCallback};

/// Delay between emitted words
pub const DEFAULT_TOKEN_DELAY: Duration = Duration::from_millis(60);

/// Call counters shared with tests
#[derive(Debug, Default)]
pub struct MockStats {
    pub loads: AtomicUsize,
    pub generations: AtomicUsize,
}

impl MockStats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockEngine {
    token_delay: Duration,
    load_delay: Duration,
    loaded: Option<PathBuf>,
    /// Remaining loads that fail before one succeeds
    failing_loads: usize,
    /// Fail generation after this many tokens
    fail_after: Option<usize>,
    stats: Arc<MockStats>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_DELAY)
    }
}

impl MockEngine {
    pub fn new(token_delay: Duration) -> Self {
        Self {
            token_delay,
            load_delay: Duration::ZERO,
            loaded: None,
            failing_loads: 0,
            fail_after: None,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Make loads take `delay`
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Fail the next `count` loads
    pub fn with_failing_loads(mut self, count: usize) -> Self {
        self.failing_loads = count;
        self
    }

    /// Fail every generation after emitting `tokens` tokens
    pub fn with_generation_failure_after(mut self, tokens: usize) -> Self {
        self.fail_after = Some(tokens);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    pub fn loaded_model(&self) -> Option<&Path> {
        self.loaded.as_deref()
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Mock
    }

    async fn load(
        &mut self,
        model_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        self.loaded = None;

        if !self.load_delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.load_delay) => {}
            }
        }

        if self.failing_loads > 0 {
            self.failing_loads -= 1;
            return Err(EngineError::ProcessExitedNonZero {
                code: Some(1),
                output: format!("mock load failure for {}", model_path.display()),
            });
        }

        tracing::debug!("Mock engine loaded {}", model_path.display());
        self.loaded = Some(model_path.to_path_buf());
        Ok(())
    }

    async fn generate(
        &mut self,
        request: &GenerationRequest,
        on_token: &mut TokenCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        self.stats.generations.fetch_add(1, Ordering::SeqCst);

        let combined = request.combined_prompt();
        let limit = request.params.max_tokens.max(1) as usize;
        let mut output = String::new();

        for (i, word) in combined.split_whitespace().take(limit).enumerate() {
            if self.fail_after == Some(i) {
                return Err(EngineError::Protocol("mock generation failure".to_string()));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Mock generation cancelled after {} tokens", i);
                    return Ok(output);
                }
                _ = tokio::time::sleep(self.token_delay) => {}
            }

            let token = if i == 0 {
                word.to_string()
            } else {
                format!(" {}", word)
            };
            on_token(&token);
            output.push_str(&token);
        }

        Ok(output)
    }

    async fn unload(&mut self) {
        self.loaded = None;
    }
}
