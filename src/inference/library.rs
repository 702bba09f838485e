//! Native library engine
//!
//! Drives an in-process inference library through a blocking interface on
//! tokio's blocking pool. The library returns whole completions, so streaming
//! is emulated by re-emitting the text word by word.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::inference::{
    validate_model_file, Engine, EngineError, EngineKind, GenerationRequest, TokenCallback,
};
use crate::types::GenerationParams;

/// Deadline for a native model load
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Blocking binding to a native inference library
pub trait NativeLibrary: Send + Sync + 'static {
    fn load(&self, model_path: &Path) -> Result<(), String>;

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, String>;

    fn unload(&self) {}
}

pub struct LibraryEngine {
    library: Option<Arc<dyn NativeLibrary>>,
    load_timeout: Duration,
    loaded: Option<PathBuf>,
}

impl std::fmt::Debug for LibraryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryEngine")
            .field("available", &self.library.is_some())
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl LibraryEngine {
    pub fn new(library: Option<Arc<dyn NativeLibrary>>, load_timeout: Duration) -> Self {
        Self {
            library,
            load_timeout,
            loaded: None,
        }
    }

    /// Engine over the library compiled into this build, if any
    pub fn with_default_library(load_timeout: Duration) -> Self {
        Self::new(default_library(), load_timeout)
    }

    fn library(&self) -> Result<Arc<dyn NativeLibrary>, EngineError> {
        self.library
            .as_ref()
            .map(Arc::clone)
            .ok_or(EngineError::LibraryUnavailable)
    }
}

/// Whether a native library is compiled into this build
pub fn library_compiled() -> bool {
    cfg!(feature = "llama")
}

#[cfg(feature = "llama")]
fn default_library() -> Option<Arc<dyn NativeLibrary>> {
    match crate::inference::llama::LlamaLibrary::start() {
        Ok(lib) => Some(Arc::new(lib)),
        Err(e) => {
            tracing::warn!("llama.cpp library unavailable: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "llama"))]
fn default_library() -> Option<Arc<dyn NativeLibrary>> {
    None
}

#[async_trait]
impl Engine for LibraryEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Library
    }

    async fn load(
        &mut self,
        model_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let library = self.library()?;
        validate_model_file(model_path)?;
        self.loaded = None;

        let path = model_path.to_path_buf();
        let task = tokio::task::spawn_blocking(move || library.load(&path));

        // The blocking call can't be interrupted; on timeout or cancel it is left to finish
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            res = tokio::time::timeout(self.load_timeout, task) => res,
        };
        match joined {
            Err(_) => {
                tracing::warn!("Native load of {} timed out", model_path.display());
                Err(EngineError::LoadTimeout(self.load_timeout))
            }
            Ok(Err(join)) => Err(EngineError::Library(join.to_string())),
            Ok(Ok(Err(e))) => Err(EngineError::Library(e)),
            Ok(Ok(Ok(()))) => {
                tracing::info!("Native library loaded {}", model_path.display());
                self.loaded = Some(model_path.to_path_buf());
                Ok(())
            }
        }
    }

    async fn generate(
        &mut self,
        request: &GenerationRequest,
        on_token: &mut TokenCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let library = self.library()?;
        if self.loaded.is_none() {
            return Err(EngineError::NoModelLoaded);
        }

        let prompt = request.combined_prompt();
        let params = request.params.validated();
        let task = tokio::task::spawn_blocking(move || library.generate(&prompt, &params));

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(String::new()),
            res = task => res
                .map_err(|e| EngineError::Library(e.to_string()))?
                .map_err(EngineError::Library)?,
        };

        let mut output = String::new();
        for (i, word) in text.split_whitespace().enumerate() {
            if cancel.is_cancelled() {
                break;
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
        if self.loaded.take().is_some() {
            if let Some(library) = self.library.as_ref().map(Arc::clone) {
                let _ = tokio::task::spawn_blocking(move || library.unload()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeLibrary {
        load_delay: Duration,
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl NativeLibrary for FakeLibrary {
        fn load(&self, _model_path: &Path) -> Result<(), String> {
            std::thread::sleep(self.load_delay);
            Ok(())
        }

        fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String, String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    fn fake(load_delay: Duration) -> Arc<FakeLibrary> {
        Arc::new(FakeLibrary {
            load_delay,
            reply: "Hello there,\nfriend".to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn model_file(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, b"GGUF0000").unwrap();
        path
    }

    #[tokio::test]
    async fn test_unavailable_library() {
        let mut engine = LibraryEngine::new(None, DEFAULT_LOAD_TIMEOUT);
        let err = engine
            .load(Path::new("/m.gguf"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LibraryUnavailable));
    }

    #[tokio::test]
    async fn test_emulated_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let lib = fake(Duration::ZERO);
        let mut engine = LibraryEngine::new(Some(lib.clone() as Arc<dyn NativeLibrary>), DEFAULT_LOAD_TIMEOUT);
        let cancel = CancellationToken::new();
        engine.load(&model_file(&dir), &cancel).await.unwrap();

        let mut tokens = Vec::new();
        let req = GenerationRequest::new("hi", GenerationParams::default()).with_system_prompt("sys");
        let out = engine
            .generate(&req, &mut |t: &str| tokens.push(t.to_string()), &cancel)
            .await
            .unwrap();

        assert_eq!(tokens, vec!["Hello", " there,", " friend"]);
        assert_eq!(out, "Hello there, friend");
        assert_eq!(*lib.prompts.lock().unwrap(), vec!["sys\nhi".to_string()]);
    }

    #[tokio::test]
    async fn test_load_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine =
            LibraryEngine::new(Some(fake(Duration::from_millis(500)) as Arc<dyn NativeLibrary>), Duration::from_millis(50));
        let err = engine
            .load(&model_file(&dir), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LoadTimeout(_)));
    }

    #[tokio::test]
    async fn test_generate_requires_load() {
        let mut engine = LibraryEngine::new(Some(fake(Duration::ZERO) as Arc<dyn NativeLibrary>), DEFAULT_LOAD_TIMEOUT);
        let err = engine
            .generate(
                &GenerationRequest::new("hi", GenerationParams::default()),
                &mut |_t: &str| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoModelLoaded));
    }
}
