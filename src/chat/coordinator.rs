//! Generation coordinator
//!
//! Single-flight manager for generation tasks. Owns the engine together with
//! the path of the model it has loaded, turns streamed tokens into transcript
//! edits and publishes engine status.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::notifications::NotificationCenter;
use crate::chat::persistence::SaveScheduler;
use crate::chat::session::ChatSession;
use crate::chat::status::{EngineStatus, GenerationOutcome, GenerationState};
use crate::inference::{Engine, EngineKind, ErrorKind, GenerationRequest, InferenceEngine};
use crate::storage::models::resolve_model;
use crate::types::GenerationParams;

/// Coordinator settings that don't change per request
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub system_prompt: Option<String>,
    /// Directory relative model names resolve against
    pub models_dir: PathBuf,
}

struct EngineSlot {
    engine: InferenceEngine,
    loaded_model: Option<PathBuf>,
}

struct ActiveGeneration {
    id: Uuid,
    cancel: CancellationToken,
}

/// Handle to one spawned generation
#[derive(Debug)]
pub struct GenerationTask {
    pub id: Uuid,
    pub conversation_id: Uuid,
    cancel: CancellationToken,
    state: watch::Receiver<GenerationState>,
    handle: JoinHandle<GenerationOutcome>,
}

impl GenerationTask {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> GenerationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<GenerationState> {
        self.state.clone()
    }

    /// Wait for the task to finish
    pub async fn outcome(self) -> GenerationOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => GenerationOutcome::Failed {
                kind: ErrorKind::ProcessFailure,
                message: format!("generation task aborted: {}", e),
            },
        }
    }
}

/// Everything a spawned generation needs, cloned out of the coordinator
#[derive(Clone)]
struct Shared {
    slot: Arc<tokio::sync::Mutex<EngineSlot>>,
    session: Arc<Mutex<ChatSession>>,
    saver: SaveScheduler,
    notifications: Arc<NotificationCenter>,
    status: Arc<watch::Sender<EngineStatus>>,
    generating: Arc<watch::Sender<bool>>,
    active: Arc<Mutex<Option<ActiveGeneration>>>,
    load_seq: Arc<AtomicU64>,
    config: Arc<CoordinatorConfig>,
}

pub struct GenerationCoordinator {
    shared: Shared,
}

impl GenerationCoordinator {
    pub fn new(
        engine: InferenceEngine,
        session: Arc<Mutex<ChatSession>>,
        saver: SaveScheduler,
        notifications: Arc<NotificationCenter>,
        config: CoordinatorConfig,
    ) -> Self {
        let (status, _) = watch::channel(EngineStatus::Idle);
        let (generating, _) = watch::channel(false);
        Self {
            shared: Shared {
                slot: Arc::new(tokio::sync::Mutex::new(EngineSlot {
                    engine,
                    loaded_model: None,
                })),
                session,
                saver,
                notifications,
                status: Arc::new(status),
                generating: Arc::new(generating),
                active: Arc::new(Mutex::new(None)),
                load_seq: Arc::new(AtomicU64::new(0)),
                config: Arc::new(config),
            },
        }
    }

    pub fn session(&self) -> Arc<Mutex<ChatSession>> {
        Arc::clone(&self.shared.session)
    }

    pub fn notifications(&self) -> Arc<NotificationCenter> {
        Arc::clone(&self.shared.notifications)
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_generating(&self) -> bool {
        *self.shared.generating.borrow()
    }

    pub fn subscribe_generating(&self) -> watch::Receiver<bool> {
        self.shared.generating.subscribe()
    }

    /// Append `content` to the selected conversation and start generating
    ///
    /// Any in-flight generation is cancelled first; the new task waits for it
    /// to release the engine.
    pub fn send_message(
        &self,
        content: &str,
        model: &str,
        params: GenerationParams,
    ) -> GenerationTask {
        let shared = self.shared.clone();
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let conversation_id = {
            let mut session = shared.session.lock().expect("session mutex poisoned");
            if let Some(previous) = shared
                .active
                .lock()
                .expect("active generation mutex poisoned")
                .replace(ActiveGeneration {
                    id,
                    cancel: cancel.clone(),
                })
            {
                tracing::debug!("Superseding generation {}", previous.id);
                previous.cancel.cancel();
            }
            let (conversation_id, _) =
                session.append_user_message(content, Some(model.to_string()));
            session.set_generation_params(conversation_id, params.clone());
            shared.saver.schedule(session.snapshot());
            conversation_id
        };
        shared.generating.send_replace(true);

        let load_id = shared.load_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (state_tx, state) = watch::channel(GenerationState::Idle);
        let request = GenerationRequest {
            prompt: content.to_string(),
            system_prompt: shared.config.system_prompt.clone(),
            params: params.validated(),
        };
        let model = model.to_string();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let outcome = shared
                .run(
                    id,
                    conversation_id,
                    &model,
                    load_id,
                    request,
                    &task_cancel,
                    &state_tx,
                )
                .await;
            state_tx.send_replace(outcome.state());
            shared.finish(id);
            outcome
        });

        GenerationTask {
            id,
            conversation_id,
            cancel,
            state,
            handle,
        }
    }

    /// Signal the active generation to stop; returns immediately
    pub fn cancel_generation(&self) {
        if let Some(active) = self
            .shared
            .active
            .lock()
            .expect("active generation mutex poisoned")
            .as_ref()
        {
            tracing::debug!("Cancelling generation {}", active.id);
            active.cancel.cancel();
        }
    }

    /// Swap in a new engine once the current one is free
    pub async fn reconfigure(&self, engine: InferenceEngine) {
        self.cancel_generation();
        let mut slot = self.shared.slot.lock().await;
        slot.engine.unload().await;
        tracing::info!("Switching engine {} -> {}", slot.engine.kind(), engine.kind());
        slot.engine = engine;
        slot.loaded_model = None;
        self.shared.status.send_replace(EngineStatus::Idle);
    }

    /// Kind of the engine currently installed
    pub async fn engine_kind(&self) -> EngineKind {
        self.shared.slot.lock().await.engine.kind()
    }

    /// Cancel, wait for the engine, flush pending saves and unload
    pub async fn shutdown(&self) {
        self.cancel_generation();
        let mut slot = self.shared.slot.lock().await;
        if let Err(e) = self.shared.saver.flush().await {
            tracing::error!("Failed to save conversations on shutdown: {}", e);
        }
        slot.engine.unload().await;
        slot.loaded_model = None;
        self.shared.status.send_replace(EngineStatus::Idle);
        tracing::info!("Coordinator shut down");
    }
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        id: Uuid,
        conversation_id: Uuid,
        model: &str,
        load_id: u64,
        request: GenerationRequest,
        cancel: &CancellationToken,
        state: &watch::Sender<GenerationState>,
    ) -> GenerationOutcome {
        state.send_replace(GenerationState::EngineLoading);
        let cancelled = || GenerationOutcome::Cancelled {
            partial: String::new(),
        };

        // Waits for any previous generation to release the engine
        let mut slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(),
            slot = self.slot.lock() => slot,
        };
        if cancel.is_cancelled() {
            return cancelled();
        }

        let model_path = resolve_model(&self.config.models_dir, model);
        if slot.loaded_model.as_deref() != Some(model_path.as_path()) {
            if let Some(outcome) = self
                .load(&mut slot, model, &model_path, load_id, cancel)
                .await
            {
                return outcome;
            }
        }

        state.send_replace(GenerationState::Streaming);
        tracing::debug!("Generation {} streaming", id);

        let mut assistant: Option<Uuid> = None;
        let mut applied = String::new();
        let result = {
            let mut on_token = |token: &str| {
                // send_message cancels under this lock, so no token lands after a newer prompt
                let mut session = self.session.lock().expect("session mutex poisoned");
                if cancel.is_cancelled() {
                    return;
                }
                assistant = session.append_token(conversation_id, assistant, token);
                applied.push_str(token);
                self.saver.schedule(session.snapshot());
            };
            let engine = &mut slot.engine;
            engine.generate(&request, &mut on_token, cancel).await
        };

        match result {
            Ok(_) if cancel.is_cancelled() => GenerationOutcome::Cancelled { partial: applied },
            Ok(text) => GenerationOutcome::Completed { text },
            Err(e) if e.is_cancelled() => GenerationOutcome::Cancelled {
                partial: String::new(),
            },
            Err(e) => {
                tracing::error!("Generation {} failed: {}", id, e);
                if let Some(message) = assistant {
                    let mut session = self.session.lock().expect("session mutex poisoned");
                    if session.remove_message(conversation_id, message) {
                        self.saver.schedule(session.snapshot());
                    }
                }
                // Force a reload next time; the engine may have lost its model
                slot.loaded_model = None;
                self.status.send_replace(EngineStatus::Failed(e.to_string()));
                self.notifications
                    .post_engine_error(slot.engine.kind(), &e);
                GenerationOutcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        }
    }

    /// Load `model_path`; `Some` ends the task with that outcome
    async fn load(
        &self,
        slot: &mut EngineSlot,
        model: &str,
        model_path: &Path,
        load_id: u64,
        cancel: &CancellationToken,
    ) -> Option<GenerationOutcome> {
        let superseded = || self.load_seq.load(Ordering::SeqCst) != load_id;

        self.status.send_replace(EngineStatus::Loading(model.to_string()));
        slot.loaded_model = None;
        tracing::info!("Loading {} with {} engine", model_path.display(), slot.engine.kind());

        let result = slot.engine.load(model_path, cancel).await;
        match result {
            Ok(()) => {
                slot.loaded_model = Some(model_path.to_path_buf());
                if superseded() {
                    tracing::debug!("Load of {} superseded", model);
                    return Some(GenerationOutcome::Cancelled {
                        partial: String::new(),
                    });
                }
                self.status.send_replace(EngineStatus::Loaded(model.to_string()));
                None
            }
            Err(_) if superseded() => {
                tracing::debug!("Discarding result of superseded load of {}", model);
                Some(GenerationOutcome::Cancelled {
                    partial: String::new(),
                })
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                self.status.send_replace(EngineStatus::Idle);
                Some(GenerationOutcome::Cancelled {
                    partial: String::new(),
                })
            }
            Err(e) => {
                tracing::error!("Failed to load {}: {}", model, e);
                self.status.send_replace(EngineStatus::Failed(e.to_string()));
                self.notifications.post_engine_error(slot.engine.kind(), &e);
                Some(GenerationOutcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Clear the active marker if it still belongs to `id`
    fn finish(&self, id: Uuid) {
        let mut active = self.active.lock().expect("active generation mutex poisoned");
        if active.as_ref().is_some_and(|a| a.id == id) {
            *active = None;
            self.generating.send_replace(false);
        }
    }
}
