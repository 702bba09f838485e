//! llama.cpp native library
//!
//! llama-cpp-2 types hold raw pointers and are not `Send`, so the backend and
//! model live on a dedicated worker thread driven over a channel.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;

use crate::inference::filter::Utf8Accumulator;
use crate::inference::library::NativeLibrary;
use crate::system::gpu::HardwareProfile;
use crate::types::GenerationParams;

enum Command {
    Load {
        path: PathBuf,
        reply: Sender<Result<(), String>>,
    },
    Generate {
        prompt: String,
        params: GenerationParams,
        reply: Sender<Result<String, String>>,
    },
    Unload,
}

/// Handle to the llama.cpp worker thread
pub struct LlamaLibrary {
    commands: Mutex<Sender<Command>>,
}

impl LlamaLibrary {
    /// Initialise the backend on a fresh worker thread
    pub fn start() -> Result<Self, String> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || match LlamaBackend::init() {
                Ok(backend) => {
                    let _ = ready_tx.send(Ok(()));
                    worker_main(backend, rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                }
            })
            .map_err(|e| e.to_string())?;

        ready_rx.recv().map_err(|e| e.to_string())??;
        tracing::info!("llama.cpp worker thread started");
        Ok(Self {
            commands: Mutex::new(tx),
        })
    }

    fn send(&self, command: Command) -> Result<(), String> {
        self.commands
            .lock()
            .map_err(|_| "llama worker mutex poisoned".to_string())?
            .send(command)
            .map_err(|_| "llama worker stopped".to_string())
    }
}

impl NativeLibrary for LlamaLibrary {
    fn load(&self, model_path: &Path) -> Result<(), String> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::Load {
            path: model_path.to_path_buf(),
            reply,
        })?;
        rx.recv().map_err(|e| e.to_string())?
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, String> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::Generate {
            prompt: prompt.to_string(),
            params: params.clone(),
            reply,
        })?;
        rx.recv().map_err(|e| e.to_string())?
    }

    fn unload(&self) {
        let _ = self.send(Command::Unload);
    }
}

fn worker_main(backend: LlamaBackend, commands: Receiver<Command>) {
    let mut model: Option<LlamaModel> = None;

    while let Ok(command) = commands.recv() {
        match command {
            Command::Load { path, reply } => {
                model = None;
                let params =
                    LlamaModelParams::default().with_n_gpu_layers(HardwareProfile::GPU.gpu_layers);
                let result = LlamaModel::load_from_file(&backend, &path, &params)
                    .map(|m| {
                        tracing::info!("Model loaded: {}", path.display());
                        model = Some(m);
                    })
                    .map_err(|e| format!("Failed to load model: {}", e));
                let _ = reply.send(result);
            }
            Command::Generate {
                prompt,
                params,
                reply,
            } => {
                let result = match &model {
                    Some(m) => run_generation(&backend, m, &prompt, &params),
                    None => Err("No model loaded".to_string()),
                };
                let _ = reply.send(result);
            }
            Command::Unload => {
                model = None;
                tracing::info!("Model unloaded in worker thread");
            }
        }
    }
    tracing::debug!("Command channel closed, llama worker exiting");
}

fn build_chat_prompt(model: &LlamaModel, prompt: &str) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let message = LlamaChatMessage::new("user".to_string(), prompt.to_string())
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &[message], true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    prompt: &str,
    params: &GenerationParams,
) -> Result<String, String> {
    let prompt = build_chat_prompt(model, prompt).unwrap_or_else(|e| {
        tracing::warn!("Chat template not applied: {e}");
        prompt.to_string()
    });

    let n_ctx = model
        .n_ctx_train()
        .min(HardwareProfile::GPU.ctx_size)
        .max(2048);
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(HardwareProfile::GPU.batch_size);
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("Failed to create context: {}", e))?;

    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| format!("Failed to tokenize: {}", e))?;
    if tokens.is_empty() {
        return Ok(String::new());
    }

    let mut batch = LlamaBatch::new(tokens.len().max(512), 1);
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        batch
            .add(*token, i as i32, &[0], i == last)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| format!("Failed to decode prompt: {}", e))?;

    let mut sampler = if params.temperature < 0.01 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(params.seed.map(|s| s as u32).unwrap_or_else(rand_seed)),
        ])
    };

    let mut output = String::new();
    let mut utf8 = Utf8Accumulator::new();
    let mut n_cur = tokens.len() as i32;

    for _ in 0..params.max_tokens {
        let token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(token);
        if model.is_eog_token(token) {
            break;
        }

        let bytes = model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| format!("Failed to convert token to bytes: {}", e))?;
        output.push_str(&utf8.push(&bytes));

        if params.stop_sequences().any(|stop| output.ends_with(stop)) {
            break;
        }

        batch.clear();
        batch
            .add(token, n_cur, &[0], true)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode: {}", e))?;
        n_cur += 1;
    }
    output.push_str(&utf8.finish());

    for stop in params.stop_sequences() {
        if let Some(stripped) = output.strip_suffix(stop) {
            output.truncate(stripped.len());
            break;
        }
    }
    Ok(output)
}

fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
