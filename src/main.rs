//! localchat - chat with local GGUF models from the terminal

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use localchat::chat::{
    ChatSession, CoordinatorConfig, GenerationCoordinator, GenerationOutcome, NotificationCenter,
    SaveScheduler,
};
use localchat::inference::provision::RuntimeProvisioner;
use localchat::inference::resolver::{ExecutableKind, ExecutableResolver, ResolverEnv};
use localchat::inference::{build_engine, select_engine, EngineConfig, EngineKind, EnvironmentFacts};
use localchat::storage::conversations::{ConversationRepository, JsonConversationStore};
use localchat::storage::downloads::{format_size, DownloadCoordinator, HttpModelFetcher};
use localchat::storage::models::{self, ModelWatcher, DEFAULT_SCAN_INTERVAL};
use localchat::storage::settings::{load_settings, save_settings, AppSettings};
use localchat::storage::get_data_dir;
use localchat::types::InstalledModel;

/// localchat - local LLM chat over llama.cpp
#[derive(Parser)]
#[command(name = "localchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat; Ctrl-C stops the current reply
    Chat {
        /// Model file name in the models directory, or an absolute path
        #[arg(short, long)]
        model: Option<String>,
        /// Engine to use instead of the configured one
        #[arg(short, long)]
        engine: Option<EngineKind>,
    },

    /// List installed models
    Models {
        /// Keep running and reprint the list when the directory changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Show where the llama.cpp executables are found
    Resolve {
        /// Copy the resolved CLI into the managed runtime directory
        #[arg(long)]
        install: bool,
    },

    /// Download a GGUF model from HuggingFace
    Download {
        /// URL or `owner/repo[/file.gguf]`
        reference: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    localchat::logging::init_logging(cli.verbose);

    let settings = load_settings();
    match cli.command {
        Commands::Chat { model, engine } => chat(settings, model, engine).await,
        Commands::Models { watch } => list_models(&settings, watch).await,
        Commands::Resolve { install } => resolve(&settings, install).await,
        Commands::Download { reference } => download(&settings, &reference).await,
    }
}

async fn list_models(settings: &AppSettings, watch: bool) -> Result<()> {
    if !watch {
        print_models(settings, &models::scan(&settings.models_directory));
        return Ok(());
    }

    let watcher = ModelWatcher::spawn(settings.models_directory.clone(), DEFAULT_SCAN_INTERVAL);
    let mut updates = watcher.subscribe();
    print_models(settings, &watcher.current());
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let installed = updates.borrow_and_update().clone();
                println!();
                print_models(settings, &installed);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_models(settings: &AppSettings, installed: &[InstalledModel]) {
    if installed.is_empty() {
        println!("No models in {}", settings.models_directory.display());
        return;
    }
    for model in installed {
        let size = std::fs::metadata(&model.path).map(|m| m.len()).unwrap_or(0);
        println!("{:<40} {:>10}  {}", model.file_name, format_size(size), model.name);
    }
}

async fn resolve(settings: &AppSettings, install: bool) -> Result<()> {
    let mut resolved_cli = None;
    for (kind, setting) in [
        (ExecutableKind::Cli, settings.cli_path.clone()),
        (ExecutableKind::Server, settings.server_path.clone()),
    ] {
        let env = ResolverEnv::from_process(kind, setting);
        match ExecutableResolver::new(kind, env).resolve().await {
            Ok(path) => {
                println!("{}: {}", kind, path.display());
                if kind == ExecutableKind::Cli {
                    resolved_cli = Some(path);
                }
            }
            Err(e) => println!("{}", e),
        }
    }

    if install {
        let Some(source) = resolved_cli else {
            bail!("no llama.cpp CLI found to install");
        };
        let provisioner = RuntimeProvisioner::new(get_data_dir()?);
        let installed = provisioner
            .install(&source)
            .with_context(|| format!("installing {}", source.display()))?;
        println!("Installed {}", installed.display());
    }
    Ok(())
}

async fn download(settings: &AppSettings, reference: &str) -> Result<()> {
    let fetcher = HttpModelFetcher::default();
    let (name, url) = fetcher.resolve_hub_reference(reference).await?;

    let downloads = DownloadCoordinator::new(Arc::new(fetcher), &settings.models_directory);
    let handle = downloads.start(&name, &url)?;
    tokio::pin!(handle);

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let path = loop {
        tokio::select! {
            res = &mut handle => break res??,
            _ = ticker.tick() => {
                if let Some(progress) = downloads.progress(&name) {
                    eprint!("\r{}: {:>5.1}%", name, progress * 100.0);
                }
            }
        }
    };
    eprintln!();
    println!("Saved {}", path.display());
    Ok(())
}

fn pick_model(settings: &AppSettings, requested: Option<String>) -> Option<String> {
    requested
        .or_else(|| settings.last_model.clone())
        .or_else(|| {
            models::scan(&settings.models_directory)
                .into_iter()
                .next()
                .map(|m| m.file_name)
        })
}

async fn chat(
    mut settings: AppSettings,
    model: Option<String>,
    engine: Option<EngineKind>,
) -> Result<()> {
    if let Some(engine) = engine {
        settings.engine = engine.to_string();
    }

    let facts = EnvironmentFacts::probe(&settings).await;
    let kind = select_engine(&facts);
    let model = match pick_model(&settings, model) {
        Some(model) => model,
        None if kind == EngineKind::Mock => "mock.gguf".to_string(),
        None => bail!(
            "no model found in {}; use `localchat download` or pass --model",
            settings.models_directory.display()
        ),
    };

    let store: Arc<dyn ConversationRepository> = Arc::new(JsonConversationStore::in_data_dir()?);
    let session = Arc::new(Mutex::new(ChatSession::from_snapshot(store.load().await)));
    let coordinator = GenerationCoordinator::new(
        build_engine(kind, &EngineConfig::from_settings(&settings)),
        Arc::clone(&session),
        SaveScheduler::new(store, settings.save_debounce()),
        Arc::new(NotificationCenter::new(settings.notification_cooldown())),
        CoordinatorConfig {
            system_prompt: Some(settings.system_prompt.clone()),
            models_dir: settings.models_directory.clone(),
        },
    );

    if settings.last_model.as_deref() != Some(model.as_str()) {
        settings.last_model = Some(model.clone());
        if let Err(e) = save_settings(&settings) {
            tracing::warn!("Could not remember model choice: {}", e);
        }
    }

    println!("Chatting with {} ({} engine). /new starts a conversation, /quit exits.", model, kind);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                session.lock().expect("session mutex poisoned").new_conversation();
                continue;
            }
            _ => {}
        }

        let params = settings.generation.clone();
        let task = coordinator.send_message(line, &model, params);
        let conversation = task.conversation_id;
        let reply_index = session
            .lock()
            .expect("session mutex poisoned")
            .get(conversation)
            .map(|c| c.messages.len())
            .unwrap_or(0);

        let outcome = task.outcome();
        tokio::pin!(outcome);
        let mut ticker = tokio::time::interval(Duration::from_millis(40));
        let mut printed = 0;
        let outcome = loop {
            tokio::select! {
                outcome = &mut outcome => break outcome,
                _ = tokio::signal::ctrl_c() => coordinator.cancel_generation(),
                _ = ticker.tick() => {}
            }
            printed += print_reply(&session, conversation, reply_index, printed);
        };
        print_reply(&session, conversation, reply_index, printed);
        println!();

        match outcome {
            GenerationOutcome::Completed { .. } => {}
            GenerationOutcome::Cancelled { .. } => eprintln!("[stopped]"),
            GenerationOutcome::Failed { .. } => {
                for notification in coordinator.notifications().active() {
                    eprintln!("{}: {}", notification.title, notification.message);
                    if let Some(fix) = &notification.remediation {
                        eprintln!("  {}", fix);
                    }
                    coordinator.notifications().dismiss(notification.id);
                }
            }
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

/// Print new text of the reply at `index`; returns the bytes printed
fn print_reply(
    session: &Arc<Mutex<ChatSession>>,
    conversation: uuid::Uuid,
    index: usize,
    printed: usize,
) -> usize {
    use std::io::Write;

    let session = session.lock().expect("session mutex poisoned");
    let Some(reply) = session
        .get(conversation)
        .and_then(|c| c.messages.get(index))
        .filter(|m| !m.is_user)
    else {
        return 0;
    };
    let Some(new) = reply.content.get(printed..) else {
        return 0;
    };
    print!("{}", new);
    let _ = std::io::stdout().flush();
    new.len()
}
