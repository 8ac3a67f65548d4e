//! fsr-sync - Device-side sync client
//!
//! Keeps captured interviews in a local queue and pushes them to fsr-core
//! in two phases. Local copies are only released once the server has
//! confirmed both the interview and its audio.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fsr_common::api::SubmitInterviewRequest;
use fsr_common::config::{load_module_config, RootFolderInitializer, RootFolderResolver};
use fsr_sync::{HttpTransport, LocalAudio, SyncAgent, SyncStore};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MODULE_NAME: &str = "fsr-sync";

#[derive(Debug, Parser)]
#[command(name = "fsr-sync", version, about = "Field survey sync client")]
struct Cli {
    /// Root folder holding sync.db
    #[arg(long, global = true, env = "FSR_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// fsr-core base URL (overrides [sync].server_url)
    #[arg(long, global = true, env = "FSR_SERVER_URL")]
    server_url: Option<String>,

    /// Identity sent as X-Actor-Id (overrides [sync].actor_id)
    #[arg(long, global = true, env = "FSR_ACTOR_ID")]
    actor_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue a captured interview
    Enqueue {
        /// JSON file with the interview payload
        #[arg(long)]
        payload: PathBuf,
        /// Recorded audio file
        #[arg(long, requires = "format")]
        audio: Option<PathBuf>,
        #[arg(long)]
        format: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        duration: f64,
    },
    /// Run one sync pass (all unfinished entries, or one)
    Sync {
        #[arg(long)]
        key: Option<String>,
    },
    /// Print the local queue as JSON
    Status,
    /// Delete the local copy of a fully synced entry
    Purge { key: String },
    /// Give an entry that needs attention a fresh retry budget
    Retry { key: String },
    /// Sync repeatedly until interrupted
    Run {
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_module_config(MODULE_NAME);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(cli.root_folder.clone())
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;

    let store = SyncStore::open(&initializer.sync_database_path()).await?;

    let server_url = cli
        .server_url
        .clone()
        .unwrap_or_else(|| config.sync.server_url.clone());
    let actor_id = cli
        .actor_id
        .clone()
        .or_else(|| config.sync.actor_id.clone())
        .context("No actor id: pass --actor-id, set FSR_ACTOR_ID or [sync].actor_id")?;
    let transport = HttpTransport::new(&server_url, &actor_id)?;
    let agent = SyncAgent::new(store, transport, config.sync.retry_policy());

    match cli.command {
        Command::Enqueue {
            payload,
            audio,
            format,
            duration,
        } => {
            let raw = std::fs::read_to_string(&payload)
                .with_context(|| format!("Failed to read {}", payload.display()))?;
            let request: SubmitInterviewRequest = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid interview payload in {}", payload.display()))?;
            let local_audio = match (audio, format) {
                (Some(path), Some(format)) => Some(LocalAudio {
                    path,
                    format,
                    duration_seconds: duration,
                }),
                _ => None,
            };
            let entry = agent.enqueue(request, local_audio).await?;
            println!("{}", entry.local_key);
        }
        Command::Sync { key } => match key {
            Some(key) => {
                let entry = agent.sync_entry(&key).await?;
                println!("{}", serde_json::to_string_pretty(&entry)?);
            }
            None => {
                let report = agent.sync_all().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        },
        Command::Status => {
            let entries = agent.store().list_all().await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::Purge { key } => {
            agent.purge_local(&key).await?;
            println!("purged {}", key);
        }
        Command::Retry { key } => {
            let entry = agent.retry_stalled(&key).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Command::Run { interval_secs } => {
            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                shutdown.cancel();
            });
            agent
                .run(Duration::from_secs(interval_secs.max(1)), cancel)
                .await;
        }
    }

    Ok(())
}
