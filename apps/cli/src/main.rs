//! chunkup command-line entry point.

mod config;
mod report;
mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chunkup_http::{HttpTransport, MemorySession};
use chunkup_protocol::UploadConfig;
use chunkup_transfer::{ByteSource, FileSource};
use chunkup_uploader::{InMemoryTransport, TaskStatus, UploadRegistry, UploadTransport};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;
use crate::state::SavedUpload;

#[derive(Debug, Parser)]
#[command(name = "chunkup", version, about = "Resumable chunked file uploads")]
struct Cli {
    /// Configuration file (defaults to the per-user config).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server API root, overriding the configuration file.
    #[arg(long, global = true)]
    server: Option<String>,

    /// Bearer token, overriding the configuration file.
    #[arg(long, global = true, env = "CHUNKUP_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload one or more files.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Chunk requests in flight per file.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Attempts per chunk before the upload fails.
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Files up to this many bytes go in a single request.
        #[arg(long)]
        threshold: Option<u64>,

        /// Where to save uploads interrupted with Ctrl-C.
        #[arg(long, default_value = "chunkup-paused.json")]
        state: PathBuf,

        /// Run against an in-process server instead of the network.
        #[arg(long)]
        dry_run: bool,

        /// Print the final summaries as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Resume uploads saved by an interrupted `upload`.
    Resume {
        #[arg(long, default_value = "chunkup-paused.json")]
        state: PathBuf,

        #[arg(long)]
        json: bool,
    },
    /// Show the server's record of an upload.
    Progress { file_id: String },
    /// Show the server's upload limits.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match CliConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            CliConfig::default()
        }
    };
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(token) = cli.token {
        config.token = token;
    }

    match cli.command {
        Command::Upload {
            files,
            concurrency,
            max_attempts,
            threshold,
            state,
            dry_run,
            json,
        } => {
            if let Some(n) = concurrency {
                config.uploader.concurrency = n;
            }
            if let Some(n) = max_attempts {
                config.uploader.max_attempts = n;
            }
            if threshold.is_some() {
                config.uploader.chunk_threshold = threshold;
            }
            let transport: Arc<dyn UploadTransport> = if dry_run {
                tracing::info!("dry run: uploading to an in-process server");
                Arc::new(InMemoryTransport::new(UploadConfig::default()))
            } else {
                http_transport(&config)?
            };
            upload(&config, transport, &files, &state, json).await
        }
        Command::Resume { state, json } => resume(&config, &state, json).await,
        Command::Progress { file_id } => {
            let progress = http_transport(&config)?.get_progress(file_id).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
            Ok(())
        }
        Command::Config => {
            let limits = http_transport(&config)?.fetch_config().await?;
            println!("{}", serde_json::to_string_pretty(&limits)?);
            Ok(())
        }
    }
}

fn http_transport(config: &CliConfig) -> anyhow::Result<Arc<dyn UploadTransport>> {
    let session = Arc::new(MemorySession::new(config.token()));
    let transport = HttpTransport::new(&config.server_url, session)
        .with_context(|| format!("cannot use server {}", config.server_url))?;
    Ok(Arc::new(transport))
}

async fn upload(
    config: &CliConfig,
    transport: Arc<dyn UploadTransport>,
    files: &[PathBuf],
    state_path: &Path,
    json: bool,
) -> anyhow::Result<()> {
    let registry = UploadRegistry::new(transport, config.uploader.clone());
    registry.subscribe(report::observer());
    registry.refresh_config().await?;

    let mut sources = Vec::with_capacity(files.len());
    for path in files {
        let source = FileSource::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        sources.push((path.clone(), Arc::new(source) as Arc<dyn ByteSource>));
    }

    let mut ids = Vec::with_capacity(sources.len());
    for (path, source) in sources {
        ids.push((path, registry.submit(source).await?));
    }

    let runs = futures_util::future::join_all(ids.iter().map(|(_, id)| registry.start(id)));
    run_interruptible(&registry, runs).await;

    let saved: Vec<SavedUpload> = ids
        .iter()
        .filter_map(|(path, id)| {
            let snapshot = registry.snapshot(id).ok().flatten()?;
            let paused = registry.get(id)?.status == TaskStatus::Paused;
            paused.then(|| SavedUpload {
                path: path.clone(),
                snapshot,
            })
        })
        .collect();
    state::save(state_path, &saved)?;

    finish(&registry, json)
}

async fn resume(config: &CliConfig, state_path: &Path, json: bool) -> anyhow::Result<()> {
    let saved = state::load(state_path)?;
    if saved.is_empty() {
        bail!("no paused uploads in {}", state_path.display());
    }

    let registry = UploadRegistry::new(http_transport(config)?, config.uploader.clone());
    registry.subscribe(report::observer());

    let mut ids = Vec::with_capacity(saved.len());
    for upload in saved {
        let source = FileSource::open(&upload.path)
            .with_context(|| format!("cannot open {}", upload.path.display()))?;
        let id = registry
            .restore(upload.snapshot, Arc::new(source))
            .await
            .with_context(|| format!("cannot resume {}", upload.path.display()))?;
        ids.push((upload.path, id));
    }

    let runs = futures_util::future::join_all(ids.iter().map(|(_, id)| registry.resume(id)));
    run_interruptible(&registry, runs).await;

    let still_paused: Vec<SavedUpload> = ids
        .into_iter()
        .filter_map(|(path, id)| {
            let snapshot = registry.snapshot(&id).ok().flatten()?;
            let paused = registry.get(&id)?.status == TaskStatus::Paused;
            paused.then_some(SavedUpload { path, snapshot })
        })
        .collect();
    state::save(state_path, &still_paused)?;

    finish(&registry, json)
}

/// Awaits `runs`, pausing every active task on the first Ctrl-C and
/// cancelling them on the second.
async fn run_interruptible<F, T>(registry: &UploadRegistry, runs: F)
where
    F: std::future::Future<Output = T>,
{
    tokio::pin!(runs);
    tokio::select! {
        _ = &mut runs => return,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, pausing uploads (Ctrl-C again to cancel)");
            for task in registry.list() {
                let _ = registry.pause(&task.id);
            }
        }
    }
    tokio::select! {
        _ = &mut runs => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("cancelling uploads");
            for task in registry.list() {
                let _ = registry.cancel(&task.id);
            }
            runs.await;
        }
    }
}

fn finish(registry: &UploadRegistry, json: bool) -> anyhow::Result<()> {
    let summaries = registry.list();
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        for summary in &summaries {
            println!("{}", report::summary_line(summary));
        }
    }

    let failed = summaries
        .iter()
        .filter(|s| s.status == TaskStatus::Error)
        .count();
    if failed > 0 {
        bail!("{failed} of {} uploads failed", summaries.len());
    }
    Ok(())
}
