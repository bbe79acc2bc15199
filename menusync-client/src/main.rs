//! menusync - follow a menu-processing session from the command line
//!
//! Uploads a menu image (or attaches to an existing session), prints stage
//! progress while the pipeline runs and prints the final menu snapshot.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::Parser;
use menusync_client::resolver::MenuSnapshot;
use menusync_client::transport::Artifact;
use menusync_client::{SessionManager, SessionOutcome};
use menusync_common::config::{ClientConfig, LoggingConfig};
use menusync_common::events::{SessionUpdate, StageStatus};
use menusync_common::Backend;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for menusync
#[derive(Parser, Debug)]
#[command(name = "menusync")]
#[command(about = "Follow a menu-processing pipeline session")]
#[command(version)]
struct Args {
    /// Menu image to upload
    #[arg(short, long, conflicts_with = "session_id", required_unless_present = "session_id")]
    file: Option<PathBuf>,

    /// Attach to an already running session instead of uploading
    #[arg(short, long)]
    session_id: Option<String>,

    /// Config file (defaults to <config_dir>/menusync/config.toml)
    #[arg(short, long, env = "MENUSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Pipeline service base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Primary backend (ephemeral or durable)
    #[arg(long)]
    backend: Option<Backend>,

    /// Print the final snapshot as JSON
    #[arg(long)]
    json: bool,

    /// Suppress per-stage progress lines
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Priority: CLI > ENV > TOML > defaults
    let mut config = ClientConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = &args.base_url {
        config.base_url = url.clone();
    }
    if let Some(backend) = args.backend {
        config.primary_backend = backend;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging)?;
    info!(
        base_url = %config.base_url,
        api_version = %config.api_version,
        primary_backend = %config.primary_backend,
        "Starting menusync"
    );

    let manager = SessionManager::http(config).context("Failed to build HTTP transport")?;
    let health_token = CancellationToken::new();
    let health_task = manager.spawn_health_monitor(health_token.clone());
    let mut updates = manager.bus().subscribe();

    let mut handle = match (&args.file, &args.session_id) {
        (Some(path), _) => {
            let artifact = Artifact::from_path(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            manager.start(&artifact).await.context("Failed to start session")?
        }
        (None, Some(id)) => manager.attach(id).await,
        (None, None) => bail!("either --file or --session-id is required"),
    };
    let session_id = handle.session_id().to_string();
    if !args.quiet {
        println!("session {} on {} backend", session_id, handle.backend());
    }

    let quiet = args.quiet;
    let progress_id = session_id.clone();
    let progress = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if !quiet {
                        print_progress(&progress_id, &update);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(missed = n, "Progress output fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!(session_id = %session_id, "Interrupted, closing stream");
            manager.reset(&session_id).await;
            SessionOutcome::Cancelled
        }
    };

    let snapshot = handle.snapshot();
    progress.abort();
    health_token.cancel();
    let _ = health_task.await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }

    match outcome {
        SessionOutcome::Completed { degraded: false } => Ok(()),
        SessionOutcome::Completed { degraded: true } => {
            eprintln!("warning: session completed with partial results");
            Ok(())
        }
        SessionOutcome::Cancelled => bail!("session {} cancelled", session_id),
        SessionOutcome::Failed { error } => bail!("session {} failed: {}", session_id, error),
    }
}

/// RUST_LOG wins; otherwise the configured level applies to the menusync crates
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let default_filter = format!(
        "menusync={level},menusync_client={level},menusync_common={level}",
        level = logging.level
    );
    let file_layer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn print_progress(session_id: &str, update: &SessionUpdate) {
    if update.session_id().is_some_and(|id| id != session_id) {
        return;
    }
    match update {
        SessionUpdate::StageChanged {
            stage,
            status,
            message,
            ..
        } => {
            let marker = match status {
                StageStatus::Pending => " ",
                StageStatus::Active => ">",
                StageStatus::Completed => "+",
                StageStatus::Error => "!",
            };
            println!("[{}] stage {} {}", marker, stage, message);
        }
        SessionUpdate::CategoryProcessing { category, .. } => println!("    enriching {}", category),
        SessionUpdate::ItemsAppended {
            category, total, ..
        } => println!("    {}: {} items", category, total),
        SessionUpdate::CategoryCompleted {
            category,
            item_count,
            ..
        } => println!("    {} done ({} items)", category, item_count),
        SessionUpdate::ImagesMerged { matched, unmatched, .. } => {
            println!("    images: {} matched, {} unmatched", matched, unmatched)
        }
        SessionUpdate::ConnectionChanged {
            phase,
            attempt,
            backend,
            ..
        } if *attempt > 0 => println!("    connection {} (attempt {}, {})", phase, attempt, backend),
        SessionUpdate::BackendPinned { backend, .. } => println!("    all traffic pinned to {}", backend),
        _ => {}
    }
}

fn print_snapshot(snapshot: &MenuSnapshot) {
    println!();
    println!(
        "{} categories, {} items ({:.0}%, source: {:?})",
        snapshot.categories.len(),
        snapshot.item_count(),
        snapshot.overall_percent,
        snapshot.source
    );
    for category in &snapshot.categories {
        println!("{}", category.name);
        for view in &category.items {
            let item = &view.item;
            let mut line = format!("  - {}", item.display_name());
            if let Some(price) = &item.price {
                line.push_str(&format!("  {}", price));
            }
            if view.item.image_url.is_some() {
                line.push_str("  [image]");
            }
            println!("{}", line);
            if let Some(description) = item.description.as_deref().filter(|d| !d.is_empty()) {
                println!("      {}", description);
            }
        }
    }
    if let Some(failure) = &snapshot.failure {
        println!("failed: {}", failure);
    }
}
