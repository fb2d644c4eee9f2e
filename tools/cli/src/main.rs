//! MedStock CLI - inspect and drive the offline sync engine.
//!
//! This tool operates on the same durable store as the inventory client, so
//! it can queue mutations, show what is pending and drain the outbox.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use medstock_app::{
    default_config_path, EngineConfig, HttpMethod, OfflineEngine, PendingChange, ReplayRequest,
};

#[derive(Parser)]
#[command(name = "medstock")]
#[command(about = "MedStock - offline outbox and sync management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: <config dir>/medstock/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, or ":memory:".
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// API base URL for relative request URLs.
    #[arg(long, global = true)]
    api: Option<String>,

    /// Start in the offline state.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a mutation for replay.
    Enqueue {
        /// HTTP method, e.g. POST.
        #[arg(short, long)]
        method: String,

        /// Request URL, absolute or relative to the API base URL.
        #[arg(short, long)]
        url: String,

        /// Header as "Name: value". May be repeated.
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body.
        #[arg(short, long, conflicts_with = "body_file")]
        body: Option<String>,

        /// Read the request body from a file.
        #[arg(long)]
        body_file: Option<PathBuf>,
    },

    /// List pending changes, oldest first.
    List {
        /// Only show one change type, e.g. "create_materials".
        #[arg(short = 't', long = "type")]
        change_type: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the number of pending changes.
    Count,

    /// Replay every pending change once.
    Sync,

    /// Show the sync status.
    Status {
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the sync log.
    Log {
        /// Only show the last N entries.
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Read or write the read cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Keep the engine running and drain on reconnect or on a timer.
    Watch {
        /// Periodic wakeup interval in seconds.
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Store a JSON value.
    Put {
        key: String,
        /// JSON document.
        value: String,
    },
    /// Print a cached value.
    Get { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "medstock", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let online = !cli.offline;

    match cli.command {
        Commands::Enqueue {
            method,
            url,
            headers,
            body,
            body_file,
        } => cmd_enqueue(config, online, &method, &url, &headers, body, body_file.as_deref()).await,

        Commands::List { change_type, json } => {
            cmd_list(config, online, change_type.as_deref(), json).await
        }

        Commands::Count => cmd_count(config, online).await,

        Commands::Sync => cmd_sync(config, online).await,

        Commands::Status { json } => cmd_status(config, online, json).await,

        Commands::Log { limit, json } => cmd_log(config, online, limit, json).await,

        Commands::Cache { action } => cmd_cache(config, online, action).await,

        Commands::Watch { interval } => cmd_watch(config, online, interval).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Resolve the configuration file and apply flag overrides.
fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => match default_config_path().filter(|path| path.exists()) {
            Some(path) => EngineConfig::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => EngineConfig::default(),
        },
    };

    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    if let Some(api) = &cli.api {
        config.api_base_url = Some(api.clone());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Build an engine for a one-shot command.
///
/// Not initialized: no reconnect listener, no scheduler, no startup drain.
fn open_engine(config: EngineConfig, online: bool) -> Result<OfflineEngine> {
    OfflineEngine::with_http(config, online).context("Failed to create engine")
}

fn format_time(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Invalid header {raw:?}, expected \"Name: value\""))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Invalid header {raw:?}, name is empty");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Queue a mutation.
async fn cmd_enqueue(
    config: EngineConfig,
    online: bool,
    method: &str,
    url: &str,
    headers: &[String],
    body: Option<String>,
    body_file: Option<&Path>,
) -> Result<()> {
    let method: HttpMethod = method.parse().context("Invalid HTTP method")?;
    let mut request = ReplayRequest::new(method, url);
    for raw in headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
    }

    let body = match body_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read body from {}", path.display()))?,
        ),
        None => body,
    };
    if let Some(body) = body {
        request = request.with_body(body);
    }

    let engine = open_engine(config, online)?;
    let id = engine.enqueue(request).await.context("Failed to queue change")?;

    println!("Queued change {}", id);
    println!("  Pending: {}", engine.status().pending_count);

    Ok(())
}

/// List pending changes.
async fn cmd_list(
    config: EngineConfig,
    online: bool,
    change_type: Option<&str>,
    json: bool,
) -> Result<()> {
    let engine = open_engine(config, online)?;
    let changes: Vec<PendingChange> = engine
        .list_pending()
        .await
        .context("Failed to list pending changes")?
        .into_iter()
        .filter(|change| change_type.is_none_or(|t| change.change_type == t))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }

    if changes.is_empty() {
        println!("No pending changes");
        return Ok(());
    }

    println!("{:>6}  {:<27}  {:<7}  {:<20}  URL", "ID", "QUEUED", "METHOD", "TYPE");
    for change in &changes {
        println!(
            "{:>6}  {:<27}  {:<7}  {:<20}  {}",
            change.id,
            format_time(change.timestamp),
            change.method,
            change.change_type,
            change.url
        );
    }
    println!("\nTotal: {} changes", changes.len());

    Ok(())
}

/// Print the pending count.
async fn cmd_count(config: EngineConfig, online: bool) -> Result<()> {
    let engine = open_engine(config, online)?;
    let count = engine
        .pending_count()
        .await
        .context("Failed to count pending changes")?;
    println!("{}", count);
    Ok(())
}

/// Drain the outbox once.
async fn cmd_sync(config: EngineConfig, online: bool) -> Result<()> {
    if !online {
        println!("Offline, nothing replayed");
        return Ok(());
    }

    let engine = open_engine(config, online)?;
    info!("Replaying pending changes");
    let report = engine.request_sync().await.context("Sync failed")?;

    println!("Sync finished");
    println!("  Succeeded: {}", report.success);
    println!("  Failed:    {}", report.failed);
    println!("  Remaining: {}", engine.pending_count().await?);

    Ok(())
}

/// Show status.
async fn cmd_status(config: EngineConfig, online: bool, json: bool) -> Result<()> {
    let engine = open_engine(config, online)?;
    let status = engine
        .refresh_status()
        .await
        .context("Failed to read status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Sync status:");
    println!("  Database: {}", engine.config().database_path.display());
    println!("  Online:   {}", status.is_online);
    println!("  Pending:  {}", status.pending_count);
    println!("  Syncing:  {}", status.is_syncing);
    match status.last_sync_time {
        Some(t) => println!("  Last sync: {}", format_time(t)),
        None => println!("  Last sync: never"),
    }

    Ok(())
}

/// Show the sync log.
async fn cmd_log(config: EngineConfig, online: bool, limit: Option<usize>, json: bool) -> Result<()> {
    let engine = open_engine(config, online)?;
    let mut log = engine.sync_log().await.context("Failed to read sync log")?;
    if let Some(limit) = limit {
        let skip = log.len().saturating_sub(limit);
        log.drain(..skip);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&log)?);
        return Ok(());
    }

    if log.is_empty() {
        println!("Sync log is empty");
        return Ok(());
    }

    for logged in &log {
        let entry = &logged.entry;
        print!(
            "{}  {:<13}  {:<20}  {}",
            format_time(entry.timestamp),
            entry.status,
            entry.change_type,
            entry.url
        );
        match &entry.error {
            Some(error) => println!("  ({})", error),
            None => println!(),
        }
    }

    Ok(())
}

/// Read or write the read cache.
async fn cmd_cache(config: EngineConfig, online: bool, action: CacheAction) -> Result<()> {
    let engine = open_engine(config, online)?;
    match action {
        CacheAction::Put { key, value } => {
            let data: serde_json::Value =
                serde_json::from_str(&value).context("Value is not valid JSON")?;
            engine
                .cache_put(&key, data)
                .await
                .with_context(|| format!("Failed to cache {key}"))?;
            println!("Cached {}", key);
        }
        CacheAction::Get { key } => {
            match engine
                .cache_get(&key)
                .await
                .with_context(|| format!("Failed to read {key}"))?
            {
                Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
                None => anyhow::bail!("Nothing cached under {key}"),
            }
        }
    }
    Ok(())
}

/// Run until Ctrl-C, draining on reconnect and on the wakeup timer.
async fn cmd_watch(mut config: EngineConfig, online: bool, interval: Option<u64>) -> Result<()> {
    if interval.is_some() {
        config.wakeup_interval_secs = interval;
        config.validate().context("Invalid interval")?;
    }

    let engine = open_engine(config, online)?;
    let _status = engine.subscribe_status(|event| {
        let status = &event.status;
        info!(
            "online={} syncing={} pending={}",
            status.is_online, status.is_syncing, status.pending_count
        );
    });
    engine.init().await.context("Failed to start engine")?;

    println!("Watching outbox, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    engine.dispose().await;
    println!("Stopped");

    Ok(())
}
