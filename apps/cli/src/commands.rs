//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, bail, eyre};
use feedcast_core::{Broadcaster, Publisher, consume};
use feedcast_feed::{ChangeFeedAdapter, FeedQuery, MemoryListener, MemoryStore};
use feedcast_shared::{
    AppConfig, BroadcastConfig, FeedConfig, FeedcastError, PipelineEntry, init_config,
    load_config, load_config_from,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::script;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// feedcast: fan a document change feed out to independent handlers.
#[derive(Parser)]
#[command(
    name = "feedcast",
    version,
    about = "Broadcast document change feeds to independent subscribers.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.feedcast/feedcast.toml.
    #[arg(long, env = "FEEDCAST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Replay a JSON-lines script of store mutations through the configured pipelines.
    Replay {
        /// Script path.
        script: PathBuf,

        /// Pipeline(s) to run (can be specified multiple times). Defaults to all.
        #[arg(short, long)]
        pipeline: Vec<String>,

        /// Override `broadcast.delivery_timeout_ms`.
        #[arg(long)]
        delivery_timeout_ms: Option<u64>,

        /// Override `broadcast.failure_threshold`.
        #[arg(long)]
        failure_threshold: Option<u32>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "feedcast=info",
        1 => "feedcast=debug",
        _ => "feedcast=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Replay {
            script,
            pipeline,
            delivery_timeout_ms,
            failure_threshold,
        } => {
            let mut config = resolve_config(config_path)?;
            if let Some(ms) = delivery_timeout_ms {
                config.broadcast.delivery_timeout_ms = ms;
            }
            if let Some(threshold) = failure_threshold {
                config.broadcast.failure_threshold = threshold;
            }
            config.validate()?;
            cmd_replay(&config, &script, &pipeline).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// A running pipeline: its broadcaster and the logging consumer attached to it.
struct RunningPipeline {
    name: String,
    broadcaster: JoinHandle<feedcast_shared::Result<()>>,
    consumer: JoinHandle<feedcast_shared::Result<u64>>,
}

async fn cmd_replay(config: &AppConfig, script_path: &Path, names: &[String]) -> Result<()> {
    let text = std::fs::read_to_string(script_path)
        .map_err(|e| FeedcastError::io(script_path, e))?;
    let ops = script::parse(&text)?;

    let selected: Vec<&PipelineEntry> = if names.is_empty() {
        config.pipelines.iter().collect()
    } else {
        names
            .iter()
            .map(|name| {
                config
                    .pipeline(name)
                    .ok_or_else(|| eyre!("unknown pipeline '{name}'"))
            })
            .collect::<Result<_>>()?
    };
    if selected.is_empty() {
        bail!("no pipelines configured");
    }

    let store = MemoryStore::new();
    let cancel = CancellationToken::new();
    let feed_config = FeedConfig::from(config);
    let broadcast_config = BroadcastConfig::from(config);

    let mut running = Vec::with_capacity(selected.len());
    for entry in selected {
        let query = FeedQuery::try_from(entry)?;
        let adapter = ChangeFeedAdapter::open(&store, &query, feed_config.clone())?;
        let broadcaster = Arc::new(Broadcaster::new(
            entry.name.clone(),
            adapter,
            broadcast_config.clone(),
        ));
        running.push(start_pipeline(&entry.name, broadcaster, &cancel));
    }

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling pipelines");
                cancel.cancel();
            }
        })
    };

    info!(ops = ops.len(), pipelines = running.len(), "replaying script");
    for op in &ops {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            applied = op.apply(&store) => applied?,
        }
    }
    store.close();

    let mut failed = 0usize;
    for pipeline in running {
        let outcome = pipeline.broadcaster.await?;
        let handled = pipeline.consumer.await?;
        match (outcome, handled) {
            (Ok(()), Ok(handled)) => {
                println!("  {:<20} ok       {handled} event(s)", pipeline.name);
            }
            (Err(FeedcastError::Cancelled), _) | (_, Err(FeedcastError::Cancelled)) => {
                println!("  {:<20} cancelled", pipeline.name);
            }
            (Err(err), _) | (_, Err(err)) => {
                failed += 1;
                println!("  {:<20} failed   {err}", pipeline.name);
            }
        }
    }
    interrupt.abort();

    if failed > 0 {
        bail!("{failed} pipeline(s) failed");
    }
    Ok(())
}

/// Spawn a broadcaster plus a consumer that logs every change it sees.
fn start_pipeline(
    name: &str,
    broadcaster: Arc<Broadcaster<MemoryListener>>,
    cancel: &CancellationToken,
) -> RunningPipeline {
    let (subscriber, inbox) = broadcaster.channel();
    // Registered before the feed starts so early changes are not missed;
    // consume re-subscribes, which is a no-op.
    broadcaster.subscribe(subscriber.clone());

    let consumer = {
        let broadcaster = Arc::clone(&broadcaster);
        let cancel = cancel.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            consume(broadcaster.as_ref(), subscriber, inbox, cancel, |event| {
                if let Some(doc) = &event.document {
                    info!(pipeline = %name, document = %doc.path, "change received");
                }
                async {}
            })
            .await
        })
    };

    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { broadcaster.start(cancel).await })
    };

    RunningPipeline {
        name: name.to_string(),
        broadcaster: handle,
        consumer,
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
