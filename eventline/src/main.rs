//! eventline - CLI tool for inspecting and draining the event queue
//!
//! This tool provides commands for:
//! - Checking delivery configuration and queue status
//! - Queueing an event by hand
//! - Flushing pending events to the ingestion endpoint
//! - Discarding pending events
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/eventline/eventline.db (~/.local/share/eventline/eventline.db)
//! - Logs: $XDG_STATE_HOME/eventline/eventline.<date>.log (~/.local/state/eventline/)
//! - Config: $XDG_CONFIG_HOME/eventline/config.toml (~/.config/eventline/config.toml)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eventline_core::config::API_KEY_ENV;
use eventline_core::queue::open_storage;
use eventline_core::validation::validate_event;
use eventline_core::{Config, Properties, StopReason, Tracker};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "eventline")]
#[command(about = "Inspect and drain the eventline delivery queue")]
#[command(version)]
struct Args {
    /// Write logs to the XDG state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show delivery configuration and queue status
    Status,

    /// Queue one event (delivered by the next flush)
    Track {
        /// Event name
        name: String,

        /// Property as key=value; values that parse as JSON keep their type
        #[arg(short, long = "prop", value_name = "KEY=VALUE")]
        props: Vec<String>,

        /// Identify as this user before tracking
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Deliver all pending events now
    Flush,

    /// Discard all pending events
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(eventline_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Track { name, props, user } => cmd_track(config, &name, &props, user).await,
        Command::Flush => cmd_flush(config).await,
        Command::Clear => cmd_clear(&config),
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Eventline Configuration");
    println!("=======================");
    println!();

    let tracker = &config.tracker;
    println!("Enabled:         {}", tracker.enabled);
    println!(
        "Base URL:        {}",
        tracker.normalized_base_url().as_deref().unwrap_or("<not set>")
    );
    println!(
        "API Key:         {}",
        if tracker.resolved_api_key().is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Environment:     {}", tracker.environment);
    println!("Batch Size:      {}", config.flush.batch_size);
    println!("Flush Interval:  {}s", config.flush.interval().as_secs());
    println!("Timeout:         {}s", config.delivery.timeout().as_secs());
    println!(
        "Log File:        {}",
        eventline_core::logging::log_file_path().display()
    );

    println!();
    if tracker.is_ready() {
        println!("Status: Ready to deliver");
    } else if !tracker.enabled {
        println!("Status: Delivery disabled (events are only queued)");
    } else {
        println!("Status: Not ready (missing required configuration)");
        println!();
        println!("Set them in config.toml or the environment:");
        println!();
        println!("  [tracker]");
        println!("  base_url = \"https://ingest.example.com\"");
        println!("  api_key = \"el_live_xxxxxxxxxxxx\"   # or {}", API_KEY_ENV);
    }

    let storage = open_storage(&config.queue).context("failed to open event queue")?;
    let queue = storage.queue;

    println!();
    println!("Queue");
    println!("-----");
    println!("Backend:         {}", queue.backend());
    println!(
        "Location:        {}",
        storage
            .database
            .as_ref()
            .and_then(|db| db.path())
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<memory>".to_string())
    );
    println!("Capacity:        {}", queue.capacity());
    println!("Pending events:  {}", queue.count());
    if let Some(oldest) = queue.fetch(1).first() {
        println!(
            "Oldest:          {} ({})",
            oldest.name,
            oldest.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}

async fn cmd_track(
    mut config: Config,
    name: &str,
    props: &[String],
    user: Option<String>,
) -> Result<()> {
    let properties = parse_properties(props)?;
    validate_event(name, &properties).context("event rejected")?;

    // Queue only; `flush` does the delivery
    config.tracker.enabled = false;
    let tracker = Tracker::builder(config)
        .autostart(false)
        .build()
        .context("failed to start tracker")?;

    if let Some(user) = user {
        tracker.identify(&user);
    }
    tracker.track(name, properties);

    let pending = tracker.pending_count().await;
    tracing::info!(event = name, pending, "Queued event from the command line");
    println!(
        "Queued '{}' ({} pending, {} queue)",
        name,
        pending,
        tracker.backend()
    );
    Ok(())
}

async fn cmd_flush(config: Config) -> Result<()> {
    if !config.tracker.is_ready() {
        println!("Delivery is not configured. Run 'status' for details.");
        return Ok(());
    }

    let tracker = Tracker::builder(config)
        .autostart(false)
        .build()
        .context("failed to start tracker")?;

    let pending = tracker.pending_count().await;
    if pending == 0 {
        println!("No pending events to flush.");
        return Ok(());
    }

    tracing::info!(pending, "Manual flush requested");
    println!("Flushing {} pending event(s)...", pending);
    let report = tracker.flush().await;

    println!();
    if report.delivered > 0 {
        println!("Delivered {} event(s)", report.delivered);
    } else {
        println!("No events delivered");
    }
    if report.dropped > 0 {
        println!("Dropped {} event(s) rejected by the server", report.dropped);
    }
    match report.stop_reason {
        Some(StopReason::RateLimited) => {
            println!("Stopped: rate limited by the server, try again later")
        }
        Some(StopReason::Retryable(kind)) => println!("Stopped: {} (events kept)", kind),
        Some(StopReason::Drained) | None => {}
    }

    let stats = tracker.stats();
    if stats.batches_sent > 0 {
        println!();
        println!("Stats:");
        println!("  Requests:   {}", stats.batches_sent);
        println!("  Delivered:  {}", stats.events_delivered);
        println!("  Dropped:    {}", stats.events_dropped);
        println!("  Failures:   {}", stats.failures);
        println!("  Remaining:  {}", tracker.pending_count().await);
    }

    Ok(())
}

fn cmd_clear(config: &Config) -> Result<()> {
    let storage = open_storage(&config.queue).context("failed to open event queue")?;
    let queue = storage.queue;

    let pending = queue.count();
    queue.clear();
    println!("Cleared {} pending event(s)", pending);
    Ok(())
}

/// Parse `key=value` pairs. Values that are valid JSON keep their JSON type,
/// anything else becomes a string.
fn parse_properties(pairs: &[String]) -> Result<Properties> {
    let mut properties = Properties::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got {:?}", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("property key must not be empty in {:?}", pair);
        }
        let value =
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        properties.insert(key.to_string(), value);
    }
    Ok(properties)
}
