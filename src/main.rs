//! rustsyntheca - research-output harvesting and reconciliation
//!
//! Harvests CERIF records from an OAI-PMH feed, looks the publications up in
//! OpenAlex, merges both sources with provenance flags and deduplicates.
//!
//! ## Usage
//!
//! ```bash
//! rustsyntheca harvest --collections publications,persons --from 2020-01-01 --until 2021-01-01
//! rustsyntheca run --from 2023-01-01 --output ./output
//! rustsyntheca cache clear
//! ```

use anyhow::{Context, Result};
use chrono::{Days, Local, NaiveDate};
use clap::{Parser, Subcommand};
use rustsyntheca::cache::CacheLayer;
use rustsyntheca::config::Settings;
use rustsyntheca::harvester::DateWindow;
use rustsyntheca::merge::MergeRow;
use rustsyntheca::pipeline::Pipeline;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Research-output harvesting and reconciliation pipeline
#[derive(Parser)]
#[command(name = "rustsyntheca")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Serve harvests and lookups from the cache when present
    #[arg(long, global = true)]
    use_cache: bool,

    /// Cache directory
    #[arg(long, global = true, env = "SYNTHECA_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct WindowArgs {
    /// Harvest records changed on or after this date (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Harvest records changed before this date (defaults to tomorrow)
    #[arg(long)]
    until: Option<NaiveDate>,

    /// Days per concurrently harvested window
    #[arg(long, default_value = "30")]
    window_days: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest OAI-PMH collections to JSON
    Harvest {
        /// Comma-separated collection names
        #[arg(long, value_delimiter = ',', default_value = "publications")]
        collections: Vec<String>,

        #[command(flatten)]
        windows: WindowArgs,

        /// Output directory
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,
    },

    /// Harvest, match against OpenAlex, merge and deduplicate
    Run {
        #[command(flatten)]
        windows: WindowArgs,

        /// Manual correction table (JSON)
        #[arg(long, env = "SYNTHECA_CORRECTIONS_PATH")]
        corrections: Option<PathBuf>,

        /// Fuzzy match acceptance threshold
        #[arg(long)]
        threshold: Option<f64>,

        /// Output directory
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,
    },

    /// Manage the on-disk cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache directory
    Path,
    /// Delete cached record sets
    Clear,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.json_logs);

    let mut settings = Settings::from_env().context("Invalid SYNTHECA_* environment")?;
    if cli.use_cache {
        settings.use_cache_for_retrieval = true;
    }
    if let Some(dir) = cli.cache_dir {
        settings.cache_dir = dir;
    }

    match cli.command {
        Commands::Harvest {
            collections,
            windows,
            output,
        } => run_harvest(&settings, &collections, &windows, &output).await,
        Commands::Run {
            windows,
            corrections,
            threshold,
            output,
        } => {
            if let Some(path) = corrections {
                settings.corrections_path = Some(path);
            }
            if let Some(t) = threshold {
                settings.fuzzy_threshold = t;
            }
            settings.validate().context("Invalid settings")?;
            run_pipeline(&settings, &windows, &output).await
        }
        Commands::Cache { action } => handle_cache(&settings, action),
    }
}

fn init_logging(debug: bool, json: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding work");
            trigger.cancel();
        }
    });
    token
}

fn build_windows(args: &WindowArgs) -> Result<Vec<DateWindow>> {
    let Some(from) = args.from else {
        if args.until.is_some() {
            anyhow::bail!("--until requires --from");
        }
        return Ok(Vec::new());
    };
    let until = match args.until {
        Some(until) => until,
        None => Local::now()
            .date_naive()
            .checked_add_days(Days::new(1))
            .context("Date out of range")?,
    };
    let windows = DateWindow::split(from, until, args.window_days)?;
    if windows.is_empty() {
        anyhow::bail!("--from {} is not before --until {}", from, until);
    }
    Ok(windows)
}

// ============================================================================
// Commands
// ============================================================================

async fn run_harvest(settings: &Settings, collections: &[String], args: &WindowArgs, output: &Path) -> Result<()> {
    let windows = build_windows(args)?;
    let pipeline = Pipeline::new(settings)?;
    let cancel = cancel_on_ctrl_c();

    let harvested = pipeline
        .harvest_until_cancelled(collections, &windows, &cancel)
        .await?;

    std::fs::create_dir_all(output).context("Failed to create output directory")?;
    for (collection, records) in &harvested.collections {
        let path = output.join(format!("{collection}.json"));
        write_json(&path, records)?;
    }
    write_json(&output.join("harvest_summary.json"), &harvested.summary)?;

    println!("{}", harvested.summary);
    Ok(())
}

async fn run_pipeline(settings: &Settings, args: &WindowArgs, output: &Path) -> Result<()> {
    let windows = build_windows(args)?;
    let pipeline = Pipeline::new(settings)?;
    let cancel = cancel_on_ctrl_c();

    let result = pipeline.run_until_cancelled(&windows, &cancel).await?;

    std::fs::create_dir_all(output).context("Failed to create output directory")?;
    write_json(&output.join("merged.json"), &result.rows)?;
    save_csv(&output.join("merged.csv"), &result.rows)?;
    write_json(&output.join("summary.json"), &result.summary)?;

    if !result.summary.harvest.is_complete() {
        print!("{}", result.summary.harvest);
    }
    println!("{}", result.summary);
    Ok(())
}

fn handle_cache(settings: &Settings, action: CacheAction) -> Result<()> {
    let cache = CacheLayer::from_settings(settings);
    match action {
        CacheAction::Path => println!("{}", cache.dir().display()),
        CacheAction::Clear => {
            let removed = cache.clear()?;
            println!("Removed {} cached record sets from {}", removed, cache.dir().display());
        }
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), data).context("Failed to write JSON")?;
    info!(path = %path.display(), "Saved");
    Ok(())
}

/// Flat CSV of merged rows: data fields, then `{source}_id` / `{source}_match`
/// columns, then `matched_by`.
fn save_csv(path: &Path, rows: &[MergeRow]) -> Result<()> {
    if rows.is_empty() {
        warn!(path = %path.display(), "No rows to save");
        return Ok(());
    }

    let fields: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .collect();
    let sources: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.provenance.keys().map(String::as_str))
        .collect();

    let mut wtr = csv::WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .context("Failed to create CSV writer")?;

    let mut header: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    for source in &sources {
        header.push(format!("{source}_id"));
        header.push(format!("{source}_match"));
    }
    header.push("matched_by".to_string());
    wtr.write_record(&header).context("Failed to write CSV header")?;

    for row in rows {
        let mut record: Vec<String> = fields
            .iter()
            .map(|f| row.fields.get(*f).map(|v| v.to_flat_string()).unwrap_or_default())
            .collect();
        for source in &sources {
            record.push(row.identifiers.get(*source).cloned().unwrap_or_default());
            record.push(row.has_source(source).to_string());
        }
        record.push(row.matched_by.map(|p| p.to_string()).unwrap_or_default());
        wtr.write_record(&record).context("Failed to write CSV record")?;
    }

    wtr.flush().context("Failed to flush CSV")?;
    info!(path = %path.display(), rows = rows.len(), "Saved");
    Ok(())
}
