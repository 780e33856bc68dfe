use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use velox_cache::{CacheBackend, CacheConfig, CacheError, CacheHandle, LoggingConfig, Value};

#[derive(Parser, Debug)]
#[command(name = "velox-cache-cli")]
#[command(about = "Velox Cache CLI - inspect and maintain a cache namespace", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured backend (redis or rocksdb)
    #[arg(short, long)]
    backend: Option<CacheBackend>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value (parsed as JSON, otherwise kept as a string)
    Set { key: String, value: String },
    /// Print the value stored under a key
    Get { key: String },
    /// Check whether a key exists
    Has { key: String },
    /// Remove a key
    Forget { key: String },
    /// Remove every key of the namespace
    Empty,
    /// Remove every key starting with a prefix
    EmptyByMatch { pattern: String },
    /// Compact the embedded store once
    Compact {
        /// Minimum reclaimable share of on-disk data, in (0, 1)
        #[arg(short, long)]
        ratio: Option<f64>,
    },
    /// Run the compaction schedule until Ctrl-C
    Maintain,
}

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CacheConfig::default(),
    };
    config
        .apply_env()
        .context("invalid environment override")?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    Ok(config)
}

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false);

    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Printed for an absent key; a stored nil renders as `(nil)`
const NOT_FOUND: &str = "(not found)";

/// JSON when it parses, plain string otherwise
fn parse_value(raw: &str) -> Result<Value> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::try_from(json).context("unsupported value"),
        Err(_) => Ok(Value::from(raw)),
    }
}

fn render(value: Value) -> String {
    match value {
        Value::Str(s) => format!("\"{}\"", s),
        Value::Nil => "(nil)".dimmed().to_string(),
        other => serde_json::Value::from(other).to_string(),
    }
}

async fn execute(handle: &CacheHandle, config: &CacheConfig, command: Command) -> Result<String> {
    let output = match command {
        Command::Set { key, value } => {
            handle.set(&key, parse_value(&value)?).await?;
            "OK".green().to_string()
        }
        Command::Get { key } => match handle.get(&key).await {
            Ok(value) => render(value),
            Err(CacheError::NotFound(_)) => NOT_FOUND.dimmed().to_string(),
            Err(e) => return Err(e.into()),
        },
        Command::Has { key } => {
            let exists = handle.has(&key).await?;
            format!("(integer) {}", if exists { 1 } else { 0 })
        }
        Command::Forget { key } => {
            handle.forget(&key).await?;
            "OK".green().to_string()
        }
        Command::Empty => {
            handle.empty().await?;
            "OK".green().to_string()
        }
        Command::EmptyByMatch { pattern } => {
            handle.empty_by_match(&pattern).await?;
            "OK".green().to_string()
        }
        Command::Compact { ratio } => {
            let Some(compactor) = handle.compactor() else {
                bail!("backend {} has no compaction hook", handle.backend());
            };
            let report = compactor
                .compact(ratio.unwrap_or(config.maintenance.reclaim_ratio))
                .await?;
            let status = if report.compacted {
                "compacted".green()
            } else {
                "skipped".yellow()
            };
            format!(
                "{} reclaimable={:.2} size_before={} size_after={}",
                status, report.reclaimable_ratio, report.size_before, report.size_after
            )
        }
        Command::Maintain => {
            let Some(task) = handle.start_maintenance(&config.maintenance) else {
                bail!(
                    "maintenance is disabled or unsupported by backend {}",
                    handle.backend()
                );
            };
            info!("Maintenance running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            task.abort();
            "stopped".to_string()
        }
    };

    Ok(output)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging);

    let handle = CacheHandle::open(&config).context("failed to open cache")?;

    let start = Instant::now();
    let result = execute(&handle, &config, args.command).await;
    let elapsed = start.elapsed();

    handle.close().await.context("failed to close cache")?;

    match result {
        Ok(output) => {
            println!("{}\n{}", output, format!("({:.2?})", elapsed).dimmed());
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", format!("Error: {:#}", e).red());
            std::process::exit(1);
        }
    }
}
