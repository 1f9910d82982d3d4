//! # Edge Agent
//!
//! Command-line front end for the edge engine. Registers the host metrics
//! listed in the configuration, writes every delivered batch to stdout as one
//! JSON object per line and shuts down cleanly on SIGINT or SIGTERM.
//! Logs go to stderr.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::time::interval;
use tracing::{info, warn};

use edge_engine::{
    init_logging, Engine, EngineConfig, JsonLinesSink, MetricSink, ENGINE_FULL_NAME, ENGINE_VERSION,
};

// ============================================================================
// SECTION 1: CLI ARGUMENTS
// ============================================================================

/// Edge agent CLI
#[derive(Parser, Debug)]
#[command(
    name = "edge-agent",
    version,
    about = "Schedules, samples and forwards metrics on an IoT edge device"
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "edge-agent.toml", env = "EDGE_AGENT_CONFIG")]
    config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "EDGE_AGENT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Subcommand to run; defaults to `run`
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the engine and sample the configured metrics
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ============================================================================
// SECTION 2: COMMAND HANDLERS
// ============================================================================

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = EngineConfig::load(config_path)
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

    println!("Configuration is valid.");
    if verbose {
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
    }

    println!();
    println!("  instance:          {}", config.engine.instance_name);
    println!("  collection workers: {}", config.pool.workers);
    println!("  collect queue:     {}", config.pool.collect_queue_capacity);
    match config.send.queue_capacity {
        Some(capacity) => println!("  send queue:        {} ({:?})", capacity, config.send.overflow),
        None => println!("  send queue:        unbounded"),
    }
    println!("  metrics:");
    for metric in &config.metrics {
        println!(
            "    - {} ({}, every {}ms, batches of {})",
            metric.name, metric.kind, metric.interval_ms, metric.aggregation_size
        );
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!("  target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

// ============================================================================
// SECTION 3: RUN
// ============================================================================

/// Resolves when the process is asked to stop.
async fn shutdown_signal() -> AnyhowResult<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                Ok("SIGINT")
            }
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
        Ok("Ctrl-C")
    }
}

async fn run(config: EngineConfig) -> AnyhowResult<()> {
    let stats_every = Duration::from_secs(config.engine.stats_interval_secs.max(1));
    let builtin = config.metrics.clone();

    let engine = Engine::new(config).context("Failed to create engine")?;
    engine.initialize().context("Failed to start engine")?;

    let sink: Arc<dyn MetricSink> = Arc::new(JsonLinesSink::stdout());
    for metric in &builtin {
        engine
            .register(metric.to_definition(sink.clone()))
            .with_context(|| format!("Failed to register metric '{}'", metric.name))?;
    }

    info!(
        target: "edge::engine",
        metrics = builtin.len(),
        "Edge agent running"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut stats_tick = interval(stats_every);
    stats_tick.tick().await;

    loop {
        tokio::select! {
            received = &mut shutdown => {
                info!(target: "edge::engine", signal = received?, "Shutdown requested");
                break;
            }
            _ = stats_tick.tick() => {
                let stats = engine.stats();
                info!(
                    target: "edge::engine",
                    registered = stats.registered,
                    working = stats.pool.working,
                    alive = stats.pool.alive,
                    ready = stats.ready_depth,
                    collect = stats.collect_depth,
                    send = stats.send_depth,
                    "Engine stats"
                );
            }
        }
    }

    let report = engine.terminate();
    if report.is_clean() {
        info!(target: "edge::engine", joined = report.joined.len(), "Edge agent stopped");
    } else {
        warn!(
            target: "edge::engine",
            abandoned = ?report.abandoned,
            "Edge agent stopped with threads still running"
        );
    }
    Ok(())
}

// ============================================================================
// SECTION 4: MAIN ENTRY POINT
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        Some(Commands::Run) | None => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    init_logging(&logging)?;

    if !config_found {
        warn!(
            target: "edge::init",
            path = %cli.config.display(),
            "Config file not found, using defaults"
        );
    }
    info!(target: "edge::init", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    run(config).await
}
