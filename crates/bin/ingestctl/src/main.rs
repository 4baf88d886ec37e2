use std::path::{Path, PathBuf};

use anyhow::Context as _;
use config::Config;
use ingest::TaskStatus;
use monitoring::telemetry::metrics;
use url::Url;

mod cmd;

/// Runs parallel index tasks and controls the coordinator that serves their segments
#[derive(Debug, clap::Parser)]
#[command(name = "ingestctl", version)]
struct Cli {
    /// The configuration file to use. Defines the data directory, the metadata database and how
    /// to reach the coordinator.
    #[arg(long, global = true, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run an `index_parallel` task and print its status report as JSON
    ///
    /// Exits with a non-zero status unless the task succeeded. Ctrl-C cancels the task.
    Run {
        /// Path to the task JSON file
        task: PathBuf,
    },

    /// Serve or control a coordinator
    #[command(subcommand)]
    Coordinator(CoordinatorCommand),
}

#[derive(Debug, clap::Subcommand)]
enum CoordinatorCommand {
    /// Run the in-process coordinator behind its HTTP API until interrupted
    Serve,
    /// Suspend segment loading
    Pause(RemoteArgs),
    /// Resume segment loading
    Resume(RemoteArgs),
    /// Print the dynamic configuration and load status as JSON
    Status(RemoteArgs),
}

#[derive(Debug, clap::Args)]
struct RemoteArgs {
    /// Base URL of the coordinator (default: `coordinator.url` from the config file, then
    /// `coordinator.addr`)
    #[arg(long, env = "INGEST_COORDINATOR_URL")]
    url: Option<Url>,
}

#[tokio::main]
async fn main() {
    match main_inner().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Exiting with error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn main_inner() -> anyhow::Result<i32> {
    let Cli { config, command } = clap::Parser::parse();

    match command {
        Command::Run { task } => {
            let config = load_config(config.as_deref())?;
            let (provider, meter) = monitoring::init(config.opentelemetry.as_ref())
                .context("Failed to initialize monitoring")?;

            let report = cmd::run::run(&config, &task, meter.as_ref()).await;
            flush_metrics(provider);
            let report = report?;

            let json = serde_json::to_string_pretty(&report).context("Failed to format report")?;
            println!("{json}");
            Ok(if report.status == TaskStatus::Success { 0 } else { 1 })
        }
        Command::Coordinator(CoordinatorCommand::Serve) => {
            let config = load_config(config.as_deref())?;
            let (provider, _meter) = monitoring::init(config.opentelemetry.as_ref())
                .context("Failed to initialize monitoring")?;

            let result = cmd::coordinator::serve(&config).await;
            flush_metrics(provider);
            result?;
            Ok(0)
        }
        Command::Coordinator(CoordinatorCommand::Pause(args)) => {
            monitoring::logging::init();
            let url = coordinator_url(args.url, config.as_deref())?;
            cmd::coordinator::set_paused(url, true).await?;
            Ok(0)
        }
        Command::Coordinator(CoordinatorCommand::Resume(args)) => {
            monitoring::logging::init();
            let url = coordinator_url(args.url, config.as_deref())?;
            cmd::coordinator::set_paused(url, false).await?;
            Ok(0)
        }
        Command::Coordinator(CoordinatorCommand::Status(args)) => {
            monitoring::logging::init();
            let url = coordinator_url(args.url, config.as_deref())?;
            let status = cmd::coordinator::status(url).await?;
            let json = serde_json::to_string_pretty(&status).context("Failed to format status")?;
            println!("{json}");
            Ok(0)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = path.context("--config parameter is mandatory")?;
    Config::load(path, true, None).context("Failed to load config")
}

fn coordinator_url(url: Option<Url>, config_path: Option<&Path>) -> anyhow::Result<Url> {
    if let Some(url) = url {
        return Ok(url);
    }
    let config = load_config(config_path)?;
    match config.coordinator.url {
        Some(url) => Ok(url),
        None => Url::parse(&format!("http://{}", config.coordinator.addr))
            .context("Invalid coordinator address"),
    }
}

fn flush_metrics(provider: Option<metrics::SdkMeterProvider>) {
    let Some(provider) = provider else {
        return;
    };
    if let Err(err) = metrics::provider_flush_shutdown(provider) {
        tracing::warn!(error = %err, "Failed to flush metrics");
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                (Err(err), _) | (_, Err(err)) => {
                    tracing::error!(error = %err, "Failed to install signal handlers");
                    return std::future::pending().await;
                }
            };
        tokio::select! {
            _ = sigint.recv() => tracing::info!(signal = "SIGINT", "shutdown signal"),
            _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "shutdown signal"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            return std::future::pending().await;
        }
        tracing::info!("shutdown signal");
    }
}
