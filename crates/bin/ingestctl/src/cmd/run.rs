//! Task run command.
//!
//! Reads an `index_parallel` task from a JSON file and runs it against the configured metadata
//! database and data store. Without a configured coordinator URL, an in-process coordinator
//! loads the published segments for the duration of the task.

use std::{path::Path, sync::Arc};

use config::Config;
use coordinator::{CoordinatorClient, HttpCoordinatorClient, LocalCoordinator};
use fs_err as fs;
use ingest::{Ctx, MetricsRegistry, ParallelIndexTask, TaskStatusReport};
use monitoring::telemetry::metrics::Meter;
use tokio_util::sync::CancellationToken;

#[tracing::instrument(skip_all, fields(task = %task_path.display()))]
pub async fn run(
    config: &Config,
    task_path: &Path,
    meter: Option<&Meter>,
) -> Result<TaskStatusReport, Error> {
    let contents = fs::tokio::read_to_string(task_path)
        .await
        .map_err(Error::ReadTask)?;
    let task: ParallelIndexTask = serde_json::from_str(&contents).map_err(Error::ParseTask)?;

    let metadata_db = config.metadata_db().await.map_err(Error::Setup)?;
    let data_store = config.data_store().map_err(Error::Setup)?;

    let coordinator_cancel = CancellationToken::new();
    let mut load_loop = None;
    let coordinator: Arc<dyn CoordinatorClient> = match &config.coordinator.url {
        Some(url) => {
            tracing::info!(%url, "using remote coordinator");
            Arc::new(HttpCoordinatorClient::new(url.clone()))
        }
        None => {
            let local = Arc::new(LocalCoordinator::new(
                metadata_db.clone(),
                config.coordinator.load_period,
            ));
            load_loop = Some(local.spawn(coordinator_cancel.clone()));
            local
        }
    };

    let ctx = Ctx {
        config: config.ingest_config(),
        metadata_db,
        data_store,
        coordinator,
        metrics: meter.map(|meter| Arc::new(MetricsRegistry::new(meter))),
    };

    let cancel = CancellationToken::new();
    let signal = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            crate::shutdown_signal().await;
            tracing::info!("cancelling task");
            cancel.cancel();
        }
    });

    let report = ingest::run_task(&ctx, &task, &cancel).await;
    tracing::info!(id = %report.id, status = ?report.status, "task done");

    signal.abort();
    coordinator_cancel.cancel();
    if let Some(load_loop) = load_loop {
        if let Err(err) = load_loop.await {
            tracing::warn!(error = %err, "coordinator load loop did not shut down cleanly");
        }
    }

    Ok(report)
}

/// Errors that prevent a task from being started
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to read task file")]
    ReadTask(#[source] std::io::Error),

    #[error("Invalid task file")]
    ParseTask(#[source] serde_json::Error),

    #[error("Failed to set up task environment")]
    Setup(#[source] config::ConfigError),
}
