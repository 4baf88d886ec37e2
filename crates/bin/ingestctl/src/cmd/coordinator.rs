//! Coordinator commands.

use std::{collections::BTreeMap, sync::Arc};

use common::BoxError;
use config::Config;
use coordinator::{
    CoordinationPauseControl as _, CoordinatorDynamicConfig, HttpCoordinatorClient, HttpError,
    LocalCoordinator,
    api::{self, ServeError},
};
use monitoring::logging;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Serves the in-process coordinator until a shutdown signal arrives.
#[tracing::instrument(skip_all, fields(addr = %config.coordinator.addr))]
pub async fn serve(config: &Config) -> Result<(), Error> {
    let metadata_db = config.metadata_db().await.map_err(Error::Setup)?;
    let coordinator = Arc::new(LocalCoordinator::new(
        metadata_db,
        config.coordinator.load_period,
    ));

    let cancel = CancellationToken::new();
    let load_loop = coordinator.spawn(cancel.clone());

    let (addr, server) = api::serve(config.coordinator.addr, coordinator, crate::shutdown_signal())
        .await
        .map_err(Error::Serve)?;
    tracing::info!(%addr, "coordinator listening");

    let result = server.await;
    cancel.cancel();
    if let Err(err) = load_loop.await {
        tracing::warn!(error = %err, "coordinator load loop did not shut down cleanly");
    }

    result.map_err(|err| {
        tracing::error!(error = %err, error_source = logging::error_source(&*err), "coordinator server failed");
        Error::Server(err)
    })
}

/// Pauses or resumes segment loading on the coordinator at `url`.
#[tracing::instrument(skip_all, fields(url = %url, paused = paused))]
pub async fn set_paused(url: Url, paused: bool) -> Result<(), Error> {
    let client = HttpCoordinatorClient::new(url);
    client.set_paused(paused).await.map_err(Error::Remote)?;
    tracing::info!(paused, "coordination updated");
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub dynamic_config: CoordinatorDynamicConfig,
    /// Percentage of used segments served, per datasource
    pub load_status: BTreeMap<String, f64>,
}

#[tracing::instrument(skip_all, fields(url = %url))]
pub async fn status(url: Url) -> Result<Status, Error> {
    let client = HttpCoordinatorClient::new(url);
    let dynamic_config = client.dynamic_config().await.map_err(Error::Http)?;
    let load_status = client.load_status().await.map_err(Error::Http)?;
    Ok(Status {
        dynamic_config,
        load_status,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to set up coordinator")]
    Setup(#[source] config::ConfigError),

    #[error("Failed to start coordinator API")]
    Serve(#[source] ServeError),

    #[error("Coordinator server failed: {0}")]
    Server(BoxError),

    #[error("Coordinator request failed: {0}")]
    Remote(BoxError),

    #[error("Coordinator request failed")]
    Http(#[source] HttpError),
}
