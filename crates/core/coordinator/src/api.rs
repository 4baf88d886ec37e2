//! HTTP API of the in-process coordinator
//!
//! Exposes the subset of the coordinator API used by ingestion, so that a [`LocalCoordinator`]
//! can be reached through an [`HttpCoordinatorClient`](crate::HttpCoordinatorClient).

use std::{collections::BTreeMap, future::Future, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use common::BoxError;
use monitoring::logging;
use tokio::net::TcpListener;

use crate::{CoordinatorDynamicConfig, LocalCoordinator};

pub fn router(coordinator: Arc<LocalCoordinator>) -> Router {
    Router::new()
        .route(
            "/druid/coordinator/v1/datasources/{datasource}/segments",
            get(datasource_segments),
        )
        .route(
            "/druid/coordinator/v1/config",
            get(dynamic_config).post(set_dynamic_config),
        )
        .route("/druid/coordinator/v1/loadstatus", get(load_status))
        .with_state(coordinator)
}

/// Binds `at` and returns the bound address plus a future running the server until `shutdown`
/// resolves.
pub async fn serve(
    at: SocketAddr,
    coordinator: Arc<LocalCoordinator>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = Result<(), BoxError>>), ServeError> {
    let listener = TcpListener::bind(at)
        .await
        .map_err(|source| ServeError::TcpBind { addr: at, source })?;
    let addr = listener.local_addr().map_err(ServeError::LocalAddr)?;

    let app = router(coordinator);
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(Into::into)
    };
    Ok((addr, server))
}

/// Handler for `GET /druid/coordinator/v1/datasources/{datasource}/segments`
///
/// Lists the ids of the served segments of a datasource. Responds 404 when none are served.
#[tracing::instrument(skip_all)]
async fn datasource_segments(
    State(coordinator): State<Arc<LocalCoordinator>>,
    Path(datasource): Path<String>,
) -> Result<Json<Vec<String>>, ErrorResponse> {
    let served = coordinator.served_segments(&datasource).await;
    if served.is_empty() {
        return Err(ErrorResponse {
            status_code: StatusCode::NOT_FOUND,
            error_code: "DATASOURCE_NOT_FOUND",
            error_message: format!("no served segments for datasource '{datasource}'"),
        });
    }
    Ok(Json(served.iter().map(ToString::to_string).collect()))
}

/// Handler for `GET /druid/coordinator/v1/config`
async fn dynamic_config(
    State(coordinator): State<Arc<LocalCoordinator>>,
) -> Json<CoordinatorDynamicConfig> {
    Json(coordinator.dynamic_config())
}

/// Handler for `POST /druid/coordinator/v1/config`
async fn set_dynamic_config(
    State(coordinator): State<Arc<LocalCoordinator>>,
    Json(config): Json<CoordinatorDynamicConfig>,
) -> StatusCode {
    coordinator.set_dynamic_config(&config);
    StatusCode::OK
}

/// Handler for `GET /druid/coordinator/v1/loadstatus`
async fn load_status(
    State(coordinator): State<Arc<LocalCoordinator>>,
) -> Result<Json<BTreeMap<String, f64>>, ErrorResponse> {
    match coordinator.load_status().await {
        Ok(status) => Ok(Json(status)),
        Err(err) => {
            tracing::error!(
                error = %err,
                error_source = %logging::error_source(&err),
                "failed to compute load status"
            );
            Err(ErrorResponse {
                status_code: StatusCode::INTERNAL_SERVER_ERROR,
                error_code: "METADATA_DB_ERROR",
                error_message: err.to_string(),
            })
        }
    }
}

/// Error body returned by the API, e.g. `{"error_code": "...", "error_message": "..."}`
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    #[serde(skip)]
    status_code: StatusCode,
    error_code: &'static str,
    error_message: String,
}

impl axum::response::IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (self.status_code, Json(self)).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind to {addr}")]
    TcpBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to get local address")]
    LocalAddr(#[source] std::io::Error),
}
