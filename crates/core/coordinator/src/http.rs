//! Client of a coordinator's HTTP API.

use std::collections::{BTreeMap, BTreeSet};

use common::{BoxError, SegmentId};
use monitoring::logging;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{CoordinationPauseControl, CoordinatorClient, CoordinatorDynamicConfig};

const API_PREFIX: [&str; 3] = ["druid", "coordinator", "v1"];

/// Client for the coordinator endpoints used by ingestion.
///
/// Served segments are read from `GET /druid/coordinator/v1/datasources/{dataSource}/segments`,
/// the dynamic configuration from `GET|POST /druid/coordinator/v1/config`.
#[derive(Debug, Clone)]
pub struct HttpCoordinatorClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Ids of the served segments of `datasource`, as strings.
    ///
    /// A datasource the coordinator does not know has no served segments.
    #[tracing::instrument(skip(self), err)]
    pub async fn served_segment_ids(&self, datasource: &str) -> Result<BTreeSet<String>, HttpError> {
        let url = self.endpoint(&["datasources", datasource, "segments"])?;
        let response = self.send(self.http.get(url.clone()), &url).await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("datasource unknown to coordinator");
            return Ok(BTreeSet::new());
        }
        json_body(&url, response).await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn dynamic_config(&self) -> Result<CoordinatorDynamicConfig, HttpError> {
        let url = self.endpoint(&["config"])?;
        let response = self.send(self.http.get(url.clone()), &url).await?;
        json_body(&url, response).await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn set_dynamic_config(&self, config: &CoordinatorDynamicConfig) -> Result<(), HttpError> {
        let url = self.endpoint(&["config"])?;
        let response = self.send(self.http.post(url.clone()).json(config), &url).await?;
        ensure_success(&url, response).await.map(|_| ())
    }

    /// Percentage of used segments served, per datasource.
    #[tracing::instrument(skip(self), err)]
    pub async fn load_status(&self) -> Result<BTreeMap<String, f64>, HttpError> {
        let url = self.endpoint(&["loadstatus"])?;
        let response = self.send(self.http.get(url.clone()), &url).await?;
        json_body(&url, response).await
    }

    fn endpoint(&self, path: &[&str]) -> Result<Url, HttpError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| HttpError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(path);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> Result<Response, HttpError> {
        tracing::debug!(%url, "sending coordinator request");
        request.send().await.map_err(|source| HttpError::Network {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait::async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn segments_served(
        &self,
        ids: &[SegmentId],
    ) -> Result<BTreeMap<SegmentId, bool>, BoxError> {
        let mut by_datasource: BTreeMap<&str, Vec<&SegmentId>> = BTreeMap::new();
        for id in ids {
            by_datasource
                .entry(id.data_source.as_str())
                .or_default()
                .push(id);
        }

        let mut result = BTreeMap::new();
        for (datasource, ids) in by_datasource {
            let served = self.served_segment_ids(datasource).await?;
            for id in ids {
                result.insert(id.clone(), served.contains(&id.to_string()));
            }
        }
        Ok(result)
    }
}

#[async_trait::async_trait]
impl CoordinationPauseControl for HttpCoordinatorClient {
    /// Read-modify-write of the dynamic configuration.
    async fn set_paused(&self, paused: bool) -> Result<(), BoxError> {
        let mut config = self.dynamic_config().await?;
        config.pause_coordination = paused;
        self.set_dynamic_config(&config).await?;
        Ok(())
    }
}

async fn ensure_success(url: &Url, response: Response) -> Result<Response, HttpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.text().await {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(
                %status,
                error = %err,
                error_source = %logging::error_source(&err),
                "failed to read error response"
            );
            String::new()
        }
    };
    Err(HttpError::UnexpectedResponse {
        url: url.to_string(),
        status: status.as_u16(),
        message,
    })
}

async fn json_body<T: DeserializeOwned>(url: &Url, response: Response) -> Result<T, HttpError> {
    ensure_success(url, response)
        .await?
        .json()
        .await
        .map_err(|source| HttpError::Decode {
            url: url.to_string(),
            source,
        })
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The base URL cannot carry a path, e.g. `mailto:` URLs.
    #[error("invalid coordinator base url: {0}")]
    InvalidBaseUrl(String),

    #[error("request to {url} failed")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response from {url} with status {status}: {message}")]
    UnexpectedResponse {
        url: String,
        status: u16,
        message: String,
    },

    #[error("failed to decode response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}
