//! Coordination service collaborators.
//!
//! The ingestion subsystem only needs two things from the coordinator: which of a set of segments
//! are currently served, and a switch that suspends segment loading. Both are reached through the
//! traits below, implemented by an in-process [`LocalCoordinator`] and by an
//! [`HttpCoordinatorClient`] talking to a remote coordinator.

use std::collections::BTreeMap;

use common::{BoxError, SegmentId};
use serde::{Deserialize, Serialize};

pub mod api;
pub mod http;
pub mod local;

pub use self::{
    http::{HttpCoordinatorClient, HttpError},
    local::LocalCoordinator,
};

/// Read access to the set of served segments.
#[async_trait::async_trait]
pub trait CoordinatorClient: std::fmt::Debug + Send + Sync {
    /// Reports, for every id in `ids`, whether the segment is currently served.
    ///
    /// The result holds exactly one entry per distinct id.
    async fn segments_served(&self, ids: &[SegmentId]) -> Result<BTreeMap<SegmentId, bool>, BoxError>;
}

/// Cluster-wide switch suspending the coordinator's load assignment loop.
#[async_trait::async_trait]
pub trait CoordinationPauseControl: Send + Sync {
    async fn set_paused(&self, paused: bool) -> Result<(), BoxError>;
}

/// Dynamic configuration document of the coordinator.
///
/// Fields other than `pauseCoordination` are kept as-is so that a read-modify-write against a
/// remote coordinator does not reset them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorDynamicConfig {
    #[serde(default)]
    pub pause_coordination: bool,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}
