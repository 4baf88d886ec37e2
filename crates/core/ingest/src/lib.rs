//! # Ingest
//!
//! Best-effort rollup batch ingestion. An `index_parallel` task splits its input, rolls up each
//! split in its own sub-task, publishes every resulting segment in a single commit and optionally
//! waits until the coordinator serves them. See [`parallel_index`] for the phases of a task.

use std::sync::Arc;

use coordinator::CoordinatorClient;
use metadata_db::MetadataDb;

pub mod availability;
pub mod config;
pub mod data_store;
pub mod input;
pub mod metrics;
pub mod parallel_index;
pub mod partitions;
pub mod publisher;
pub mod report;
pub mod rollup;
pub mod segment_writer;
pub mod spec;
pub mod sub_task;
pub mod tasks;

pub use self::{
    config::Config,
    data_store::DataStore,
    metrics::MetricsRegistry,
    parallel_index::{Error, run, run_task},
    report::{TaskReport, TaskStatus, TaskStatusReport},
    spec::{ParallelIndexIngestionSpec, ParallelIndexTask},
};

/// Everything a task needs from its environment.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub config: Config,
    pub metadata_db: MetadataDb,
    pub data_store: DataStore,
    /// Asked which published segments are served
    pub coordinator: Arc<dyn CoordinatorClient>,
    /// Optional task metrics
    pub metrics: Option<Arc<MetricsRegistry>>,
}
