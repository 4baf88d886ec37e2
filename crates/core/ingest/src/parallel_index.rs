//! The parallel index task: best-effort rollup ingestion with optional availability confirmation.
//!
//! A task runs in strictly ordered phases:
//!
//!  1. Validate the task spec. Guaranteed rollup is rejected here, before the input is even looked at
//!  2. Divide the input source into splits
//!  3. Run one sub-task per split, at most `max_num_concurrent_sub_tasks` at a time. Sub-tasks
//!     roll up their own rows only, so the same key may end up in segments of several sub-tasks
//!  4. Number the written segments and publish them all in one commit
//!  5. Optionally wait for the coordinator to serve the published segments
//!
//! Any sub-task failure fails the whole task and nothing is published. Files already written by
//! the sub-tasks are left in the data store.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use common::{DataSegmentWithSchema, Interval, SegmentVersion};
use monitoring::{logging, telemetry::metrics::KeyValue};
use tokio::{sync::Semaphore, task::JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

use crate::{
    Ctx,
    availability::AvailabilityWaiter,
    input::CreateSplitsError,
    publisher::{PublishError, SegmentPublisher},
    report::{RowStats, TaskReport, TaskStatusReport},
    segment_writer::{PendingSegment, SegmentWriter},
    spec::{ConfigurationError, ParallelIndexIngestionSpec, ParallelIndexTask},
    sub_task::{SubTask, SubTaskError},
    tasks::{FailFastJoinSet, TryWaitAllError},
};

/// Runs `task` to completion and summarizes the outcome, never failing.
pub async fn run_task(
    ctx: &Ctx,
    task: &ParallelIndexTask,
    cancel: &CancellationToken,
) -> TaskStatusReport {
    let task_id = task_id(task, Utc::now());
    match run(ctx, &task_id, &task.spec, cancel).await {
        Ok(report) => TaskStatusReport::success(task_id, report),
        Err(Error::Cancelled) => TaskStatusReport::cancelled(task_id),
        Err(err) => TaskStatusReport::failed(task_id, error_chain(&err)),
    }
}

/// Runs one parallel index task.
#[instrument(skip(ctx, spec, cancel), fields(data_source = %spec.data_schema.data_source), err)]
pub async fn run(
    ctx: &Ctx,
    task_id: &str,
    spec: &ParallelIndexIngestionSpec,
    cancel: &CancellationToken,
) -> Result<TaskReport, Error> {
    let plan = spec.validate()?;
    let schema = Arc::new(plan.schema);
    let version = SegmentVersion::from_timestamp(Utc::now());

    let splits = spec
        .io_config
        .input_source
        .create_splits(&ctx.metadata_db, &plan.split_limits)
        .await?;

    let concurrency = plan
        .max_num_concurrent_sub_tasks
        .map_or(ctx.config.max_num_concurrent_sub_tasks, |n| {
            n.min(ctx.config.max_num_concurrent_sub_tasks)
        })
        .max(1);
    tracing::info!(
        splits = splits.len(),
        concurrency,
        %version,
        "starting sub-tasks"
    );

    let sub_task_cancel = cancel.child_token();
    let permits = Arc::new(Semaphore::new(concurrency));
    let id_prefix = sanitize_id(task_id);

    // Sub-tasks beyond the concurrency limit wait for a permit inside their tokio task
    let mut join_set = FailFastJoinSet::<Result<_, SubTaskError>>::new();
    for split in splits {
        let id = format!("{id_prefix}_{:04}", split.index);
        let writer = SegmentWriter::new(
            ctx.data_store.clone(),
            ctx.config.parquet.clone(),
            schema.data_source.clone(),
            version.clone(),
            id.clone(),
            ctx.metrics.clone(),
        );
        let span = tracing::info_span!("sub_task", sub_task_id = %id, split = split.index);
        let sub_task = SubTask::new(
            id,
            split,
            schema.clone(),
            plan.partitions.clone(),
            ctx.data_store.clone(),
            writer,
            ctx.metrics.clone(),
            sub_task_cancel.clone(),
        );
        let permits = permits.clone();
        let cancel = sub_task_cancel.clone();
        join_set.spawn(
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SubTaskError::Cancelled),
                    permit = permits.acquire_owned() => {
                        permit.map_err(|_| SubTaskError::Cancelled)?
                    }
                };
                sub_task.run().await
            }
            .instrument(span),
        );
    }

    let joined = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        joined = join_set.try_wait_all() => Some(joined),
    };
    let Some(joined) = joined else {
        sub_task_cancel.cancel();
        // Dropping the set aborts the sub-tasks still running
        drop(join_set);
        tracing::info!("task cancelled while sub-tasks were running");
        return Err(Error::Cancelled);
    };

    let outputs = match joined {
        Ok(outputs) => outputs,
        Err(err) => {
            sub_task_cancel.cancel();
            if let Some(metrics) = &ctx.metrics {
                metrics.sub_task_failures.inc_with_kvs(&[KeyValue::new(
                    "data_source",
                    schema.data_source.to_string(),
                )]);
            }
            return Err(match err {
                TryWaitAllError::Error(err) if err.is_cancelled() || cancel.is_cancelled() => {
                    Error::Cancelled
                }
                TryWaitAllError::Error(err) => {
                    tracing::error!(
                        error = %err,
                        error_source = logging::error_source(&err),
                        "sub-task failed, nothing will be published"
                    );
                    Error::SubTask(err)
                }
                TryWaitAllError::Panic(err) => Error::SubTaskPanic(err),
            });
        }
    };

    let mut row_stats = RowStats::default();
    let mut pending = Vec::new();
    for output in outputs {
        row_stats += output.row_stats;
        pending.extend(output.segments);
    }
    let candidates = allocate_partitions(pending);

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let publisher = SegmentPublisher::new(ctx.metadata_db.clone(), ctx.metrics.clone());
    let published = publisher.publish(candidates).await?;

    let timeout = plan.availability_timeout;
    let availability = if timeout.is_zero() {
        None
    } else {
        let waiter = AvailabilityWaiter::new(
            ctx.coordinator.clone(),
            ctx.config.availability_poll_interval,
            ctx.metrics.clone(),
        );
        let outcome = waiter
            .wait(&published.segment_ids(), timeout, cancel)
            .await
            .map_err(|_| Error::Cancelled)?;
        Some(outcome)
    };

    let report = TaskReport::new(&published, availability.as_ref(), row_stats);
    tracing::info!(
        segments = report.segments.len(),
        availability_checked = report.availability_checked,
        availability_confirmed = report.availability_confirmed,
        processed = row_stats.processed,
        thrown_away = row_stats.thrown_away,
        "task finished"
    );
    Ok(report)
}

/// Numbers the segments of each interval densely from 0, ordered by sub-task id and sequence.
pub fn allocate_partitions(mut pending: Vec<PendingSegment>) -> Vec<DataSegmentWithSchema> {
    pending.sort_by(|a, b| {
        (a.interval, &a.sub_task_id, a.sequence).cmp(&(b.interval, &b.sub_task_id, b.sequence))
    });

    let mut per_interval: BTreeMap<Interval, u32> = BTreeMap::new();
    for segment in &pending {
        *per_interval.entry(segment.interval).or_default() += 1;
    }

    let mut next: BTreeMap<Interval, u32> = BTreeMap::new();
    pending
        .into_iter()
        .map(|segment| {
            let partitions = per_interval.get(&segment.interval).copied().unwrap_or(1);
            let partition_num = next.entry(segment.interval).or_default();
            let with_schema = segment.into_segment(*partition_num, partitions);
            *partition_num += 1;
            with_schema
        })
        .collect()
}

/// The id of `task`, generated from its datasource and `now` when the task has none.
pub fn task_id(task: &ParallelIndexTask, now: DateTime<Utc>) -> String {
    match &task.id {
        Some(id) if !id.trim().is_empty() => id.clone(),
        _ => format!(
            "index_parallel_{}_{}",
            task.spec.data_schema.data_source,
            now.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        ),
    }
}

/// Task ids end up in file names.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(err), |err| err.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

/// Errors that fail a parallel index task
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The task spec cannot run as a best-effort parallel index task. Raised before any split exists.
    #[error("invalid ingestion spec")]
    Configuration(#[from] ConfigurationError),

    #[error("failed to create input splits")]
    CreateSplits(#[from] CreateSplitsError),

    /// A sub-task could not read its split or write a segment. Nothing was published.
    #[error("sub-task failed")]
    SubTask(#[source] SubTaskError),

    #[error("sub-task panicked")]
    SubTaskPanic(#[source] JoinError),

    /// The commit failed or conflicted with another publish. Nothing was published.
    #[error("failed to publish segments")]
    Publish(#[from] PublishError),

    /// The task was cancelled. Segments may have been published if cancellation happened while
    /// waiting for availability.
    #[error("task was cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
