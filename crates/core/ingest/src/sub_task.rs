//! One worker of a parallel ingestion: reads a split, rolls it up and writes its segments.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    data_store::DataStore,
    input::{InputSplit, ReadError, read_unit},
    metrics::MetricsRegistry,
    partitions::DynamicPartitionsSpec,
    report::RowStats,
    rollup::{Flush, RollupBuffer},
    segment_writer::{PendingSegment, SegmentWriter, WriteError},
    spec::{IngestSchema, TimestampError},
};

/// Records rolled up between cancellation checks.
const YIELD_EVERY_RECORDS: usize = 1024;

#[derive(Debug)]
pub struct SubTask {
    id: String,
    split: InputSplit,
    schema: Arc<IngestSchema>,
    partitions: DynamicPartitionsSpec,
    data_store: DataStore,
    writer: SegmentWriter,
    metrics: Option<Arc<MetricsRegistry>>,
    cancel: CancellationToken,
}

/// What a sub-task leaves behind for the fan-in.
#[derive(Debug)]
pub struct SubTaskOutput {
    pub id: String,
    pub split_index: usize,
    pub segments: Vec<PendingSegment>,
    pub row_stats: RowStats,
}

impl SubTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        split: InputSplit,
        schema: Arc<IngestSchema>,
        partitions: DynamicPartitionsSpec,
        data_store: DataStore,
        writer: SegmentWriter,
        metrics: Option<Arc<MetricsRegistry>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            split,
            schema,
            partitions,
            data_store,
            writer,
            metrics,
            cancel,
        }
    }

    #[tracing::instrument(skip_all, fields(sub_task = %self.id, units = self.split.units.len()), err)]
    pub async fn run(mut self) -> Result<SubTaskOutput, SubTaskError> {
        let mut buffer = RollupBuffer::new(self.schema.clone(), &self.partitions);
        let mut segments = Vec::new();
        let mut row_stats = RowStats::default();

        let units = std::mem::take(&mut self.split.units);
        for unit in &units {
            let records = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SubTaskError::Cancelled),
                records = read_unit(unit, &self.data_store) => records?,
            };
            tracing::trace!(%unit, records = records.len(), "unit read");

            for (index, record) in records.into_iter().enumerate() {
                if index % YIELD_EVERY_RECORDS == YIELD_EVERY_RECORDS - 1 {
                    if self.cancel.is_cancelled() {
                        return Err(SubTaskError::Cancelled);
                    }
                    tokio::task::yield_now().await;
                }
                let timestamp = match record.timestamp {
                    Some(timestamp) => timestamp,
                    None => self.schema.timestamp_spec.extract(&record.event)?,
                };
                if !self.schema.accepts(timestamp) {
                    row_stats.thrown_away += 1;
                    continue;
                }
                row_stats.processed += 1;

                match buffer.add(timestamp, &record.event) {
                    Flush::None => {}
                    Flush::Interval(interval) => {
                        if let Some(rows) = buffer.take(&interval) {
                            segments.push(self.writer.write(rows).await?);
                        }
                    }
                    Flush::All => {
                        for rows in buffer.take_all() {
                            segments.push(self.writer.write(rows).await?);
                        }
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(SubTaskError::Cancelled);
        }
        for rows in buffer.take_all() {
            segments.push(self.writer.write(rows).await?);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_rows(
                &self.schema.data_source,
                row_stats.processed,
                row_stats.thrown_away,
            );
        }
        tracing::debug!(
            segments = segments.len(),
            processed = row_stats.processed,
            thrown_away = row_stats.thrown_away,
            "sub-task finished"
        );

        Ok(SubTaskOutput {
            id: self.id,
            split_index: self.split.index,
            segments,
            row_stats,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubTaskError {
    #[error("sub-task was cancelled")]
    Cancelled,

    #[error("failed to read input")]
    Read(#[from] ReadError),

    #[error("failed to extract row timestamp")]
    Timestamp(#[from] TimestampError),

    #[error("failed to write segment")]
    Write(#[from] WriteError),
}

impl SubTaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SubTaskError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use common::SegmentVersion;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{config::ParquetConfig, input::InputUnit, spec::ParallelIndexIngestionSpec};

    fn schema() -> Arc<IngestSchema> {
        let spec: ParallelIndexIngestionSpec = serde_json::from_value(json!({
            "dataSchema": {
                "dataSource": "wikipedia",
                "dimensionsSpec": {"dimensions": ["page"]},
                "metricsSpec": [{"type": "count", "name": "count"}],
                "granularitySpec": {
                    "segmentGranularity": "DAY",
                    "queryGranularity": "NONE",
                    "intervals": ["2013-08-31/2013-09-02"]
                }
            },
            "ioConfig": {"inputSource": {"type": "inline", "data": ""}}
        }))
        .expect("Failed to deserialize spec");
        Arc::new(spec.validate().expect("Failed to validate spec").schema)
    }

    fn sub_task(data: &str, max_rows_per_segment: u64, cancel: CancellationToken) -> SubTask {
        let data_store = DataStore::in_memory();
        let writer = SegmentWriter::new(
            data_store.clone(),
            ParquetConfig::default(),
            "wikipedia".parse().expect("Failed to parse datasource name"),
            SegmentVersion::from_stored("2026-01-01T00:00:00.000Z"),
            "task_0000".into(),
            None,
        );
        SubTask::new(
            "task_0000".into(),
            InputSplit {
                index: 0,
                units: vec![InputUnit::Inline { data: data.into() }],
            },
            schema(),
            DynamicPartitionsSpec {
                max_rows_per_segment: Some(max_rows_per_segment),
                max_total_rows: None,
            },
            data_store,
            writer,
            None,
            cancel,
        )
    }

    const EVENTS: &str = concat!(
        "{\"timestamp\": \"2013-08-31T01:02:33Z\", \"page\": \"A\"}\n",
        "{\"timestamp\": \"2013-08-31T03:00:00Z\", \"page\": \"B\"}\n",
        "{\"timestamp\": \"2013-08-31T04:00:00Z\", \"page\": \"C\"}\n",
        "{\"timestamp\": \"2013-09-01T00:00:00Z\", \"page\": \"A\"}\n",
        "{\"timestamp\": \"2013-09-05T00:00:00Z\", \"page\": \"A\"}\n",
    );

    #[tokio::test]
    async fn segments_are_cut_at_the_row_limit() {
        //* Given
        let task = sub_task(EVENTS, 2, CancellationToken::new());

        //* When
        let output = task.run().await.expect("Failed to run sub-task");

        //* Then
        assert_eq!(
            output.row_stats,
            RowStats {
                processed: 4,
                thrown_away: 1,
            }
        );
        assert_eq!(
            output
                .segments
                .iter()
                .map(|segment| (segment.interval.to_string(), segment.sequence, segment.num_rows()))
                .collect::<Vec<_>>(),
            vec![
                ("2013-08-31T00:00:00.000Z/2013-09-01T00:00:00.000Z".to_string(), 0, 2),
                ("2013-08-31T00:00:00.000Z/2013-09-01T00:00:00.000Z".to_string(), 1, 1),
                ("2013-09-01T00:00:00.000Z/2013-09-02T00:00:00.000Z".to_string(), 2, 1),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_sub_task_stops_before_reading() {
        //* Given
        let cancel = CancellationToken::new();
        cancel.cancel();
        let task = sub_task(EVENTS, 100, cancel);

        //* When
        let result = task.run().await;

        //* Then
        assert!(matches!(result, Err(err) if err.is_cancelled()));
    }

    #[tokio::test]
    async fn row_without_timestamp_fails_the_sub_task() {
        //* Given
        let task = sub_task("{\"page\": \"A\"}\n", 100, CancellationToken::new());

        //* When
        let result = task.run().await;

        //* Then
        assert!(matches!(result, Err(SubTaskError::Timestamp(TimestampError::Missing(column))) if column == "timestamp"));
    }
}
