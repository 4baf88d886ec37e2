//! Writing rolled-up rows as Parquet segment files.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{
    AggregateValue, ColumnType, DataSegment, DataSegmentWithSchema, DataSourceName, Interval, LoadSpec,
    SchemaPayload, SchemaPayloadPlus, SegmentVersion, ShardSpec, TIME_COLUMN,
    arrow::{
        array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray},
        datatypes::{DataType, Field, Schema},
        error::ArrowError,
    },
    parquet::{arrow::ArrowWriter, errors::ParquetError, file::metadata::KeyValue},
};

use crate::{config::ParquetConfig, data_store::DataStore, metrics::MetricsRegistry, rollup::SegmentRows};

/// Parquet key-value metadata entry holding the segment schema payload.
pub const SCHEMA_METADATA_KEY: &str = "ingest.segment.schema";

/// Writes the segments of one sub-task.
///
/// Files are named after the sub-task and a per-sub-task sequence number, so sub-tasks of the
/// same task never write the same path.
#[derive(Debug)]
pub struct SegmentWriter {
    data_store: DataStore,
    parquet: ParquetConfig,
    data_source: DataSourceName,
    version: SegmentVersion,
    sub_task_id: String,
    next_sequence: u32,
    metrics: Option<Arc<MetricsRegistry>>,
}

/// A segment file written but not yet published.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSegment {
    pub data_source: DataSourceName,
    pub interval: Interval,
    pub version: SegmentVersion,
    pub sub_task_id: String,
    pub sequence: u32,
    pub path: String,
    pub size: u64,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub schema: SchemaPayloadPlus,
}

impl PendingSegment {
    pub fn num_rows(&self) -> u64 {
        self.schema.num_rows
    }

    /// The publishable form of the segment, as partition `partition_num` of `partitions`.
    pub fn into_segment(self, partition_num: u32, partitions: u32) -> DataSegmentWithSchema {
        let segment = DataSegment {
            data_source: self.data_source,
            interval: self.interval,
            version: self.version,
            load_spec: LoadSpec::ObjectStore { path: self.path },
            dimensions: self.dimensions,
            metrics: self.metrics,
            shard_spec: ShardSpec::Numbered {
                partition_num,
                partitions,
            },
            num_rows: self.schema.num_rows,
            size: self.size,
        };
        DataSegmentWithSchema::new(segment, self.schema)
    }
}

impl SegmentWriter {
    pub fn new(
        data_store: DataStore,
        parquet: ParquetConfig,
        data_source: DataSourceName,
        version: SegmentVersion,
        sub_task_id: String,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            data_store,
            parquet,
            data_source,
            version,
            sub_task_id,
            next_sequence: 0,
            metrics,
        }
    }

    #[tracing::instrument(skip_all, fields(interval = %rows.interval, rows = rows.rows.len()), err)]
    pub async fn write(&mut self, rows: SegmentRows) -> Result<PendingSegment, WriteError> {
        let num_rows = rows.rows.len() as u64;
        let payload = SchemaPayload::for_columns(&rows.dimensions, &rows.metrics);
        let batch = record_batch(&rows)?;
        let bytes = self.encode(&batch, &payload)?;
        let size = bytes.len() as u64;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let path = format!(
            "{}/{}_{}/{}/{}_{}.parquet",
            self.data_source,
            compact_instant(rows.interval.start()),
            compact_instant(rows.interval.end()),
            self.version.as_str().replace(':', ""),
            self.sub_task_id,
            sequence,
        );

        self.data_store
            .put(&path, bytes)
            .await
            .map_err(|source| WriteError::Store {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(%path, size, "segment file written");

        if let Some(metrics) = &self.metrics {
            metrics.record_segment_written(&self.data_source, size);
        }

        Ok(PendingSegment {
            data_source: self.data_source.clone(),
            interval: rows.interval,
            version: self.version.clone(),
            sub_task_id: self.sub_task_id.clone(),
            sequence,
            path,
            size,
            dimensions: rows.dimensions,
            metrics: rows
                .metrics
                .iter()
                .map(|factory| factory.name().to_string())
                .collect(),
            schema: SchemaPayloadPlus::new(payload, num_rows),
        })
    }

    fn encode(&self, batch: &RecordBatch, payload: &SchemaPayload) -> Result<Bytes, WriteError> {
        let payload = serde_json::to_string(payload).map_err(WriteError::SchemaPayload)?;

        let mut writer = ArrowWriter::try_new(
            Vec::new(),
            batch.schema(),
            Some(self.parquet.writer_properties()),
        )?;
        writer.write(batch)?;
        writer.append_key_value_metadata(KeyValue::new(SCHEMA_METADATA_KEY.to_string(), payload));
        Ok(Bytes::from(writer.into_inner()?))
    }
}

fn record_batch(rows: &SegmentRows) -> Result<RecordBatch, ArrowError> {
    let mut fields = Vec::with_capacity(1 + rows.dimensions.len() + rows.metrics.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.capacity());

    fields.push(Field::new(TIME_COLUMN, DataType::Int64, false));
    columns.push(Arc::new(Int64Array::from_iter_values(
        rows.rows.iter().map(|row| row.time),
    )));

    for (index, name) in rows.dimensions.iter().enumerate() {
        fields.push(Field::new(name, DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from_iter(
            rows.rows.iter().map(|row| row.dims[index].as_deref()),
        )));
    }

    for (index, factory) in rows.metrics.iter().enumerate() {
        let values = rows.rows.iter().map(|row| row.metrics[index]);
        match factory.column_type() {
            ColumnType::Double => {
                fields.push(Field::new(factory.name(), DataType::Float64, false));
                columns.push(Arc::new(Float64Array::from_iter_values(
                    values.map(AggregateValue::as_f64),
                )));
            }
            ColumnType::Long | ColumnType::String => {
                fields.push(Field::new(factory.name(), DataType::Int64, false));
                columns.push(Arc::new(Int64Array::from_iter_values(
                    values.map(AggregateValue::as_i64),
                )));
            }
        }
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}

/// `20130831T000000.000Z`, safe in object store paths.
fn compact_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed to build record batch")]
    Arrow(#[from] ArrowError),

    #[error("failed to encode parquet file")]
    Parquet(#[from] ParquetError),

    #[error("failed to serialize schema payload")]
    SchemaPayload(#[source] serde_json::Error),

    #[error("failed to store segment file at {path}")]
    Store {
        path: String,
        #[source]
        source: object_store::Error,
    },
}
