//! Reading input units into events.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{
    TIME_COLUMN,
    arrow::{
        array::{Array, ArrayRef, AsArray},
        datatypes::{Float64Type, Int64Type},
        error::ArrowError,
    },
    parquet::{arrow::arrow_reader::ParquetRecordBatchReaderBuilder, errors::ParquetError},
};
use serde_json::{Map, Value};

use super::InputUnit;
use crate::data_store::DataStore;

/// One input row.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRecord {
    /// Set when the row comes from a segment, whose time column is already parsed.
    pub timestamp: Option<DateTime<Utc>>,
    pub event: Map<String, Value>,
}

/// Reads every row of `unit`.
pub async fn read_unit(unit: &InputUnit, data_store: &DataStore) -> Result<Vec<InputRecord>, ReadError> {
    match unit {
        InputUnit::File { path, .. } => {
            let bytes = fs_err::tokio::read(path).await.map_err(ReadError::File)?;
            parse_json_lines(&bytes, unit).await
        }
        InputUnit::Inline { data } => parse_json_lines(data.as_bytes(), unit).await,
        InputUnit::Segment {
            segment,
            interval,
            shadowed,
        } => {
            let bytes = data_store
                .get(segment.path())
                .await
                .map_err(|source| ReadError::Segment {
                    unit: unit.to_string(),
                    source,
                })?;
            let keep = |instant: DateTime<Utc>| {
                interval.is_none_or(|interval| interval.contains(instant))
                    && !shadowed.iter().any(|newer| newer.contains(instant))
            };
            read_segment_rows(bytes, keep).map_err(|kind| ReadError::SegmentFormat {
                unit: unit.to_string(),
                kind,
            })
        }
    }
}

/// Lines parsed before yielding back to the runtime.
const YIELD_EVERY_LINES: usize = 1024;

/// Parses newline-delimited JSON objects, yielding periodically so a large unit can be
/// cancelled while it is parsed.
async fn parse_json_lines(bytes: &[u8], unit: &InputUnit) -> Result<Vec<InputRecord>, ReadError> {
    let text = std::str::from_utf8(bytes).map_err(|source| ReadError::Utf8 {
        unit: unit.to_string(),
        source,
    })?;

    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if index % YIELD_EVERY_LINES == YIELD_EVERY_LINES - 1 {
            tokio::task::yield_now().await;
        }
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line).map_err(|source| ReadError::Json {
            unit: unit.to_string(),
            line: index + 1,
            source,
        })?;
        let Value::Object(event) = value else {
            return Err(ReadError::NotAnObject {
                unit: unit.to_string(),
                line: index + 1,
            });
        };
        records.push(InputRecord {
            timestamp: None,
            event,
        });
    }
    Ok(records)
}

/// Decodes the rows of a segment file, keeping those whose time passes `keep`.
///
/// Null cells are left out of the event.
fn read_segment_rows(
    bytes: Bytes,
    keep: impl Fn(DateTime<Utc>) -> bool,
) -> Result<Vec<InputRecord>, SegmentFormatError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let schema = batch.schema();
        let time_index = schema
            .index_of(TIME_COLUMN)
            .map_err(|_| SegmentFormatError::MissingTimeColumn)?;
        let times = batch
            .column(time_index)
            .as_primitive_opt::<Int64Type>()
            .ok_or(SegmentFormatError::MissingTimeColumn)?;

        for row in 0..batch.num_rows() {
            if times.is_null(row) {
                return Err(SegmentFormatError::InvalidTime(None));
            }
            let millis = times.value(row);
            let instant = DateTime::from_timestamp_millis(millis)
                .ok_or(SegmentFormatError::InvalidTime(Some(millis)))?;
            if !keep(instant) {
                continue;
            }

            let mut event = Map::new();
            for (index, field) in schema.fields().iter().enumerate() {
                if index == time_index {
                    continue;
                }
                if let Some(value) = cell_value(batch.column(index), row) {
                    event.insert(field.name().clone(), value);
                }
            }
            records.push(InputRecord {
                timestamp: Some(instant),
                event,
            });
        }
    }
    Ok(records)
}

fn cell_value(array: &ArrayRef, row: usize) -> Option<Value> {
    if array.is_null(row) {
        return None;
    }
    if let Some(longs) = array.as_primitive_opt::<Int64Type>() {
        return Some(Value::from(longs.value(row)));
    }
    if let Some(doubles) = array.as_primitive_opt::<Float64Type>() {
        return serde_json::Number::from_f64(doubles.value(row)).map(Value::Number);
    }
    if let Some(strings) = array.as_string_opt::<i32>() {
        return Some(Value::from(strings.value(row)));
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("failed to read input file")]
    File(#[source] std::io::Error),

    #[error("failed to fetch {unit}")]
    Segment {
        unit: String,
        #[source]
        source: object_store::Error,
    },

    #[error("{unit} is not valid UTF-8")]
    Utf8 {
        unit: String,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error("invalid JSON in {unit} at line {line}")]
    Json {
        unit: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line} of {unit} is not a JSON object")]
    NotAnObject { unit: String, line: usize },

    #[error("failed to decode {unit}")]
    SegmentFormat {
        unit: String,
        #[source]
        kind: SegmentFormatError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentFormatError {
    #[error("invalid parquet file")]
    Parquet(#[from] ParquetError),

    #[error("invalid record batch")]
    Arrow(#[from] ArrowError),

    #[error("segment has no __time column of 64-bit integers")]
    MissingTimeColumn,

    #[error("segment row has an invalid time {0:?}")]
    InvalidTime(Option<i64>),
}

