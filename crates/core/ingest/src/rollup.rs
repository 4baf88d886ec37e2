//! In-memory rollup of the rows of one sub-task.
//!
//! Rows are bucketed by segment interval; inside a bucket, rows with the same truncated time and
//! dimension values are folded into one row by the metric aggregators. Nothing is shared between
//! sub-tasks, so two sub-tasks may each emit a row for the same key.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use common::{AggregateValue, AggregatorFactory, Interval};
use serde_json::{Map, Value};

use crate::{partitions::DynamicPartitionsSpec, spec::IngestSchema};

#[derive(Debug)]
pub struct RollupBuffer {
    schema: Arc<IngestSchema>,
    max_rows_per_segment: u64,
    max_total_rows: u64,
    intervals: BTreeMap<Interval, IntervalBuffer>,
    total_rows: u64,
    next_seq: u64,
}

#[derive(Debug, Default)]
struct IntervalBuffer {
    rows: BTreeMap<RowKey, Vec<AggregateValue>>,
    /// Dimensions seen so far, under schemaless discovery.
    discovered: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RowKey {
    time: i64,
    dims: BTreeMap<String, String>,
    /// Keeps rows apart when rollup is off.
    seq: u64,
}

/// What the buffer wants flushed after a row was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    None,
    /// The bucket of this interval reached the per-segment row limit.
    Interval(Interval),
    /// The buffer as a whole reached the total row limit.
    All,
}

/// The rolled-up content of one segment, sorted by time then dimension values.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRows {
    pub interval: Interval,
    pub dimensions: Vec<String>,
    pub metrics: Vec<AggregatorFactory>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Epoch milliseconds, truncated to the query granularity.
    pub time: i64,
    /// One value per dimension, in [`SegmentRows::dimensions`] order.
    pub dims: Vec<Option<String>>,
    /// One value per metric, in [`SegmentRows::metrics`] order.
    pub metrics: Vec<AggregateValue>,
}

impl RollupBuffer {
    pub fn new(schema: Arc<IngestSchema>, partitions: &DynamicPartitionsSpec) -> Self {
        Self {
            schema,
            max_rows_per_segment: partitions.max_rows_per_segment(),
            max_total_rows: partitions.max_total_rows(),
            intervals: BTreeMap::new(),
            total_rows: 0,
            next_seq: 0,
        }
    }

    /// Rows currently held, after rollup.
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    pub fn add(&mut self, timestamp: DateTime<Utc>, event: &Map<String, Value>) -> Flush {
        let interval = self.schema.segment_granularity.bucket(timestamp);
        // A query granularity coarser than the segment granularity must not move rows out of
        // their segment
        let time = self
            .schema
            .query_granularity
            .truncate(timestamp)
            .max(interval.start())
            .timestamp_millis();

        let bucket = self.intervals.entry(interval).or_default();
        let dims = match &self.schema.dimensions {
            Some(dimensions) => dimensions
                .iter()
                .filter_map(|name| {
                    dimension_value(event.get(name)?).map(|value| (name.clone(), value))
                })
                .collect(),
            None => {
                let mut dims = BTreeMap::new();
                for (name, value) in event {
                    if !self.schema.is_discoverable(name) {
                        continue;
                    }
                    if !bucket.discovered.contains(name) {
                        bucket.discovered.insert(name.clone());
                    }
                    if let Some(value) = dimension_value(value) {
                        dims.insert(name.clone(), value);
                    }
                }
                dims
            }
        };

        let seq = if self.schema.rollup {
            0
        } else {
            self.next_seq += 1;
            self.next_seq
        };
        let key = RowKey { time, dims, seq };

        let metrics = &self.schema.metrics;
        let aggregates = bucket.rows.entry(key).or_insert_with(|| {
            self.total_rows += 1;
            metrics.iter().map(AggregatorFactory::init).collect()
        });
        for (factory, acc) in metrics.iter().zip(aggregates.iter_mut()) {
            factory.aggregate(acc, event);
        }

        if bucket.rows.len() as u64 >= self.max_rows_per_segment {
            Flush::Interval(interval)
        } else if self.total_rows >= self.max_total_rows {
            Flush::All
        } else {
            Flush::None
        }
    }

    /// Removes the rows of `interval`.
    pub fn take(&mut self, interval: &Interval) -> Option<SegmentRows> {
        let bucket = self.intervals.remove(interval)?;
        self.total_rows -= bucket.rows.len() as u64;
        Some(self.finish(*interval, bucket))
    }

    /// Removes every row, one [`SegmentRows`] per interval in interval order.
    pub fn take_all(&mut self) -> Vec<SegmentRows> {
        let intervals = std::mem::take(&mut self.intervals);
        self.total_rows = 0;
        intervals
            .into_iter()
            .map(|(interval, bucket)| self.finish(interval, bucket))
            .collect()
    }

    fn finish(&self, interval: Interval, bucket: IntervalBuffer) -> SegmentRows {
        let dimensions: Vec<String> = match &self.schema.dimensions {
            Some(dimensions) => dimensions.clone(),
            None => bucket.discovered.into_iter().collect(),
        };

        let mut rows: Vec<Row> = bucket
            .rows
            .into_iter()
            .map(|(mut key, metrics)| Row {
                time: key.time,
                dims: dimensions
                    .iter()
                    .map(|name| key.dims.remove(name))
                    .collect(),
                metrics,
            })
            .collect();
        // Stable, so rows that only differ by arrival keep their order
        rows.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.dims.cmp(&b.dims)));

        SegmentRows {
            interval,
            dimensions,
            metrics: self.schema.metrics.clone(),
            rows,
        }
    }
}

/// String form of a dimension value; `None` for nulls.
fn dimension_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use common::Granularity;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::spec::ParallelIndexIngestionSpec;

    fn schema(dimensions: serde_json::Value, rollup: bool) -> Arc<IngestSchema> {
        let spec: ParallelIndexIngestionSpec = serde_json::from_value(json!({
            "dataSchema": {
                "dataSource": "wikipedia",
                "dimensionsSpec": {"dimensions": dimensions},
                "metricsSpec": [
                    {"type": "count", "name": "count"},
                    {"type": "longSum", "name": "added", "fieldName": "added"}
                ],
                "granularitySpec": {
                    "segmentGranularity": "DAY",
                    "queryGranularity": "HOUR",
                    "rollup": rollup
                }
            },
            "ioConfig": {"inputSource": {"type": "inline", "data": ""}}
        }))
        .expect("Failed to deserialize spec");
        Arc::new(spec.validate().expect("Failed to validate spec").schema)
    }

    fn at(s: &str) -> DateTime<Utc> {
        common::interval::parse_instant(s).expect("Failed to parse instant")
    }

    fn event(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().expect("event must be an object").clone()
    }

    fn limits(max_rows_per_segment: u64, max_total_rows: u64) -> DynamicPartitionsSpec {
        DynamicPartitionsSpec {
            max_rows_per_segment: Some(max_rows_per_segment),
            max_total_rows: Some(max_total_rows),
        }
    }

    #[test]
    fn rows_with_same_key_are_rolled_up() {
        //* Given
        let mut buffer = RollupBuffer::new(schema(json!(["page"]), true), &limits(100, 1000));

        //* When
        buffer.add(at("2013-08-31T01:02:33Z"), &event(json!({"page": "Main", "added": 10})));
        buffer.add(at("2013-08-31T01:59:00Z"), &event(json!({"page": "Main", "added": 5})));
        buffer.add(at("2013-08-31T01:10:00Z"), &event(json!({"page": "Talk", "added": 1})));
        let segments = buffer.take_all();

        //* Then
        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        let day: Interval = "2013-08-31/2013-09-01".parse().expect("interval");
        assert_eq!(segment.interval, day);
        assert_eq!(segment.dimensions, vec!["page".to_string()]);
        let hour = at("2013-08-31T01:00:00Z").timestamp_millis();
        assert_eq!(
            segment.rows,
            vec![
                Row {
                    time: hour,
                    dims: vec![Some("Main".into())],
                    metrics: vec![AggregateValue::Long(2), AggregateValue::Long(15)],
                },
                Row {
                    time: hour,
                    dims: vec![Some("Talk".into())],
                    metrics: vec![AggregateValue::Long(1), AggregateValue::Long(1)],
                },
            ]
        );
        assert_eq!(buffer.total_rows(), 0);
    }

    #[test]
    fn rollup_off_keeps_every_row() {
        //* Given
        let mut buffer = RollupBuffer::new(schema(json!(["page"]), false), &limits(100, 1000));

        //* When
        buffer.add(at("2013-08-31T01:02:33Z"), &event(json!({"page": "Main", "added": 10})));
        buffer.add(at("2013-08-31T01:02:33Z"), &event(json!({"page": "Main", "added": 5})));

        //* Then
        assert_eq!(buffer.total_rows(), 2);
        let rows = &buffer.take_all()[0].rows;
        assert_eq!(
            rows.iter().map(|row| row.metrics[1]).collect::<Vec<_>>(),
            vec![AggregateValue::Long(10), AggregateValue::Long(5)]
        );
    }

    #[test]
    fn per_segment_limit_requests_interval_flush() {
        //* Given
        let mut buffer = RollupBuffer::new(schema(json!(["page"]), true), &limits(2, 1000));
        let day: Interval = "2013-08-31/2013-09-01".parse().expect("interval");

        //* When
        let first = buffer.add(at("2013-08-31T01:00:00Z"), &event(json!({"page": "A"})));
        let repeated = buffer.add(at("2013-08-31T01:00:00Z"), &event(json!({"page": "A"})));
        let second = buffer.add(at("2013-08-31T01:00:00Z"), &event(json!({"page": "B"})));

        //* Then
        assert_eq!(first, Flush::None);
        assert_eq!(repeated, Flush::None);
        assert_eq!(second, Flush::Interval(day));

        let flushed = buffer.take(&day).expect("interval must be buffered");
        assert_eq!(flushed.rows.len(), 2);
        assert!(buffer.take(&day).is_none());
    }

    #[test]
    fn total_limit_requests_full_flush() {
        //* Given
        let mut buffer = RollupBuffer::new(schema(json!(["page"]), true), &limits(100, 2));

        //* When
        let first = buffer.add(at("2013-08-31T01:00:00Z"), &event(json!({"page": "A"})));
        let second = buffer.add(at("2013-09-01T01:00:00Z"), &event(json!({"page": "A"})));

        //* Then
        assert_eq!(first, Flush::None);
        assert_eq!(second, Flush::All);
        let segments = buffer.take_all();
        assert_eq!(
            segments.iter().map(|segment| segment.interval.to_string()).collect::<Vec<_>>(),
            vec![
                "2013-08-31T00:00:00.000Z/2013-09-01T00:00:00.000Z",
                "2013-09-01T00:00:00.000Z/2013-09-02T00:00:00.000Z",
            ]
        );
    }

    #[test]
    fn schemaless_discovery_collects_sorted_dimensions() {
        //* Given
        let mut buffer = RollupBuffer::new(schema(json!([]), true), &limits(100, 1000));

        //* When
        buffer.add(
            at("2013-08-31T01:00:00Z"),
            &event(json!({"timestamp": "x", "user": "u1", "page": "A", "added": 3})),
        );
        buffer.add(
            at("2013-08-31T02:00:00Z"),
            &event(json!({"timestamp": "x", "page": "B", "robot": true, "deleted": null})),
        );
        let segment = buffer.take_all().remove(0);

        //* Then
        assert_eq!(segment.dimensions, vec!["deleted", "page", "robot", "user"]);
        assert_eq!(
            segment.rows.iter().map(|row| row.dims.clone()).collect::<Vec<_>>(),
            vec![
                vec![None, Some("A".into()), None, Some("u1".into())],
                vec![None, Some("B".into()), Some("true".into()), None],
            ]
        );
    }

    #[test]
    fn coarse_query_granularity_stays_inside_segment() {
        //* Given
        let mut schema = (*schema(json!(["page"]), true)).clone();
        schema.segment_granularity = Granularity::Hour;
        schema.query_granularity = Granularity::Day;
        let mut buffer = RollupBuffer::new(Arc::new(schema), &limits(100, 1000));

        //* When
        buffer.add(at("2013-08-31T05:30:00Z"), &event(json!({"page": "A"})));
        let segment = buffer.take_all().remove(0);

        //* Then
        assert_eq!(segment.rows[0].time, at("2013-08-31T05:00:00Z").timestamp_millis());
    }
}
