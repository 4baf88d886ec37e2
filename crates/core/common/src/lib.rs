//! Types shared by every crate of the ingestion workspace: time intervals and granularities,
//! rollup aggregators, and the segment/schema model that is written, published and served.

pub mod aggregator;
pub mod granularity;
pub mod interval;
pub mod schema;
pub mod segment;

pub use arrow;
pub use parquet;

pub use self::{
    aggregator::{AggregateValue, AggregatorFactory},
    granularity::Granularity,
    interval::Interval,
    schema::{ColumnSignature, ColumnType, SchemaFingerprint, SchemaPayload, SchemaPayloadPlus},
    segment::{
        DataSegment, DataSegmentWithSchema, DataSourceName, LoadSpec, SegmentId, SegmentVersion,
        ShardSpec,
    },
};

pub type BoxError = Box<dyn std::error::Error + Sync + Send + 'static>;
pub type BoxResult<T> = Result<T, BoxError>;

/// Name of the timestamp column of every segment file, in epoch milliseconds.
pub const TIME_COLUMN: &str = "__time";
