//! Segment identities and descriptors.
//!
//! A segment is an immutable file holding the rolled-up rows of one datasource for one time
//! interval. Segments are identified by datasource, interval, version and partition number; a
//! newer version of an interval overshadows the older ones.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::{Interval, SchemaPayloadPlus, interval::format_instant};

/// Name of a datasource.
///
/// Must be non-empty, must not start with a `.`, and must not contain `/` or control characters,
/// since the name is also the first component of every segment file path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataSourceName(String);

impl DataSourceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DataSourceName {
    type Error = InvalidDataSourceNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(InvalidDataSourceNameError::Empty);
        }
        if value.starts_with('.') {
            return Err(InvalidDataSourceNameError::LeadingDot(value));
        }
        if value.contains('/') || value.chars().any(char::is_control) {
            return Err(InvalidDataSourceNameError::InvalidCharacter(value));
        }
        Ok(Self(value))
    }
}

impl FromStr for DataSourceName {
    type Err = InvalidDataSourceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_string().try_into()
    }
}

impl From<DataSourceName> for String {
    fn from(value: DataSourceName) -> Self {
        value.0
    }
}

impl std::ops::Deref for DataSourceName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for DataSourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidDataSourceNameError {
    #[error("datasource name must not be empty")]
    Empty,

    #[error("datasource name '{0}' must not start with '.'")]
    LeadingDot(String),

    #[error("datasource name '{0}' must not contain '/' or control characters")]
    InvalidCharacter(String),
}

/// Version of a set of segments.
///
/// Versions are RFC 3339 timestamps with millisecond precision in UTC, so the lexicographic order
/// of versions is their chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentVersion(String);

impl SegmentVersion {
    pub fn from_timestamp(timestamp: DateTime<Utc>) -> Self {
        Self(format_instant(timestamp))
    }

    /// Wraps a version read back from storage.
    pub fn from_stored(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId {
    pub data_source: DataSourceName,
    pub interval: Interval,
    pub version: SegmentVersion,
    pub partition_num: u32,
}

impl fmt::Display for SegmentId {
    /// `{dataSource}_{start}_{end}_{version}`, suffixed with `_{partitionNum}` for partitions
    /// other than 0.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.data_source,
            format_instant(self.interval.start()),
            format_instant(self.interval.end()),
            self.version
        )?;
        if self.partition_num != 0 {
            write!(f, "_{}", self.partition_num)?;
        }
        Ok(())
    }
}

impl Serialize for SegmentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where a segment file can be loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LoadSpec {
    /// A path relative to the root of the segment data store.
    ObjectStore { path: String },
}

/// How a segment relates to the other partitions of its interval and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ShardSpec {
    /// Partitions numbered `0..n` with no key ranges; any subset may be queried independently.
    #[serde(rename_all = "camelCase")]
    Numbered { partition_num: u32, partitions: u32 },
}

impl ShardSpec {
    pub fn partition_num(&self) -> u32 {
        match self {
            ShardSpec::Numbered { partition_num, .. } => *partition_num,
        }
    }
}

/// Descriptor of a published (or about to be published) segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSegment {
    pub data_source: DataSourceName,
    pub interval: Interval,
    pub version: SegmentVersion,
    pub load_spec: LoadSpec,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub shard_spec: ShardSpec,
    pub num_rows: u64,
    /// Size of the segment file in bytes.
    pub size: u64,
}

impl DataSegment {
    pub fn id(&self) -> SegmentId {
        SegmentId {
            data_source: self.data_source.clone(),
            interval: self.interval,
            version: self.version.clone(),
            partition_num: self.shard_spec.partition_num(),
        }
    }

    /// Data store path of the segment file.
    pub fn path(&self) -> &str {
        match &self.load_spec {
            LoadSpec::ObjectStore { path } => path,
        }
    }
}

/// A segment paired with the schema it was written with.
///
/// Either half may be absent: segments written before schemas were tracked have no schema, and a
/// schema may be carried for a segment whose descriptor is not available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegmentWithSchema {
    segment: Option<DataSegment>,
    schema: Option<SchemaPayloadPlus>,
}

impl DataSegmentWithSchema {
    pub fn new(
        segment: impl Into<Option<DataSegment>>,
        schema: impl Into<Option<SchemaPayloadPlus>>,
    ) -> Self {
        Self {
            segment: segment.into(),
            schema: schema.into(),
        }
    }

    pub fn data_segment(&self) -> Option<&DataSegment> {
        self.segment.as_ref()
    }

    pub fn segment_schema(&self) -> Option<&SchemaPayloadPlus> {
        self.schema.as_ref()
    }

    pub fn into_parts(self) -> (Option<DataSegment>, Option<SchemaPayloadPlus>) {
        (self.segment, self.schema)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn segment(partition_num: u32) -> DataSegment {
        DataSegment {
            data_source: "wikipedia".parse().expect("Failed to parse datasource name"),
            interval: "2013-08-31/2013-09-01".parse().expect("Failed to parse interval"),
            version: SegmentVersion::from_stored("2026-01-01T00:00:00.000Z"),
            load_spec: LoadSpec::ObjectStore {
                path: "wikipedia/segment.parquet".into(),
            },
            dimensions: vec!["page".into()],
            metrics: vec!["count".into()],
            shard_spec: ShardSpec::Numbered {
                partition_num,
                partitions: 0,
            },
            num_rows: 3,
            size: 1024,
        }
    }

    #[test]
    fn segment_id_omits_partition_zero() {
        assert_eq!(
            segment(0).id().to_string(),
            "wikipedia_2013-08-31T00:00:00.000Z_2013-09-01T00:00:00.000Z_2026-01-01T00:00:00.000Z"
        );
        assert_eq!(
            segment(2).id().to_string(),
            "wikipedia_2013-08-31T00:00:00.000Z_2013-09-01T00:00:00.000Z_2026-01-01T00:00:00.000Z_2"
        );
    }

    #[test]
    fn data_segment_serializes_with_tagged_specs() {
        let value = serde_json::to_value(segment(1)).expect("Failed to serialize segment");
        assert_eq!(value["loadSpec"], json!({"type": "objectStore", "path": "wikipedia/segment.parquet"}));
        assert_eq!(value["shardSpec"], json!({"type": "numbered", "partitionNum": 1, "partitions": 0}));

        let back: DataSegment = serde_json::from_value(value).expect("Failed to deserialize segment");
        assert_eq!(back, segment(1));
    }

    #[test]
    fn datasource_names_are_validated() {
        assert!("wikipedia_index_test".parse::<DataSourceName>().is_ok());
        assert!("".parse::<DataSourceName>().is_err());
        assert!(".hidden".parse::<DataSourceName>().is_err());
        assert!("a/b".parse::<DataSourceName>().is_err());
        assert!(serde_json::from_value::<DataSourceName>(json!("  ")).is_err());
    }

    #[test]
    fn versions_order_chronologically() {
        let older = SegmentVersion::from_timestamp(
            DateTime::from_timestamp_millis(1_000).expect("valid timestamp"),
        );
        let newer = SegmentVersion::from_timestamp(
            DateTime::from_timestamp_millis(2_000).expect("valid timestamp"),
        );
        assert!(older < newer);
    }

    #[test]
    fn segment_with_schema_exposes_optional_halves() {
        let without_schema = DataSegmentWithSchema::new(segment(0), None::<SchemaPayloadPlus>);
        assert!(without_schema.data_segment().is_some());
        assert!(without_schema.segment_schema().is_none());

        let empty = DataSegmentWithSchema::new(None::<DataSegment>, None::<SchemaPayloadPlus>);
        assert_eq!(empty.into_parts(), (None, None));
    }
}
