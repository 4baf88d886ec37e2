//! Parallel index task specs and their validation.

use std::{
    collections::{BTreeSet, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use common::{AggregatorFactory, DataSourceName, Granularity, Interval, TIME_COLUMN};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    input::{InputSource, SplitLimits},
    partitions::{DynamicPartitionsSpec, PartitionsSpec},
};

/// Default split size limit of the `maxSize` split hint, in bytes.
pub const DEFAULT_MAX_SPLIT_SIZE: u64 = 1024 * 1024 * 1024;

/// Default limit on the number of input units per split.
pub const DEFAULT_MAX_NUM_FILES: usize = 1000;

/// A task document as submitted by users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelIndexTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub spec: ParallelIndexIngestionSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "index_parallel")]
    IndexParallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelIndexIngestionSpec {
    pub data_schema: DataSchema,
    pub io_config: IoConfig,
    #[serde(default)]
    pub tuning_config: TuningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSchema {
    pub data_source: DataSourceName,
    #[serde(default)]
    pub timestamp_spec: TimestampSpec,
    #[serde(default)]
    pub dimensions_spec: DimensionsSpec,
    #[serde(default)]
    pub metrics_spec: Vec<AggregatorFactory>,
    #[serde(default)]
    pub granularity_spec: GranularitySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampSpec {
    #[serde(default = "default_timestamp_column")]
    pub column: String,
    #[serde(default)]
    pub format: TimestampFormat,
    /// Used for events without a timestamp column.
    #[serde(default)]
    pub missing_value: Option<Value>,
}

impl Default for TimestampSpec {
    fn default() -> Self {
        Self {
            column: default_timestamp_column(),
            format: TimestampFormat::default(),
            missing_value: None,
        }
    }
}

impl TimestampSpec {
    pub fn extract(&self, event: &Map<String, Value>) -> Result<DateTime<Utc>, TimestampError> {
        let value = match event.get(&self.column) {
            Some(value) if !value.is_null() => value,
            _ => self
                .missing_value
                .as_ref()
                .ok_or_else(|| TimestampError::Missing(self.column.clone()))?,
        };
        self.format.parse(value)
    }
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    /// ISO-8601 strings, or epoch milliseconds given as numbers or digit strings.
    #[default]
    Auto,
    Iso,
    Millis,
    /// Epoch seconds.
    Posix,
    Micro,
    Nano,
}

impl TimestampFormat {
    pub fn parse(&self, value: &Value) -> Result<DateTime<Utc>, TimestampError> {
        let invalid = || TimestampError::Invalid {
            value: value.to_string(),
            format: *self,
        };
        let integer = || match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|float| float as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };

        let instant = match self {
            TimestampFormat::Auto => match value {
                Value::String(s) if !looks_numeric(s) => common::interval::parse_instant(s).ok(),
                _ => integer().and_then(DateTime::from_timestamp_millis),
            },
            TimestampFormat::Iso => value
                .as_str()
                .and_then(|s| common::interval::parse_instant(s).ok()),
            TimestampFormat::Millis => integer().and_then(DateTime::from_timestamp_millis),
            TimestampFormat::Posix => integer().and_then(|secs| DateTime::from_timestamp(secs, 0)),
            TimestampFormat::Micro => integer().and_then(DateTime::from_timestamp_micros),
            TimestampFormat::Nano => integer().map(DateTime::from_timestamp_nanos),
        };
        instant.ok_or_else(invalid)
    }
}

fn looks_numeric(s: &str) -> bool {
    let digits = s.trim().strip_prefix('-').unwrap_or(s.trim());
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    #[error("event has no '{0}' timestamp column and no missing value is configured")]
    Missing(String),

    #[error("cannot parse timestamp {value} with format {format:?}")]
    Invalid {
        value: String,
        format: TimestampFormat,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionsSpec {
    /// Empty enables schemaless dimension discovery.
    #[serde(default)]
    pub dimensions: Vec<DimensionSchema>,
    #[serde(default)]
    pub dimension_exclusions: Vec<String>,
}

/// A dimension, given either by name or as `{"name": ..., "type": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionSchema {
    Name(String),
    Typed {
        name: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        dimension_type: Option<String>,
    },
}

impl DimensionSchema {
    pub fn name(&self) -> &str {
        match self {
            DimensionSchema::Name(name) | DimensionSchema::Typed { name, .. } => name,
        }
    }

    fn is_string(&self) -> bool {
        match self {
            DimensionSchema::Name(_) => true,
            DimensionSchema::Typed { dimension_type, .. } => dimension_type
                .as_deref()
                .is_none_or(|ty| ty.eq_ignore_ascii_case("string")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GranularitySpec {
    #[serde(default = "default_segment_granularity")]
    pub segment_granularity: Granularity,
    #[serde(default)]
    pub query_granularity: Granularity,
    #[serde(default = "default_rollup")]
    pub rollup: bool,
    #[serde(default)]
    pub intervals: Vec<Interval>,
}

impl Default for GranularitySpec {
    fn default() -> Self {
        Self {
            segment_granularity: default_segment_granularity(),
            query_granularity: Granularity::default(),
            rollup: default_rollup(),
            intervals: Vec::new(),
        }
    }
}

fn default_segment_granularity() -> Granularity {
    Granularity::Day
}

fn default_rollup() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoConfig {
    pub input_source: InputSource,
    #[serde(default)]
    pub input_format: InputFormat,
    #[serde(default)]
    pub append_to_existing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputFormat {
    /// Newline-delimited JSON objects.
    #[default]
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningConfig {
    #[serde(default)]
    pub partitions_spec: Option<PartitionsSpec>,
    /// Legacy form of `partitionsSpec.maxRowsPerSegment`.
    #[serde(default)]
    pub max_rows_per_segment: Option<u64>,
    /// Legacy form of `partitionsSpec.maxTotalRows`.
    #[serde(default)]
    pub max_total_rows: Option<u64>,
    #[serde(default)]
    pub force_guaranteed_rollup: bool,
    #[serde(default)]
    pub split_hint_spec: Option<SplitHintSpec>,
    #[serde(default)]
    pub max_num_concurrent_sub_tasks: Option<usize>,
    /// `0` skips waiting for availability.
    #[serde(default, deserialize_with = "deserialize_lenient_i64")]
    pub await_segment_availability_timeout_millis: i64,
}

impl TuningConfig {
    /// The partitions spec in effect, with the legacy top-level limits applied to a dynamic spec.
    pub fn partitions_spec(&self) -> PartitionsSpec {
        match &self.partitions_spec {
            Some(spec) => spec.clone(),
            None => PartitionsSpec::Dynamic(DynamicPartitionsSpec {
                max_rows_per_segment: self.max_rows_per_segment,
                max_total_rows: self.max_total_rows,
            }),
        }
    }
}

/// How the input is cut into splits, one per sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SplitHintSpec {
    #[serde(rename = "maxSize", rename_all = "camelCase")]
    MaxSize {
        /// Bytes, as a number or a human readable size such as `"512MiB"`.
        #[serde(default, deserialize_with = "deserialize_size")]
        max_split_size: Option<i64>,
        #[serde(default)]
        max_num_files: Option<i64>,
    },
    /// Hint of the segment input source.
    #[serde(rename = "segments", rename_all = "camelCase")]
    Segments {
        #[serde(default, deserialize_with = "deserialize_size")]
        max_input_segment_bytes_per_task: Option<i64>,
        #[serde(default)]
        max_num_segments: Option<i64>,
    },
}

impl SplitHintSpec {
    pub fn limits(&self) -> Result<SplitLimits, ConfigurationError> {
        let (max_bytes, max_units) = match self {
            SplitHintSpec::MaxSize {
                max_split_size,
                max_num_files,
            } => (*max_split_size, *max_num_files),
            SplitHintSpec::Segments {
                max_input_segment_bytes_per_task,
                max_num_segments,
            } => (*max_input_segment_bytes_per_task, *max_num_segments),
        };

        let max_bytes = match max_bytes {
            None => DEFAULT_MAX_SPLIT_SIZE,
            Some(size) if size >= 1 => size as u64,
            Some(size) => {
                return Err(ConfigurationError::InvalidSplitHint(format!(
                    "split size must be at least 1 byte, got {size}"
                )));
            }
        };
        let max_units = match max_units {
            None => DEFAULT_MAX_NUM_FILES,
            Some(count) if count >= 1 => count as usize,
            Some(count) => {
                return Err(ConfigurationError::InvalidSplitHint(format!(
                    "split file count must be at least 1, got {count}"
                )));
            }
        };

        Ok(SplitLimits {
            max_bytes,
            max_units,
        })
    }
}

impl Default for SplitHintSpec {
    fn default() -> Self {
        SplitHintSpec::MaxSize {
            max_split_size: None,
            max_num_files: None,
        }
    }
}

/// Accepts integers and integer strings.
fn deserialize_lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => parse_size(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

/// Parses sizes such as `1024`, `10KB`, `512MiB` or `1 GiB`.
fn parse_size(s: &str) -> Result<i64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '-'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: i64 = number
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;

    let multiplier: i64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        other => return Err(format!("unknown size unit '{other}' in '{s}'")),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{s}' is too large"))
}

/// A spec that cannot run on the best-effort rollup path, or that is malformed.
///
/// Always raised before any split exists.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("forceGuaranteedRollup is not supported; only best-effort rollup is available")]
    ForceGuaranteedRollup,

    /// The partitions spec asks for a global shuffle that best-effort rollup never performs.
    #[error("{0} partitions spec requires guaranteed rollup, which is not supported")]
    GuaranteedRollupPartitionsSpec(&'static str),

    #[error("{0} partitions spec is not supported with best-effort rollup; use dynamic")]
    UnsupportedPartitionsSpec(&'static str),

    #[error("invalid split hint: {0}")]
    InvalidSplitHint(String),

    #[error("appendToExisting is not supported; segments always replace their intervals")]
    AppendToExisting,

    #[error("column '{0}' is defined more than once")]
    DuplicateColumn(String),

    #[error("dimension '{0}' uses the reserved name __time")]
    ReservedColumn(String),

    #[error("dimension '{0}' is not a string dimension")]
    UnsupportedDimensionType(String),

    #[error("maxNumConcurrentSubTasks must be at least 1")]
    ZeroConcurrency,

    #[error("awaitSegmentAvailabilityTimeoutMillis must not be negative, got {0}")]
    NegativeAvailabilityTimeout(i64),
}

/// What the rows of an ingestion look like and how they are rolled up.
#[derive(Debug, Clone)]
pub struct IngestSchema {
    pub data_source: DataSourceName,
    pub timestamp_spec: TimestampSpec,
    /// `None` when dimensions are discovered from the input.
    pub dimensions: Option<Vec<String>>,
    pub metrics: Vec<AggregatorFactory>,
    pub segment_granularity: Granularity,
    pub query_granularity: Granularity,
    pub rollup: bool,
    pub intervals: Vec<Interval>,
    /// Fields never discovered as dimensions.
    excluded: BTreeSet<String>,
}

impl IngestSchema {
    /// Whether `instant` falls inside the ingestion intervals; every instant does when no
    /// intervals are given.
    pub fn accepts(&self, instant: DateTime<Utc>) -> bool {
        self.intervals.is_empty()
            || self
                .intervals
                .iter()
                .any(|interval| interval.contains(instant))
    }

    /// Whether `field` of an input event becomes a dimension under schemaless discovery.
    pub fn is_discoverable(&self, field: &str) -> bool {
        !self.excluded.contains(field)
    }
}

/// A spec that passed validation.
#[derive(Debug, Clone)]
pub struct IngestionPlan {
    pub schema: IngestSchema,
    pub partitions: DynamicPartitionsSpec,
    pub split_limits: SplitLimits,
    pub max_num_concurrent_sub_tasks: Option<usize>,
    /// Zero skips waiting for availability.
    pub availability_timeout: Duration,
}

impl ParallelIndexIngestionSpec {
    /// Checks the task spec can run on the best-effort path and resolves defaults.
    pub fn validate(&self) -> Result<IngestionPlan, ConfigurationError> {
        let tuning = &self.tuning_config;

        if tuning.force_guaranteed_rollup {
            return Err(ConfigurationError::ForceGuaranteedRollup);
        }
        let partitions = match tuning.partitions_spec() {
            spec if spec.is_force_guaranteed_rollup_compatible() => {
                return Err(ConfigurationError::GuaranteedRollupPartitionsSpec(
                    spec.kind(),
                ));
            }
            PartitionsSpec::Dynamic(dynamic) => dynamic,
            spec => return Err(ConfigurationError::UnsupportedPartitionsSpec(spec.kind())),
        };

        if self.io_config.append_to_existing {
            return Err(ConfigurationError::AppendToExisting);
        }

        let split_limits = tuning.split_hint_spec.clone().unwrap_or_default().limits()?;

        if tuning.max_num_concurrent_sub_tasks == Some(0) {
            return Err(ConfigurationError::ZeroConcurrency);
        }
        let availability_timeout = match tuning.await_segment_availability_timeout_millis {
            millis if millis < 0 => {
                return Err(ConfigurationError::NegativeAvailabilityTimeout(millis));
            }
            millis => Duration::from_millis(millis as u64),
        };

        Ok(IngestionPlan {
            schema: self.data_schema.ingest_schema()?,
            partitions,
            split_limits,
            max_num_concurrent_sub_tasks: tuning.max_num_concurrent_sub_tasks,
            availability_timeout,
        })
    }
}

impl DataSchema {
    fn ingest_schema(&self) -> Result<IngestSchema, ConfigurationError> {
        let mut columns = HashSet::new();

        let mut dimensions = Vec::with_capacity(self.dimensions_spec.dimensions.len());
        for dimension in &self.dimensions_spec.dimensions {
            let name = dimension.name();
            if name == TIME_COLUMN {
                return Err(ConfigurationError::ReservedColumn(name.to_string()));
            }
            if !dimension.is_string() {
                return Err(ConfigurationError::UnsupportedDimensionType(name.to_string()));
            }
            if !columns.insert(name) {
                return Err(ConfigurationError::DuplicateColumn(name.to_string()));
            }
            dimensions.push(name.to_string());
        }
        for metric in &self.metrics_spec {
            let name = metric.name();
            if name == TIME_COLUMN {
                return Err(ConfigurationError::ReservedColumn(name.to_string()));
            }
            if !columns.insert(name) {
                return Err(ConfigurationError::DuplicateColumn(name.to_string()));
            }
        }

        let mut excluded: BTreeSet<String> = self
            .dimensions_spec
            .dimension_exclusions
            .iter()
            .cloned()
            .collect();
        excluded.insert(self.timestamp_spec.column.clone());
        excluded.insert(TIME_COLUMN.to_string());
        for metric in &self.metrics_spec {
            excluded.insert(metric.name().to_string());
            if let Some(field) = metric.field_name() {
                excluded.insert(field.to_string());
            }
        }

        let granularity = &self.granularity_spec;
        Ok(IngestSchema {
            data_source: self.data_source.clone(),
            timestamp_spec: self.timestamp_spec.clone(),
            dimensions: (!dimensions.is_empty()).then_some(dimensions),
            metrics: self.metrics_spec.clone(),
            segment_granularity: granularity.segment_granularity,
            query_granularity: granularity.query_granularity,
            rollup: granularity.rollup,
            intervals: granularity.intervals.clone(),
            excluded,
        })
    }
}
