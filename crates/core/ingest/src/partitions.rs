//! Partitioning of ingested rows into segments.

use serde::{Deserialize, Serialize};

/// Default row limit of a single segment under dynamic partitioning.
pub const DEFAULT_MAX_ROWS_PER_SEGMENT: u64 = 5_000_000;

/// Default row limit across all buffered intervals of a sub-task under dynamic partitioning.
pub const DEFAULT_MAX_TOTAL_ROWS: u64 = 20_000_000;

/// How input rows are grouped into segments.
///
/// Serialized with a `type` tag: `dynamic`, `hashed` or `range`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PartitionsSpec {
    #[serde(rename = "dynamic")]
    Dynamic(DynamicPartitionsSpec),
    #[serde(rename = "hashed", alias = "hash")]
    Hashed(HashedPartitionsSpec),
    #[serde(rename = "range")]
    Range(RangePartitionsSpec),
}

impl Default for PartitionsSpec {
    fn default() -> Self {
        PartitionsSpec::Dynamic(DynamicPartitionsSpec::default())
    }
}

impl PartitionsSpec {
    /// Whether the partitions spec carries everything a guaranteed-rollup (globally shuffled) ingestion needs.
    ///
    /// Dynamic partitioning never does. Hashed partitioning needs a shard count or a target row
    /// count; range partitioning needs partition dimensions and a row limit.
    pub fn is_force_guaranteed_rollup_compatible(&self) -> bool {
        match self {
            PartitionsSpec::Dynamic(_) => false,
            PartitionsSpec::Hashed(spec) => {
                spec.num_shards.is_some() || spec.target_rows_per_segment.is_some()
            }
            PartitionsSpec::Range(spec) => {
                !spec.partition_dimensions.is_empty()
                    && (spec.target_rows_per_segment.is_some()
                        || spec.max_rows_per_segment.is_some())
            }
        }
    }

    /// Short name of the variant, as written in task specs.
    pub fn kind(&self) -> &'static str {
        match self {
            PartitionsSpec::Dynamic(_) => "dynamic",
            PartitionsSpec::Hashed(_) => "hashed",
            PartitionsSpec::Range(_) => "range",
        }
    }
}

/// Segments are cut whenever a row limit is reached, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPartitionsSpec {
    #[serde(default)]
    pub max_rows_per_segment: Option<u64>,
    #[serde(default)]
    pub max_total_rows: Option<u64>,
}

impl DynamicPartitionsSpec {
    pub fn max_rows_per_segment(&self) -> u64 {
        self.max_rows_per_segment
            .unwrap_or(DEFAULT_MAX_ROWS_PER_SEGMENT)
            .max(1)
    }

    pub fn max_total_rows(&self) -> u64 {
        self.max_total_rows.unwrap_or(DEFAULT_MAX_TOTAL_ROWS).max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashedPartitionsSpec {
    #[serde(default)]
    pub target_rows_per_segment: Option<u64>,
    #[serde(default)]
    pub num_shards: Option<u32>,
    #[serde(default)]
    pub partition_dimensions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangePartitionsSpec {
    #[serde(default)]
    pub target_rows_per_segment: Option<u64>,
    #[serde(default)]
    pub max_rows_per_segment: Option<u64>,
    #[serde(default)]
    pub partition_dimensions: Vec<String>,
}
