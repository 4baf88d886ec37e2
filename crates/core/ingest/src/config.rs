use std::time::Duration;

use common::parquet::{
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use serde::Deserialize as _;

/// Configuration of the ingestion runtime
///
/// Created from the workspace configuration file by the CLI; task specs may only lower the
/// sub-task concurrency, never raise it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on sub-tasks running at the same time
    pub max_num_concurrent_sub_tasks: usize,

    /// Delay between coordinator polls while awaiting segment availability
    pub availability_poll_interval: Duration,

    /// Parquet file configuration
    pub parquet: ParquetConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_num_concurrent_sub_tasks: default_max_num_concurrent_sub_tasks(),
            availability_poll_interval: ConfigDuration::<1>::default().into(),
            parquet: ParquetConfig::default(),
        }
    }
}

pub fn default_max_num_concurrent_sub_tasks() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ParquetConfig {
    /// Compression algorithm: zstd, lz4, gzip, brotli, snappy, uncompressed (default: zstd(1))
    #[serde(
        default = "default_compression",
        deserialize_with = "deserialize_compression"
    )]
    pub compression: Compression,
    /// Max rows per row group (default: 1048576)
    #[serde(default = "default_max_row_group_rows")]
    pub max_row_group_rows: usize,
}

impl Default for ParquetConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            max_row_group_rows: default_max_row_group_rows(),
        }
    }
}

impl ParquetConfig {
    pub fn writer_properties(&self) -> WriterProperties {
        WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(self.max_row_group_rows.max(1))
            .build()
    }
}

/// A duration configured in (fractional) seconds, falling back to `DEFAULT_SECS` when absent.
#[derive(Debug, Clone, Copy)]
pub struct ConfigDuration<const DEFAULT_SECS: u64>(Duration);

impl<const DEFAULT_SECS: u64> Default for ConfigDuration<DEFAULT_SECS> {
    fn default() -> Self {
        Self(Duration::from_secs(DEFAULT_SECS))
    }
}

impl<const DEFAULT_SECS: u64> From<ConfigDuration<DEFAULT_SECS>> for Duration {
    fn from(val: ConfigDuration<DEFAULT_SECS>) -> Self {
        val.0
    }
}

impl<'de, const DEFAULT_SECS: u64> serde::Deserialize<'de> for ConfigDuration<DEFAULT_SECS> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserialize_duration(deserializer).map(|opt| opt.map_or_else(Self::default, Self))
    }
}

fn default_compression() -> Compression {
    Compression::ZSTD(ZstdLevel::default())
}

fn default_max_row_group_rows() -> usize {
    1024 * 1024
}

fn deserialize_compression<'de, D>(deserializer: D) -> Result<Compression, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <Option<f64>>::deserialize(deserializer)?
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
        .transpose()
}
