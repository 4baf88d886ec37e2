//! Input sources and their division into splits.

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use common::{DataSegment, DataSourceName, Interval};
use metadata_db::MetadataDb;
use serde::{Deserialize, Serialize};

mod reader;

pub use self::reader::{InputRecord, ReadError, SegmentFormatError, read_unit};

/// Where the rows of an ingestion come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputSource {
    /// Files under `base_dir` whose name matches `filter`, searched recursively, plus any
    /// explicitly listed `files`.
    #[serde(rename_all = "camelCase")]
    Local {
        #[serde(default)]
        base_dir: Option<PathBuf>,
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        files: Vec<PathBuf>,
    },
    /// Newline-delimited rows embedded in the task.
    Inline { data: String },
    /// The visible segments of an existing datasource, for reindexing.
    #[serde(rename_all = "camelCase")]
    Druid {
        data_source: DataSourceName,
        #[serde(default)]
        interval: Option<Interval>,
    },
}

/// Bounds of a single split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitLimits {
    pub max_bytes: u64,
    pub max_units: usize,
}

/// A slice of the input read by exactly one sub-task.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSplit {
    /// Position of the split in input order.
    pub index: usize,
    pub units: Vec<InputUnit>,
}

impl InputSplit {
    pub fn size(&self) -> u64 {
        self.units.iter().map(InputUnit::size).sum()
    }
}

/// The smallest independently readable piece of input.
#[derive(Debug, Clone, PartialEq)]
pub enum InputUnit {
    File {
        path: PathBuf,
        size: u64,
    },
    Inline {
        data: Arc<str>,
    },
    Segment {
        segment: DataSegment,
        /// Only rows inside this interval are read.
        interval: Option<Interval>,
        /// Parts of the segment covered by newer used segments, whose rows are skipped.
        shadowed: Vec<Interval>,
    },
}

impl InputUnit {
    pub fn size(&self) -> u64 {
        match self {
            InputUnit::File { size, .. } => *size,
            InputUnit::Inline { data } => data.len() as u64,
            InputUnit::Segment { segment, .. } => segment.size,
        }
    }
}

impl fmt::Display for InputUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputUnit::File { path, .. } => write!(f, "file {}", path.display()),
            InputUnit::Inline { .. } => f.write_str("inline data"),
            InputUnit::Segment { segment, .. } => write!(f, "segment {}", segment.id()),
        }
    }
}

impl InputSource {
    /// Lists the input units and groups them into splits within `limits`.
    ///
    /// Units keep their input order; every unit lands in exactly one split.
    #[tracing::instrument(skip_all, err)]
    pub async fn create_splits(
        &self,
        metadata_db: &MetadataDb,
        limits: &SplitLimits,
    ) -> Result<Vec<InputSplit>, CreateSplitsError> {
        let units = match self {
            InputSource::Local {
                base_dir,
                filter,
                files,
            } => local_units(base_dir.as_deref(), filter.as_deref(), files).await?,
            InputSource::Inline { data } => vec![InputUnit::Inline {
                data: Arc::from(data.as_str()),
            }],
            InputSource::Druid {
                data_source,
                interval,
            } => {
                let segments =
                    metadata_db::segments::list_used(metadata_db, data_source, interval.as_ref())
                        .await
                        .map_err(CreateSplitsError::Metadata)?;
                segment_units(segments, *interval)
            }
        };

        let splits = group_into_splits(units, limits);
        tracing::info!(splits = splits.len(), "created input splits");
        Ok(splits)
    }
}

async fn local_units(
    base_dir: Option<&Path>,
    filter: Option<&str>,
    files: &[PathBuf],
) -> Result<Vec<InputUnit>, CreateSplitsError> {
    if base_dir.is_none() && files.is_empty() {
        return Err(CreateSplitsError::MissingLocalInput);
    }

    let mut units = Vec::new();
    // Canonical paths already listed, so a file is never read twice
    let mut seen = HashSet::new();
    if let Some(base_dir) = base_dir {
        let filter = filter.unwrap_or("*");
        let pattern =
            glob::Pattern::new(filter).map_err(|source| CreateSplitsError::InvalidFilter {
                filter: filter.to_string(),
                source,
            })?;
        let mut found = Vec::new();
        let mut pending = vec![base_dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs_err::tokio::read_dir(&dir)
                .await
                .map_err(CreateSplitsError::ListFiles)?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(CreateSplitsError::ListFiles)?
            {
                let path = entry.path();
                let metadata = fs_err::tokio::metadata(&path)
                    .await
                    .map_err(CreateSplitsError::ListFiles)?;
                if metadata.is_dir() {
                    pending.push(path);
                } else if metadata.is_file()
                    && pattern.matches(&entry.file_name().to_string_lossy())
                {
                    found.push((path, metadata.len()));
                }
            }
        }

        found.sort();
        for (path, size) in found {
            let canonical = fs_err::tokio::canonicalize(&path)
                .await
                .map_err(CreateSplitsError::ListFiles)?;
            if seen.insert(canonical) {
                units.push(InputUnit::File { path, size });
            }
        }
    }

    for path in files {
        let metadata = fs_err::tokio::metadata(path)
            .await
            .map_err(CreateSplitsError::ListFiles)?;
        let canonical = fs_err::tokio::canonicalize(path)
            .await
            .map_err(CreateSplitsError::ListFiles)?;
        if !seen.insert(canonical) {
            tracing::debug!(path = %path.display(), "skipping file listed more than once");
            continue;
        }
        units.push(InputUnit::File {
            path: path.clone(),
            size: metadata.len(),
        });
    }

    Ok(units)
}

/// Turns used segments into units, dropping the ones fully covered by a newer version.
fn segment_units(segments: Vec<DataSegment>, interval: Option<Interval>) -> Vec<InputUnit> {
    let newer_overlapping = |segment: &DataSegment| -> Vec<Interval> {
        let mut intervals: Vec<Interval> = segments
            .iter()
            .filter(|other| {
                other.version > segment.version && other.interval.overlaps(&segment.interval)
            })
            .map(|other| other.interval)
            .collect();
        intervals.sort();
        intervals.dedup();
        intervals
    };

    let units: Vec<InputUnit> = segments
        .iter()
        .filter_map(|segment| {
            let shadowed = newer_overlapping(segment);
            if shadowed
                .iter()
                .any(|newer| newer.encloses(&segment.interval))
            {
                tracing::debug!(segment = %segment.id(), "skipping overshadowed segment");
                return None;
            }
            Some(InputUnit::Segment {
                segment: segment.clone(),
                interval,
                shadowed,
            })
        })
        .collect();
    units
}

/// Greedily packs units into splits in input order.
///
/// A split is closed when the next unit would push it past `max_bytes` or when it holds
/// `max_units` units. Each unit weighs at least one byte, so a limit of one byte yields one split
/// per unit.
pub fn group_into_splits(units: Vec<InputUnit>, limits: &SplitLimits) -> Vec<InputSplit> {
    let mut splits = Vec::new();
    let mut current: Vec<InputUnit> = Vec::new();
    let mut current_bytes = 0u64;

    for unit in units {
        let weight = unit.size().max(1);
        if !current.is_empty()
            && (current_bytes.saturating_add(weight) > limits.max_bytes
                || current.len() >= limits.max_units)
        {
            splits.push(InputSplit {
                index: splits.len(),
                units: std::mem::take(&mut current),
            });
            current_bytes = 0;
        }
        current_bytes = current_bytes.saturating_add(weight);
        current.push(unit);
    }
    if !current.is_empty() {
        splits.push(InputSplit {
            index: splits.len(),
            units: current,
        });
    }

    splits
}

#[derive(Debug, thiserror::Error)]
pub enum CreateSplitsError {
    #[error("local input source needs a baseDir or a list of files")]
    MissingLocalInput,

    #[error("invalid file filter '{filter}'")]
    InvalidFilter {
        filter: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("failed to list input files")]
    ListFiles(#[source] std::io::Error),

    #[error("failed to list segments of the input datasource")]
    Metadata(#[source] metadata_db::Error),
}
