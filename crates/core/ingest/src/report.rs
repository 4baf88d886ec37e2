//! Outcomes of an ingestion task.

use std::{collections::BTreeMap, ops::AddAssign};

use common::{DataSegmentWithSchema, SegmentId};
use serde::Serialize;

/// Input rows seen by the sub-tasks of a task, before rollup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowStats {
    pub processed: u64,
    /// Rows whose timestamp falls outside the ingestion intervals.
    pub thrown_away: u64,
}

impl AddAssign for RowStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.thrown_away += other.thrown_away;
    }
}

/// The segments committed by one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishResult {
    pub segments: Vec<DataSegmentWithSchema>,
    /// Older segments marked unused by the commit.
    pub overshadowed: u64,
}

impl PublishResult {
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments
            .iter()
            .filter_map(|segment| segment.data_segment())
            .map(|segment| segment.id())
            .collect()
    }
}

/// Which published segments the coordinator confirmed as served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityOutcome {
    pub per_segment: BTreeMap<SegmentId, bool>,
}

impl AvailabilityOutcome {
    /// Whether every segment is served; trivially true for no segments.
    pub fn confirmed(&self) -> bool {
        self.per_segment.values().all(|served| *served)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub segments: Vec<SegmentId>,
    /// False when the task was configured not to wait for availability.
    pub availability_checked: bool,
    pub availability_confirmed: bool,
    /// Empty when availability was not checked.
    pub per_segment: BTreeMap<SegmentId, bool>,
    pub row_stats: RowStats,
}

impl TaskReport {
    pub fn new(
        published: &PublishResult,
        availability: Option<&AvailabilityOutcome>,
        row_stats: RowStats,
    ) -> Self {
        Self {
            segments: published.segment_ids(),
            availability_checked: availability.is_some(),
            availability_confirmed: availability.is_some_and(AvailabilityOutcome::confirmed),
            per_segment: availability
                .map(|outcome| outcome.per_segment.clone())
                .unwrap_or_default(),
            row_stats,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failed,
    Cancelled,
}

/// The final word on a task, as printed by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusReport {
    pub id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<TaskReport>,
}

impl TaskStatusReport {
    pub fn success(id: impl Into<String>, report: TaskReport) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Success,
            error_msg: None,
            report: Some(report),
        }
    }

    pub fn failed(id: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Failed,
            error_msg: Some(error_msg.into()),
            report: None,
        }
    }

    pub fn cancelled(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Cancelled,
            error_msg: None,
            report: None,
        }
    }
}
