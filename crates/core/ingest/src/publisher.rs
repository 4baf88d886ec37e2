//! Atomic publishing of a task's segments to metadata storage.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use common::{DataSegmentWithSchema, SchemaFingerprint, SchemaPayload};
use metadata_db::{CommitError, MetadataDb, NewSegment, segments};
use monitoring::{logging, telemetry::metrics::KeyValue};

use crate::{metrics::MetricsRegistry, report::PublishResult};

#[cfg(test)]
mod tests {
    mod it_publish;
}

/// Commits the segments of a task as one unit.
#[derive(Debug, Clone)]
pub struct SegmentPublisher {
    metadata_db: MetadataDb,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl SegmentPublisher {
    pub fn new(metadata_db: MetadataDb, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        Self {
            metadata_db,
            metrics,
        }
    }

    /// Publishes every candidate that carries a segment, together with the schemas they were
    /// written with. Either all of them become used or none do.
    ///
    /// Candidates without a segment have nothing to publish and are skipped. A candidate without
    /// a schema is published without a fingerprint. Commits that fail to reach the database are
    /// retried; conflicts with other segments are not.
    #[tracing::instrument(skip_all, fields(candidates = candidates.len()), err)]
    pub async fn publish(
        &self,
        candidates: Vec<DataSegmentWithSchema>,
    ) -> Result<PublishResult, PublishError> {
        let mut new_segments = Vec::with_capacity(candidates.len());
        let mut schemas: BTreeMap<SchemaFingerprint, SchemaPayload> = BTreeMap::new();
        let mut published = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let Some(segment) = candidate.data_segment() else {
                tracing::warn!(
                    has_schema = candidate.segment_schema().is_some(),
                    "skipping publish candidate without a segment"
                );
                continue;
            };

            let schema_fingerprint = match candidate.segment_schema() {
                Some(schema) => {
                    let fingerprint = schema
                        .schema_payload
                        .fingerprint()
                        .map_err(PublishError::Fingerprint)?;
                    schemas
                        .entry(fingerprint.clone())
                        .or_insert_with(|| schema.schema_payload.clone());
                    Some(fingerprint)
                }
                None => None,
            };

            new_segments.push(NewSegment {
                segment: segment.clone(),
                schema_fingerprint,
            });
            published.push(candidate);
        }

        if new_segments.is_empty() {
            tracing::info!("nothing to publish");
            return Ok(PublishResult::default());
        }

        let schemas: Vec<_> = schemas.into_iter().collect();
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(5);

        fn notify_retry(err: &CommitError, dur: Duration) {
            tracing::warn!(
                error = %err,
                error_source = logging::error_source(err),
                "Failed to reach metadata db during publish. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        }

        let outcome = (|| segments::commit(&self.metadata_db, &new_segments, &schemas))
            .retry(retry_policy)
            .when(is_transient)
            .notify(notify_retry)
            .await?;

        if let Some(metrics) = &self.metrics {
            for new in &new_segments {
                metrics.segments_published.inc_with_kvs(&[KeyValue::new(
                    "data_source",
                    new.segment.data_source.to_string(),
                )]);
            }
        }
        tracing::info!(
            segments = new_segments.len(),
            schemas = schemas.len(),
            overshadowed = outcome.overshadowed.len(),
            "segments published"
        );

        Ok(PublishResult {
            segments: published,
            overshadowed: outcome.overshadowed.len() as u64,
        })
    }
}

fn is_transient(err: &CommitError) -> bool {
    matches!(err, CommitError::Db(err) if err.is_connection_error())
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The commit was rejected or failed; nothing was published.
    #[error("failed to commit segments")]
    Commit(#[from] CommitError),

    #[error("failed to fingerprint segment schema")]
    Fingerprint(#[source] serde_json::Error),
}

impl PublishError {
    /// Whether another publish got in the way, as opposed to a storage failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PublishError::Commit(err) if err.is_conflict())
    }
}
