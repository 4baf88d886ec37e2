//! Waiting for published segments to be served.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use common::SegmentId;
use coordinator::CoordinatorClient;
use monitoring::{logging, telemetry::metrics::KeyValue};
use tokio_util::sync::CancellationToken;

use crate::{metrics::MetricsRegistry, report::AvailabilityOutcome};

/// Polls the coordinator until a set of segments is served or a deadline passes.
#[derive(Debug, Clone)]
pub struct AvailabilityWaiter {
    client: Arc<dyn CoordinatorClient>,
    poll_interval: Duration,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl AvailabilityWaiter {
    pub fn new(
        client: Arc<dyn CoordinatorClient>,
        poll_interval: Duration,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            client,
            poll_interval,
            metrics,
        }
    }

    /// Waits until every segment in `ids` is served, for at most `timeout`.
    ///
    /// The coordinator is asked at least once however short the timeout. Running out of time is
    /// not an error: the outcome then reports the segments not seen served as `false`. A segment
    /// seen served once counts as served for the rest of the wait. Errors from the coordinator
    /// are logged and the poll retried on the next tick.
    #[tracing::instrument(skip_all, fields(segments = ids.len(), timeout_ms = timeout.as_millis() as u64), err)]
    pub async fn wait(
        &self,
        ids: &[SegmentId],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AvailabilityOutcome, Cancelled> {
        let mut per_segment: BTreeMap<SegmentId, bool> =
            ids.iter().map(|id| (id.clone(), false)).collect();
        if per_segment.is_empty() {
            return Ok(AvailabilityOutcome { per_segment });
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let mut polls = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            let pending: Vec<SegmentId> = per_segment
                .iter()
                .filter(|(_, served)| !**served)
                .map(|(id, _)| id.clone())
                .collect();
            polls += 1;

            // A poll may outlive the deadline by at most one interval
            let budget = deadline
                .saturating_duration_since(Instant::now())
                .max(self.poll_interval);
            let poll = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                poll = tokio::time::timeout(budget, self.client.segments_served(&pending)) => poll,
            };
            match poll {
                Ok(Ok(served)) => {
                    for (id, is_served) in served {
                        if !is_served {
                            continue;
                        }
                        if let Some(entry) = per_segment.get_mut(&id) {
                            *entry = true;
                        }
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        error = %err,
                        error_source = logging::error_source(&*err),
                        "Failed to check segment availability. Retrying on next poll"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        budget_ms = budget.as_millis() as u64,
                        "Segment availability check timed out. Retrying on next poll"
                    );
                }
            }

            let outcome = AvailabilityOutcome {
                per_segment: per_segment.clone(),
            };
            if outcome.confirmed() {
                tracing::info!(polls, elapsed_ms = started.elapsed().as_millis() as u64, "all segments served");
                self.record(&outcome, started, ids);
                return Ok(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                let unconfirmed = outcome.per_segment.values().filter(|served| !**served).count();
                tracing::warn!(polls, unconfirmed, "timed out waiting for segments to be served");
                self.record(&outcome, started, ids);
                return Ok(outcome);
            }

            let sleep = self.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    fn record(&self, outcome: &AvailabilityOutcome, started: Instant, ids: &[SegmentId]) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let data_source = ids
            .first()
            .map(|id| id.data_source.to_string())
            .unwrap_or_default();
        let kvs = [KeyValue::new("data_source", data_source)];
        metrics
            .availability_wait_ms
            .record_with_kvs(started.elapsed().as_secs_f64() * 1000.0, &kvs);
        if !outcome.confirmed() {
            metrics.availability_timeouts.inc_with_kvs(&kvs);
        }
    }
}

/// The wait was cancelled before it could finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("waiting for segment availability was cancelled")]
pub struct Cancelled;
