//! In-process coordinator.
//!
//! Simulates segment loading: every load cycle replaces the served set with the used segments
//! found in metadata storage, unless coordination is paused.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use common::{BoxError, SegmentId};
use metadata_db::MetadataDb;
use monitoring::logging;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{CoordinationPauseControl, CoordinatorClient, CoordinatorDynamicConfig};

/// Default delay between two load cycles.
pub const DEFAULT_LOAD_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct LocalCoordinator {
    metadata_db: MetadataDb,
    load_period: Duration,
    paused: AtomicBool,
    served: RwLock<BTreeSet<SegmentId>>,
}

impl LocalCoordinator {
    pub fn new(metadata_db: MetadataDb, load_period: Duration) -> Self {
        Self {
            metadata_db,
            load_period,
            paused: AtomicBool::new(false),
            served: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn dynamic_config(&self) -> CoordinatorDynamicConfig {
        CoordinatorDynamicConfig {
            pause_coordination: self.is_paused(),
            ..Default::default()
        }
    }

    pub fn set_dynamic_config(&self, config: &CoordinatorDynamicConfig) {
        let was_paused = self
            .paused
            .swap(config.pause_coordination, Ordering::SeqCst);
        if was_paused != config.pause_coordination {
            tracing::info!(paused = config.pause_coordination, "coordination pause toggled");
        }
    }

    /// Runs one load cycle.
    ///
    /// Returns `false` without touching the served set while coordination is paused.
    #[instrument(skip(self), err)]
    pub async fn run_once(&self) -> Result<bool, metadata_db::Error> {
        if self.is_paused() {
            tracing::debug!("coordination paused, skipping load cycle");
            return Ok(false);
        }

        let used: BTreeSet<SegmentId> = metadata_db::segments::list_all_used(&self.metadata_db)
            .await?
            .iter()
            .map(|segment| segment.id())
            .collect();

        // The flag may have been set while metadata was being read
        if self.is_paused() {
            return Ok(false);
        }

        let mut served = self.served.write().await;
        let loaded = used.difference(&served).count();
        let dropped = served.difference(&used).count();
        if loaded > 0 || dropped > 0 {
            tracing::debug!(loaded, dropped, "served segments changed");
        }
        *served = used;

        Ok(true)
    }

    /// Runs load cycles every load period until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if let Err(err) = self.run_once().await {
                tracing::warn!(
                    error = %err,
                    error_source = %logging::error_source(&err),
                    "load cycle failed"
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.load_period) => {}
            }
        }
        tracing::debug!("coordinator stopped");
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(cancel))
    }

    /// Served segments of `datasource`, in id order.
    pub async fn served_segments(&self, datasource: &str) -> Vec<SegmentId> {
        self.served
            .read()
            .await
            .iter()
            .filter(|id| id.data_source.as_str() == datasource)
            .cloned()
            .collect()
    }

    /// Percentage of used segments currently served, per datasource.
    #[instrument(skip(self), err)]
    pub async fn load_status(&self) -> Result<BTreeMap<String, f64>, metadata_db::Error> {
        let used = metadata_db::segments::list_all_used(&self.metadata_db).await?;
        let served = self.served.read().await;

        let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for segment in &used {
            let (total, loaded) = counts
                .entry(segment.data_source.to_string())
                .or_default();
            *total += 1;
            if served.contains(&segment.id()) {
                *loaded += 1;
            }
        }

        Ok(counts
            .into_iter()
            .map(|(datasource, (total, loaded))| {
                (datasource, 100.0 * loaded as f64 / total as f64)
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl CoordinatorClient for LocalCoordinator {
    async fn segments_served(
        &self,
        ids: &[SegmentId],
    ) -> Result<BTreeMap<SegmentId, bool>, BoxError> {
        let served = self.served.read().await;
        Ok(ids
            .iter()
            .map(|id| (id.clone(), served.contains(id)))
            .collect())
    }
}

#[async_trait::async_trait]
impl CoordinationPauseControl for LocalCoordinator {
    async fn set_paused(&self, paused: bool) -> Result<(), BoxError> {
        self.set_dynamic_config(&CoordinatorDynamicConfig {
            pause_coordination: paused,
            ..Default::default()
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    mod it_load;
}
