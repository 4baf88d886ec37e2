//! The HTTP client against a served in-process coordinator

use std::{sync::Arc, time::Duration};

use common::{DataSegment, LoadSpec, SegmentVersion, ShardSpec};
use coordinator::{
    CoordinationPauseControl, CoordinatorClient, HttpCoordinatorClient, LocalCoordinator, api,
};
use metadata_db::{MetadataDb, NewSegment, segments};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

struct Fixture {
    db: MetadataDb,
    coordinator: Arc<LocalCoordinator>,
    client: HttpCoordinatorClient,
    shutdown: CancellationToken,
}

impl Fixture {
    async fn start() -> Self {
        let db = MetadataDb::in_memory()
            .await
            .expect("Failed to open metadata db");
        let coordinator = Arc::new(LocalCoordinator::new(db.clone(), Duration::from_millis(10)));
        let shutdown = CancellationToken::new();

        let (addr, server) = api::serve(
            "127.0.0.1:0".parse().expect("Failed to parse address"),
            coordinator.clone(),
            shutdown.clone().cancelled_owned(),
        )
        .await
        .expect("Failed to bind coordinator api");
        tokio::spawn(server);

        let client = HttpCoordinatorClient::new(
            format!("http://{addr}/").parse().expect("Failed to parse url"),
        );

        Self {
            db,
            coordinator,
            client,
            shutdown,
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn segment(partition_num: u32) -> DataSegment {
    DataSegment {
        data_source: "wikipedia".parse().expect("Failed to parse datasource name"),
        interval: "2013-08-31/2013-09-01".parse().expect("Failed to parse interval"),
        version: SegmentVersion::from_stored("2026-03-01T00:00:00.000Z"),
        load_spec: LoadSpec::ObjectStore {
            path: format!("wikipedia/{partition_num}.parquet"),
        },
        dimensions: vec!["page".into()],
        metrics: vec!["count".into()],
        shard_spec: ShardSpec::Numbered {
            partition_num,
            partitions: 0,
        },
        num_rows: 1,
        size: 1,
    }
}

#[tokio::test]
async fn segments_served_through_http_matches_local_view() {
    //* Given
    let fixture = Fixture::start().await;
    let loaded = segment(0);
    let pending = segment(1);

    segments::commit(
        &fixture.db,
        &[NewSegment {
            segment: loaded.clone(),
            schema_fingerprint: None,
        }],
        &[],
    )
    .await
    .expect("Failed to commit segment");
    fixture
        .coordinator
        .run_once()
        .await
        .expect("Load cycle failed");

    //* When
    let served = fixture
        .client
        .segments_served(&[loaded.id(), pending.id()])
        .await
        .expect("Failed to query served segments");

    //* Then
    assert_eq!(served.get(&loaded.id()), Some(&true));
    assert_eq!(served.get(&pending.id()), Some(&false));
}

#[tokio::test]
async fn unknown_datasource_has_no_served_segments() {
    //* Given
    let fixture = Fixture::start().await;

    //* When
    let served = fixture
        .client
        .served_segment_ids("nothing_here")
        .await
        .expect("Failed to query served segments");

    //* Then
    assert!(served.is_empty());
}

#[tokio::test]
async fn pause_control_toggles_remote_coordination() {
    //* Given
    let fixture = Fixture::start().await;

    //* When
    fixture
        .client
        .set_paused(true)
        .await
        .expect("Failed to pause coordination");
    let paused = fixture.coordinator.is_paused();
    let remote = fixture
        .client
        .dynamic_config()
        .await
        .expect("Failed to read dynamic config");

    fixture
        .client
        .set_paused(false)
        .await
        .expect("Failed to resume coordination");

    //* Then
    assert!(paused);
    assert!(remote.pause_coordination);
    assert!(!fixture.coordinator.is_paused());
}

#[tokio::test]
async fn load_status_is_reported_per_datasource() {
    //* Given
    let fixture = Fixture::start().await;
    segments::commit(
        &fixture.db,
        &[NewSegment {
            segment: segment(0),
            schema_fingerprint: None,
        }],
        &[],
    )
    .await
    .expect("Failed to commit segment");

    //* When
    let status = fixture
        .client
        .load_status()
        .await
        .expect("Failed to read load status");

    //* Then
    assert_eq!(status.get("wikipedia"), Some(&0.0));
}
