//! In-tree DB integration tests for publishing segment sets

use common::{
    AggregatorFactory, DataSegment, DataSegmentWithSchema, LoadSpec, SchemaPayload,
    SchemaPayloadPlus, SegmentVersion, ShardSpec,
};
use metadata_db::{MetadataDb, schemas, segments};
use pretty_assertions::assert_eq;

use crate::publisher::SegmentPublisher;

fn segment(interval: &str, version: &str, partition_num: u32) -> DataSegment {
    DataSegment {
        data_source: "wikipedia".parse().expect("Failed to parse datasource name"),
        interval: interval.parse().expect("Failed to parse interval"),
        version: SegmentVersion::from_stored(version),
        load_spec: LoadSpec::ObjectStore {
            path: format!("wikipedia/{partition_num}.parquet"),
        },
        dimensions: vec!["page".into()],
        metrics: vec!["count".into()],
        shard_spec: ShardSpec::Numbered {
            partition_num,
            partitions: 2,
        },
        num_rows: 3,
        size: 100,
    }
}

fn schema() -> SchemaPayloadPlus {
    SchemaPayloadPlus::new(
        SchemaPayload::for_columns(
            &["page".to_string()],
            &[AggregatorFactory::Count {
                name: "count".into(),
            }],
        ),
        3,
    )
}

const V1: &str = "2026-01-01T00:00:00.000Z";
const V2: &str = "2026-01-02T00:00:00.000Z";
const DAY: &str = "2013-08-31/2013-09-01";

#[tokio::test]
async fn publish_commits_segments_and_one_schema_per_fingerprint() {
    //* Given
    let db = MetadataDb::in_memory()
        .await
        .expect("Failed to open metadata db");
    let publisher = SegmentPublisher::new(db.clone(), None);
    let candidates = vec![
        DataSegmentWithSchema::new(segment(DAY, V1, 0), schema()),
        DataSegmentWithSchema::new(segment(DAY, V1, 1), schema()),
    ];

    //* When
    let result = publisher
        .publish(candidates.clone())
        .await
        .expect("Failed to publish segments");

    //* Then
    assert_eq!(result.segments, candidates);
    let used = segments::list_used(&db, "wikipedia", None)
        .await
        .expect("Failed to list used segments");
    assert_eq!(
        used.iter().map(|segment| segment.id()).collect::<Vec<_>>(),
        result.segment_ids()
    );
    assert_eq!(schemas::count(&db).await.expect("Failed to count schemas"), 1);

    let fingerprint = schema()
        .schema_payload
        .fingerprint()
        .expect("Failed to fingerprint schema");
    let record = segments::get(&db, &result.segment_ids()[0])
        .await
        .expect("Failed to get segment")
        .expect("segment should exist");
    assert_eq!(record.schema_fingerprint, Some(fingerprint));
}

#[tokio::test]
async fn candidates_without_segment_are_skipped() {
    //* Given
    let db = MetadataDb::in_memory()
        .await
        .expect("Failed to open metadata db");
    let publisher = SegmentPublisher::new(db.clone(), None);
    let candidates = vec![
        DataSegmentWithSchema::new(None::<DataSegment>, schema()),
        DataSegmentWithSchema::new(segment(DAY, V1, 0), None::<SchemaPayloadPlus>),
    ];

    //* When
    let result = publisher
        .publish(candidates)
        .await
        .expect("Failed to publish segments");

    //* Then
    assert_eq!(result.segments.len(), 1);
    let record = segments::get(&db, &result.segment_ids()[0])
        .await
        .expect("Failed to get segment")
        .expect("segment should exist");
    assert_eq!(record.schema_fingerprint, None);
    assert_eq!(schemas::count(&db).await.expect("Failed to count schemas"), 0);
}

#[tokio::test]
async fn conflicting_publish_leaves_nothing_behind() {
    //* Given
    let db = MetadataDb::in_memory()
        .await
        .expect("Failed to open metadata db");
    let publisher = SegmentPublisher::new(db.clone(), None);
    publisher
        .publish(vec![DataSegmentWithSchema::new(segment(DAY, V2, 0), schema())])
        .await
        .expect("Failed to publish newer segment");

    //* When
    let result = publisher
        .publish(vec![
            DataSegmentWithSchema::new(segment("2013-09-01/2013-09-02", V1, 0), schema()),
            DataSegmentWithSchema::new(segment(DAY, V1, 0), schema()),
        ])
        .await;

    //* Then
    let err = result.expect_err("Publishing under a newer version should fail");
    assert!(err.is_conflict());
    let used = segments::list_used(&db, "wikipedia", None)
        .await
        .expect("Failed to list used segments");
    assert_eq!(
        used.iter()
            .map(|segment| segment.version.as_str().to_string())
            .collect::<Vec<_>>(),
        vec![V2.to_string()]
    );
}

#[tokio::test]
async fn newer_publish_overshadows_older_segments() {
    //* Given
    let db = MetadataDb::in_memory()
        .await
        .expect("Failed to open metadata db");
    let publisher = SegmentPublisher::new(db.clone(), None);
    publisher
        .publish(vec![
            DataSegmentWithSchema::new(segment(DAY, V1, 0), schema()),
            DataSegmentWithSchema::new(segment(DAY, V1, 1), schema()),
        ])
        .await
        .expect("Failed to publish first version");

    //* When
    let result = publisher
        .publish(vec![DataSegmentWithSchema::new(segment(DAY, V2, 0), schema())])
        .await
        .expect("Failed to publish second version");

    //* Then
    assert_eq!(result.overshadowed, 2);
    let used = segments::list_used(&db, "wikipedia", None)
        .await
        .expect("Failed to list used segments");
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].version.as_str(), V2);
}
