//! In-tree DB integration tests for atomic segment commits

use common::{
    AggregatorFactory, DataSegment, LoadSpec, SchemaPayload, SegmentVersion, ShardSpec,
};
use pretty_assertions::assert_eq;

use crate::{CommitError, MetadataDb, NewSegment, schemas, segments};

fn segment(interval: &str, version: &str, partition_num: u32) -> DataSegment {
    DataSegment {
        data_source: "wikipedia".parse().expect("Failed to parse datasource name"),
        interval: interval.parse().expect("Failed to parse interval"),
        version: SegmentVersion::from_stored(version),
        load_spec: LoadSpec::ObjectStore {
            path: format!("wikipedia/{interval}/{version}/{partition_num}.parquet"),
        },
        dimensions: vec!["page".into()],
        metrics: vec!["count".into()],
        shard_spec: ShardSpec::Numbered {
            partition_num,
            partitions: 0,
        },
        num_rows: 10,
        size: 2048,
    }
}

fn new_segment(interval: &str, version: &str, partition_num: u32) -> NewSegment {
    NewSegment {
        segment: segment(interval, version, partition_num),
        schema_fingerprint: None,
    }
}

const V1: &str = "2026-01-01T00:00:00.000Z";
const V2: &str = "2026-01-02T00:00:00.000Z";
const DAY_1: &str = "2013-08-31/2013-09-01";
const DAY_2: &str = "2013-09-01/2013-09-02";

#[tokio::test]
async fn commit_makes_all_segments_and_schemas_visible() {
    //* Given
    let db = MetadataDb::in_memory()
        .await
        .expect("Failed to open metadata db");

    let payload = SchemaPayload::for_columns(
        &["page".to_string()],
        &[AggregatorFactory::Count {
            name: "count".into(),
        }],
    );
    let fingerprint = payload.fingerprint().expect("Failed to fingerprint schema");
    let candidates = vec![
        NewSegment {
            segment: segment(DAY_1, V1, 0),
            schema_fingerprint: Some(fingerprint.clone()),
        },
        NewSegment {
            segment: segment(DAY_1, V1, 1),
            schema_fingerprint: Some(fingerprint.clone()),
        },
        NewSegment {
            segment: segment(DAY_2, V1, 0),
            schema_fingerprint: Some(fingerprint.clone()),
        },
    ];

    //* When
    let outcome = segments::commit(&db, &candidates, &[(fingerprint.clone(), payload.clone())])
        .await
        .expect("Failed to commit segments");

    //* Then
    assert!(outcome.overshadowed.is_empty());

    let used = segments::list_used(&db, "wikipedia", None)
        .await
        .expect("Failed to list used segments");
    let expected: Vec<DataSegment> = candidates.into_iter().map(|c| c.segment).collect();
    assert_eq!(used, expected);

    let stored = schemas::get_by_fingerprint(&db, &fingerprint)
        .await
        .expect("Failed to get schema");
    assert_eq!(stored, Some(payload));

    let record = segments::get(&db, &expected[1].id())
        .await
        .expect("Failed to get segment")
        .expect("Segment not found");
    assert!(record.used);
    assert_eq!(record.schema_fingerprint, Some(fingerprint));
}

#[tokio::test]
async fn shared_schema_is_stored_once() {
    //* Given
    let db = MetadataDb::in_memory()
        .await
        .expect("Failed to open metadata db");
    let payload = SchemaPayload::for_columns(&[], &[]);
    let fingerprint = payload.fingerprint().expect("Failed to fingerprint schema");

    //* When
    for (interval, version) in [(DAY_1, V1), (DAY_2, V1)] {
        let candidate = NewSegment {
            segment: segment(interval, version, 0),
            schema_fingerprint: Some(fingerprint.clone()),
        };
        segments::commit(&db, &[candidate], &[(fingerprint.clone(), payload.clone())])
            .await
            .expect("Failed to commit segment");
    }

    //* Then
    let count = schemas::count(&db).await.expect("Failed to count schemas");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn newer_version_overshadows_covered_older_segments() {
    //* Given
    let db = MetadataDb::in_memory()
        .await
        .expect("Failed to open metadata db");
    segments::commit(
        &db,
        &[
            new_segment(DAY_1, V1, 0),
            new_segment(DAY_1, V1, 1),
            new_segment(DAY_2, V1, 0),
        ],
        &[],
    )
    .await
    .expect("Failed to commit first version");

    //* When
    let outcome = segments::commit(&db, &[new_segment(DAY_1, V2, 0)], &[])
        .await
        .expect("Failed to commit second version");

    //* Then
    let mut expected_overshadowed = vec![
        segment(DAY_1, V1, 0).id().to_string(),
        segment(DAY_1, V1, 1).id().to_string(),
    ];
    expected_overshadowed.sort();
    assert_eq!(outcome.overshadowed, expected_overshadowed);

    let used = segments::list_used(&db, "wikipedia", None)
        .await
        .expect("Failed to list used segments");
    assert_eq!(used, vec![segment(DAY_1, V2, 0), segment(DAY_2, V1, 0)]);

    let old = segments::get(&db, &segment(DAY_1, V1, 0).id())
        .await
        .expect("Failed to get segment")
        .expect("Segment not found");
    assert!(!old.used);
}

#[tokio::test]
async fn older_version_over_newer_used_segment_is_rejected() {
    //* Given
    let db = MetadataDb::in_memory()
        .await
        .expect("Failed to open metadata db");
    segments::commit(&db, &[new_segment(DAY_1, V2, 0)], &[])
        .await
        .expect("Failed to commit newer version");

    //* When
    let result = segments::commit(
        &db,
        &[new_segment(DAY_2, V1, 0), new_segment(DAY_1, V1, 0)],
        &[],
    )
    .await;

    //* Then
    let err = result.expect_err("commit should be rejected");
    assert!(matches!(err, CommitError::VersionConflict { .. }), "{err:?}");
    assert!(err.is_conflict());

    // The non-conflicting segment of the same commit must not be visible either
    let used = segments::list_used(&db, "wikipedia", None)
        .await
        .expect("Failed to list used segments");
    assert_eq!(used, vec![segment(DAY_1, V2, 0)]);
}

#[tokio::test]
async fn recommitting_an_identity_is_rejected() {
    //* Given
    let db = MetadataDb::in_memory()
        .await
        .expect("Failed to open metadata db");
    segments::commit(&db, &[new_segment(DAY_1, V1, 0)], &[])
        .await
        .expect("Failed to commit segment");

    //* When
    let result = segments::commit(&db, &[new_segment(DAY_1, V1, 0)], &[]).await;

    //* Then
    assert!(matches!(result, Err(CommitError::AlreadyCommitted(_))));
}

#[tokio::test]
async fn commit_to_a_file_database_persists_across_connections() {
    //* Given
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("metadata.db").display());
    let db = MetadataDb::connect(&url, 2)
        .await
        .expect("Failed to open metadata db");

    //* When
    segments::commit(&db, &[new_segment(DAY_1, V1, 0)], &[])
        .await
        .expect("Failed to commit segment");
    drop(db);

    //* Then
    let reopened = MetadataDb::connect(&url, 2)
        .await
        .expect("Failed to reopen metadata db");
    let used = segments::list_used(&reopened, "wikipedia", None)
        .await
        .expect("Failed to list used segments");
    assert_eq!(used, vec![segment(DAY_1, V1, 0)]);
}
