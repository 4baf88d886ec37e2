//! Published segment records.
//!
//! A segment record is "used" while it is part of the queryable timeline of its datasource.
//! Publishing a newer version of an interval marks the fully covered older segments unused in the
//! same transaction.

use common::{DataSegment, Interval, SchemaFingerprint, SchemaPayload, SegmentId};
use tracing::instrument;

pub(crate) mod sql;

use crate::{Error, MetadataDb, schemas};

/// A segment to commit, with the fingerprint of its schema if it has one.
///
/// A fingerprint must either be stored already or be part of the same commit.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub segment: DataSegment,
    pub schema_fingerprint: Option<SchemaFingerprint>,
}

/// What a successful commit changed besides inserting the new segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Ids of the previously used segments that were marked unused, sorted.
    pub overshadowed: Vec<String>,
}

/// A stored segment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub segment: DataSegment,
    pub used: bool,
    pub schema_fingerprint: Option<SchemaFingerprint>,
}

/// Commits a set of segments and the schemas they reference as one unit.
///
/// This function performs in a single transaction:
///
///  1. Stores every schema payload not stored yet
///  2. Inserts every segment as used
///  3. Checks that no used segment of a newer version overlaps any of the new segments
///  4. Marks used segments of older versions that are fully covered by a new segment unused
///
/// If any of these steps fail, the transaction is rolled back and nothing becomes visible.
#[instrument(skip_all, fields(segments = segments.len(), schemas = schemas.len()), err)]
pub async fn commit(
    db: &MetadataDb,
    segments: &[NewSegment],
    schemas: &[(SchemaFingerprint, SchemaPayload)],
) -> Result<CommitOutcome, CommitError> {
    let mut tx = db.begin_txn().await?;

    // Writing first takes the database write lock up front, so the conflict checks below see
    // every commit that finished before this one
    for (fingerprint, payload) in schemas {
        let payload = serde_json::to_string(payload).map_err(CommitError::EncodePayload)?;
        schemas::sql::insert(&mut *tx, fingerprint.as_str(), &payload)
            .await
            .map_err(Error::DbError)?;
    }

    for new in segments {
        let id = new.segment.id().to_string();
        let payload = serde_json::to_string(&new.segment).map_err(CommitError::EncodePayload)?;
        let fingerprint = new.schema_fingerprint.as_ref().map(SchemaFingerprint::as_str);

        match sql::insert(&mut *tx, &id, &new.segment, fingerprint, &payload).await {
            Ok(()) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(CommitError::AlreadyCommitted(id));
            }
            Err(err) => return Err(Error::DbError(err).into()),
        }
    }

    for new in segments {
        let segment = &new.segment;
        let newer = sql::find_newer_overlapping(
            &mut *tx,
            segment.data_source.as_str(),
            &segment.interval,
            segment.version.as_str(),
        )
        .await
        .map_err(Error::DbError)?;

        if let Some((existing, existing_version)) = newer {
            return Err(CommitError::VersionConflict {
                segment: segment.id().to_string(),
                existing,
                existing_version,
            });
        }
    }

    let mut overshadowed = Vec::new();
    for new in segments {
        let segment = &new.segment;
        let ids = sql::mark_overshadowed_unused(
            &mut *tx,
            segment.data_source.as_str(),
            &segment.interval,
            segment.version.as_str(),
        )
        .await
        .map_err(Error::DbError)?;
        overshadowed.extend(ids);
    }

    tx.commit().await.map_err(Error::DbError)?;

    overshadowed.sort();
    overshadowed.dedup();
    Ok(CommitOutcome { overshadowed })
}

/// Errors that can occur when committing segments
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// A used segment of a newer version overlaps a segment being committed.
    ///
    /// Another task published over the same interval after this one started. Committing would
    /// put an older version on top of a newer one, so the whole commit is rejected.
    #[error(
        "segment {segment} conflicts with used segment {existing} of newer version {existing_version}"
    )]
    VersionConflict {
        segment: String,
        existing: String,
        existing_version: String,
    },

    /// A segment with the same datasource, interval, version and partition already exists.
    #[error("segment {0} has already been committed")]
    AlreadyCommitted(String),

    #[error("failed to encode payload for commit")]
    EncodePayload(#[source] serde_json::Error),

    #[error("metadata db error during commit")]
    Db(#[from] Error),
}

impl CommitError {
    /// Whether the commit was rejected because of other segments, rather than failing.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CommitError::VersionConflict { .. } | CommitError::AlreadyCommitted(_)
        )
    }
}

/// Used segments of `datasource`, optionally only those overlapping `interval`.
///
/// Ordered by interval start, interval end, version and partition number.
#[instrument(skip(db), err)]
pub async fn list_used(
    db: &MetadataDb,
    datasource: &str,
    interval: Option<&Interval>,
) -> Result<Vec<DataSegment>, Error> {
    let interval = interval.copied().unwrap_or_else(Interval::eternity);
    let payloads = sql::list_used_payloads(db.pool(), datasource, &interval)
        .await
        .map_err(Error::DbError)?;
    decode_all(payloads)
}

/// Used segments of every datasource.
#[instrument(skip(db), err)]
pub async fn list_all_used(db: &MetadataDb) -> Result<Vec<DataSegment>, Error> {
    let payloads = sql::list_all_used_payloads(db.pool())
        .await
        .map_err(Error::DbError)?;
    decode_all(payloads)
}

/// Looks up a segment record by identity, used or not.
#[instrument(skip(db), err)]
pub async fn get(db: &MetadataDb, id: &SegmentId) -> Result<Option<SegmentRecord>, Error> {
    let Some(row) = sql::get_by_identity(db.pool(), id)
        .await
        .map_err(Error::DbError)?
    else {
        return Ok(None);
    };

    Ok(Some(SegmentRecord {
        segment: serde_json::from_str(&row.payload).map_err(Error::PayloadError)?,
        used: row.used,
        schema_fingerprint: row.schema_fingerprint.map(SchemaFingerprint::from_hex),
    }))
}

/// Marks every used segment of `datasource` unused, returning how many changed.
#[instrument(skip(db), err)]
pub async fn mark_datasource_unused(db: &MetadataDb, datasource: &str) -> Result<u64, Error> {
    sql::mark_datasource_unused(db.pool(), datasource)
        .await
        .map_err(Error::DbError)
}

fn decode_all(payloads: Vec<String>) -> Result<Vec<DataSegment>, Error> {
    payloads
        .iter()
        .map(|payload| serde_json::from_str(payload).map_err(Error::PayloadError))
        .collect()
}
