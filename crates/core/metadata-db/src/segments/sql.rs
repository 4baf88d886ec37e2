//! SQL statements on the `segments` table

use chrono::Utc;
use common::{DataSegment, Interval, SegmentId};

#[derive(Debug, sqlx::FromRow)]
pub struct SegmentRow {
    pub payload: String,
    pub used: bool,
    pub schema_fingerprint: Option<String>,
}

pub async fn insert<'e, E>(
    executor: E,
    id: &str,
    segment: &DataSegment,
    schema_fingerprint: Option<&str>,
    payload: &str,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO segments (
            id, datasource, interval_start, interval_end, version, partition_num,
            used, num_rows, schema_fingerprint, payload, created_date, used_updated_date
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, TRUE, ?7, ?8, ?9, ?10, ?10)
    "#};

    sqlx::query(query)
        .bind(id)
        .bind(segment.data_source.as_str())
        .bind(segment.interval.start_millis())
        .bind(segment.interval.end_millis())
        .bind(segment.version.as_str())
        .bind(i64::from(segment.shard_spec.partition_num()))
        .bind(segment.num_rows as i64)
        .bind(schema_fingerprint)
        .bind(payload)
        .bind(Utc::now())
        .execute(executor)
        .await?;

    Ok(())
}

/// Returns `(id, version)` of a used segment with a version above `version` that overlaps
/// `interval`, if there is one.
pub async fn find_newer_overlapping<'e, E>(
    executor: E,
    datasource: &str,
    interval: &Interval,
    version: &str,
) -> Result<Option<(String, String)>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let query = indoc::indoc! {r#"
        SELECT id, version
        FROM segments
        WHERE datasource = ?1
          AND used = TRUE
          AND version > ?2
          AND interval_start < ?4
          AND ?3 < interval_end
        ORDER BY version DESC
        LIMIT 1
    "#};

    sqlx::query_as(query)
        .bind(datasource)
        .bind(version)
        .bind(interval.start_millis())
        .bind(interval.end_millis())
        .fetch_optional(executor)
        .await
}

/// Marks used segments with a version below `version` that lie within `interval` unused.
///
/// Returns the ids of the segments that changed.
pub async fn mark_overshadowed_unused<'e, E>(
    executor: E,
    datasource: &str,
    interval: &Interval,
    version: &str,
) -> Result<Vec<String>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let query = indoc::indoc! {r#"
        UPDATE segments
        SET used = FALSE, used_updated_date = ?5
        WHERE datasource = ?1
          AND used = TRUE
          AND version < ?2
          AND interval_start >= ?3
          AND interval_end <= ?4
        RETURNING id
    "#};

    sqlx::query_scalar(query)
        .bind(datasource)
        .bind(version)
        .bind(interval.start_millis())
        .bind(interval.end_millis())
        .bind(Utc::now())
        .fetch_all(executor)
        .await
}

pub async fn list_used_payloads<'e, E>(
    executor: E,
    datasource: &str,
    interval: &Interval,
) -> Result<Vec<String>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let query = indoc::indoc! {r#"
        SELECT payload
        FROM segments
        WHERE datasource = ?1
          AND used = TRUE
          AND interval_start < ?3
          AND ?2 < interval_end
        ORDER BY interval_start, interval_end, version, partition_num
    "#};

    sqlx::query_scalar(query)
        .bind(datasource)
        .bind(interval.start_millis())
        .bind(interval.end_millis())
        .fetch_all(executor)
        .await
}

pub async fn list_all_used_payloads<'e, E>(executor: E) -> Result<Vec<String>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let query = indoc::indoc! {r#"
        SELECT payload
        FROM segments
        WHERE used = TRUE
        ORDER BY datasource, interval_start, interval_end, version, partition_num
    "#};

    sqlx::query_scalar(query).fetch_all(executor).await
}

pub async fn get_by_identity<'e, E>(
    executor: E,
    id: &SegmentId,
) -> Result<Option<SegmentRow>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let query = indoc::indoc! {r#"
        SELECT payload, used, schema_fingerprint
        FROM segments
        WHERE datasource = ?1
          AND interval_start = ?2
          AND interval_end = ?3
          AND version = ?4
          AND partition_num = ?5
    "#};

    sqlx::query_as(query)
        .bind(id.data_source.as_str())
        .bind(id.interval.start_millis())
        .bind(id.interval.end_millis())
        .bind(id.version.as_str())
        .bind(i64::from(id.partition_num))
        .fetch_optional(executor)
        .await
}

pub async fn mark_datasource_unused<'e, E>(
    executor: E,
    datasource: &str,
) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let query = indoc::indoc! {r#"
        UPDATE segments
        SET used = FALSE, used_updated_date = ?2
        WHERE datasource = ?1 AND used = TRUE
    "#};

    let result = sqlx::query(query)
        .bind(datasource)
        .bind(Utc::now())
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}
