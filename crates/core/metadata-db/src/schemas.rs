//! Segment schema records, stored once per content fingerprint.

use chrono::Utc;
use common::{SchemaFingerprint, SchemaPayload};
use tracing::instrument;

use crate::{Error, MetadataDb};

/// Looks up the schema payload stored under `fingerprint`.
#[instrument(skip(db), err)]
pub async fn get_by_fingerprint(
    db: &MetadataDb,
    fingerprint: &SchemaFingerprint,
) -> Result<Option<SchemaPayload>, Error> {
    let payload = sql::get_payload(db.pool(), fingerprint.as_str())
        .await
        .map_err(Error::DbError)?;

    payload
        .map(|payload| serde_json::from_str(&payload))
        .transpose()
        .map_err(Error::PayloadError)
}

/// Number of stored schema records.
pub async fn count(db: &MetadataDb) -> Result<i64, Error> {
    sql::count(db.pool()).await.map_err(Error::DbError)
}

pub(crate) mod sql {
    use super::*;

    /// Inserts a schema record. A record with the same fingerprint is left untouched.
    pub async fn insert<'e, E>(
        executor: E,
        fingerprint: &str,
        payload: &str,
    ) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let query = indoc::indoc! {r#"
            INSERT INTO segment_schemas (fingerprint, payload, created_date)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (fingerprint) DO NOTHING
        "#};

        sqlx::query(query)
            .bind(fingerprint)
            .bind(payload)
            .bind(Utc::now())
            .execute(executor)
            .await?;

        Ok(())
    }

    pub async fn get_payload<'e, E>(
        executor: E,
        fingerprint: &str,
    ) -> Result<Option<String>, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let query = "SELECT payload FROM segment_schemas WHERE fingerprint = ?1";

        sqlx::query_scalar(query)
            .bind(fingerprint)
            .fetch_optional(executor)
            .await
    }

    pub async fn count<'e, E>(executor: E) -> Result<i64, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query_scalar("SELECT COUNT(*) FROM segment_schemas")
            .fetch_one(executor)
            .await
    }
}
