use std::{str::FromStr, sync::Arc, time::Duration};

use sqlx::{
    Sqlite, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::instrument;

mod error;
pub mod schemas;
pub mod segments;

pub use self::{
    error::Error,
    segments::{CommitError, CommitOutcome, NewSegment, SegmentRecord},
};

/// Default pool size for the metadata DB.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// URL of a private in-memory database.
pub const IN_MEMORY_URL: &str = "sqlite::memory:";

static MIGRATOR: Migrator = sqlx::migrate!();

/// A transaction on the metadata DB. Rolls back when dropped without `commit`.
pub type Transaction = sqlx::Transaction<'static, Sqlite>;

/// Connection pool to the metadata DB. Clones will refer to the same instance.
#[derive(Clone, Debug)]
pub struct MetadataDb {
    pool: SqlitePool,
    url: Arc<str>,
}

impl MetadataDb {
    /// Sets up a connection pool to the metadata DB and runs migrations if necessary.
    ///
    /// An in-memory database only lives as long as its connection, so for in-memory URLs the pool
    /// keeps exactly one connection open forever, whatever `pool_size` says.
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, Error> {
        let in_memory = is_in_memory(url);
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(Error::ConnectionError)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(pool_size.max(1))
                .acquire_timeout(Duration::from_secs(5))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(Error::ConnectionError)?;
        MIGRATOR.run(&pool).await.map_err(Error::MigrationError)?;

        Ok(Self {
            pool,
            url: url.into(),
        })
    }

    /// Like [`MetadataDb::connect`], retrying transient connection failures with exponential
    /// backoff.
    #[instrument(skip_all, err)]
    pub async fn connect_with_retry(url: &str, pool_size: u32) -> Result<Self, Error> {
        use backon::{ExponentialBuilder, Retryable};

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(10);

        fn notify_retry(err: &Error, dur: Duration) {
            tracing::warn!(
                error = %err,
                "Failed to connect to metadata db. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        }

        (|| Self::connect(url, pool_size))
            .retry(retry_policy)
            .when(Error::is_connection_error)
            .notify(notify_retry)
            .await
    }

    /// Opens a fresh private in-memory database.
    pub async fn in_memory() -> Result<Self, Error> {
        Self::connect(IN_MEMORY_URL, 1).await
    }

    /// Begins a new database transaction.
    #[instrument(skip(self), err)]
    pub async fn begin_txn(&self) -> Result<Transaction, Error> {
        self.pool.begin().await.map_err(Error::DbError)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}
